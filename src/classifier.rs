//! Response classification
//!
//! Maps the `EEEEE` status code of a response to an [`Outcome`] through a
//! lookup table. The table is plain data: a new revision of the status
//! tables only needs a new set of [`StatusRule`]s.
//!
//! ## Default Table
//! For every command family `FF` (`04`..`19`):
//! - `FF000` success
//! - `FF001..=FF097` functional rejection
//! - `FF098` (device busy) and `FF099` (unknown error) protocol error
//!
//! plus `04001` (ICP-Brasil CSR created), which also counts as a
//! successful activation. Codes outside every rule are protocol errors.

use std::collections::HashMap;
use std::ops::RangeInclusive;

use serde::{Deserialize, Serialize};

use crate::protocol::{CommandKind, StatusCode};

/// Semantic result of a response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Outcome {
    /// The command did what it was asked to
    Success,

    /// The device understood the command and refused it
    FunctionalRejection(StatusCode),

    /// The response cannot be taken as an answer (busy, unknown error,
    /// unmapped code); worth retrying when the command allows it
    ProtocolError,
}

impl Outcome {
    pub fn is_success(self) -> bool {
        self == Outcome::Success
    }

    pub fn is_terminal_failure(self) -> bool {
        matches!(self, Outcome::FunctionalRejection(_))
    }
}

/// Classification rule for one status family
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusRule {
    pub family: u8,

    /// Suffixes meaning success
    pub success: Vec<u16>,

    /// Suffixes meaning a functional rejection
    pub rejections: RangeInclusive<u16>,

    /// Suffixes meaning the device could not answer now; checked before
    /// `rejections`
    pub transient: Vec<u16>,
}

impl StatusRule {
    /// Rule with the usual shape: `000` success, `001..=097` rejections,
    /// `098` and `099` transient
    pub fn standard(family: u8) -> Self {
        Self {
            family,
            success: vec![0],
            rejections: 1..=97,
            transient: vec![codes::BUSY_SUFFIX, codes::UNKNOWN_ERROR_SUFFIX],
        }
    }

    /// Add another success suffix
    pub fn with_success(mut self, suffix: u16) -> Self {
        self.success.push(suffix);
        self
    }
}

/// Status code lookup table
#[derive(Debug, Clone)]
pub struct StatusTable {
    rules: HashMap<u8, StatusRule>,
}

impl StatusTable {
    /// Build a table from rules; a later rule for the same family wins
    pub fn new(rules: impl IntoIterator<Item = StatusRule>) -> Self {
        Self {
            rules: rules.into_iter().map(|rule| (rule.family, rule)).collect(),
        }
    }

    /// Classify a status code
    pub fn classify(&self, status: StatusCode) -> Outcome {
        let Some(rule) = self.rules.get(&status.family()) else {
            return Outcome::ProtocolError;
        };

        let suffix = status.suffix();
        if rule.success.contains(&suffix) {
            Outcome::Success
        } else if rule.transient.contains(&suffix) {
            Outcome::ProtocolError
        } else if rule.rejections.contains(&suffix) {
            Outcome::FunctionalRejection(status)
        } else {
            Outcome::ProtocolError
        }
    }

    /// Rule for a family, if any
    pub fn rule(&self, family: u8) -> Option<&StatusRule> {
        self.rules.get(&family)
    }
}

impl Default for StatusTable {
    fn default() -> Self {
        Self::new(CommandKind::ALL.into_iter().map(|kind| {
            let rule = StatusRule::standard(kind.family());
            match kind {
                // CSR ICP-Brasil criado com sucesso
                CommandKind::Activate => rule.with_success(1),
                _ => rule,
            }
        }))
    }
}

/// Well-known status codes
pub mod codes {
    /// ConsultarSAT: SAT em operação
    pub const SAT_IN_OPERATION: u32 = 8000;
    /// AtivarSAT: SAT ativado corretamente
    pub const ACTIVATED: u32 = 4000;
    /// AtivarSAT: CSR ICP-Brasil criado com sucesso
    pub const ICP_CSR_CREATED: u32 = 4001;
    /// ConsultarNumeroSessao: sessão não existe
    pub const SESSION_NOT_FOUND: u32 = 11003;
    /// Suffix meaning the device is busy
    pub const BUSY_SUFFIX: u16 = 98;
    /// Suffix meaning an unknown device error
    pub const UNKNOWN_ERROR_SUFFIX: u16 = 99;
}
