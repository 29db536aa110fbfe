//! Response definitions
//!
//! Represents responses returned by the SAT.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use super::datetime::parse_datetime;
use super::CommandKind;
use crate::error::Result;
use crate::session::SessionNumber;

/// Width of the `EEEEE` status field
pub const STATUS_WIDTH: usize = 5;

/// The 5-digit `EEEEE` status code
///
/// The two leading digits name the command family, the last three the
/// result within that family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StatusCode(u32);

impl StatusCode {
    pub const MAX: u32 = 99_999;

    /// Build from a numeric code; `None` above 99999
    pub fn new(code: u32) -> Option<Self> {
        (code <= Self::MAX).then_some(StatusCode(code))
    }

    /// Parse exactly five ASCII digits
    pub fn parse(field: &str) -> Option<Self> {
        if field.len() != STATUS_WIDTH || !field.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        field.parse().ok().map(StatusCode)
    }

    /// Status code `family * 1000 + suffix`
    pub fn from_parts(family: u8, suffix: u16) -> Option<Self> {
        if suffix > 999 {
            return None;
        }
        Self::new(u32::from(family) * 1000 + u32::from(suffix))
    }

    /// Status within a command's family; suffixes above 999 saturate
    pub fn in_family(kind: CommandKind, suffix: u16) -> Self {
        StatusCode(u32::from(kind.family()) * 1000 + u32::from(suffix.min(999)))
    }

    pub fn value(self) -> u32 {
        self.0
    }

    /// Two leading digits
    pub fn family(self) -> u8 {
        (self.0 / 1000) as u8
    }

    /// Three trailing digits
    pub fn suffix(self) -> u16 {
        (self.0 % 1000) as u16
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:05}", self.0)
    }
}

/// Tax authority (SEFAZ) sub-fields `cod` and `mensagemSEFAZ`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SefazReply {
    pub code: String,
    pub message: String,
}

/// A decoded SAT response
#[derive(Debug, Clone)]
pub struct CommandResponse {
    /// Session number echoed by the device
    pub session: SessionNumber,

    pub status: StatusCode,

    /// Command whose layout the response follows; differs from the request
    /// kind when a re-query returns another command's stored response
    pub command: CommandKind,

    /// `CCCC` alert code (sale, cancellation and signature responses only)
    pub alert_code: Option<String>,

    pub message: String,

    /// `None` when both SEFAZ fields are empty
    pub sefaz: Option<SefazReply>,

    /// Command-specific trailing fields, in wire order
    pub fields: Vec<(&'static str, String)>,

    verbatim: Option<String>,
}

impl CommandResponse {
    /// Create a response with the standard five fields
    pub fn new(
        command: CommandKind,
        session: SessionNumber,
        status: StatusCode,
        message: impl Into<String>,
    ) -> Self {
        Self {
            session,
            status,
            command,
            alert_code: None,
            message: message.into(),
            sefaz: None,
            fields: Vec::new(),
            verbatim: None,
        }
    }

    /// Set the `CCCC` alert code
    pub fn with_alert_code(mut self, code: impl Into<String>) -> Self {
        self.alert_code = Some(code.into());
        self
    }

    /// Set the SEFAZ sub-fields
    pub fn with_sefaz(mut self, code: impl Into<String>, message: impl Into<String>) -> Self {
        self.sefaz = Some(SefazReply {
            code: code.into(),
            message: message.into(),
        });
        self
    }

    /// Append a trailing field
    pub fn with_field(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.fields.push((name, value.into()));
        self
    }

    pub(crate) fn set_verbatim(&mut self, line: String) {
        self.verbatim = Some(line);
    }

    /// Look a trailing field up by its layout name (eg. `"CSR"`)
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(field, _)| *field == name)
            .map(|(_, value)| value.as_str())
    }

    /// Device time of a sale, cancellation or end-to-end test
    ///
    /// `None` when the layout has no `timeStamp` field or it is blank, as in
    /// a failed sale.
    pub fn timestamp(&self) -> Result<Option<NaiveDateTime>> {
        match self.field("timeStamp").map(str::trim) {
            Some(value) if !value.is_empty() => parse_datetime("timeStamp", value).map(Some),
            _ => Ok(None),
        }
    }

    /// The line exactly as received, when the response was decoded
    pub fn verbatim(&self) -> Option<&str> {
        self.verbatim.as_deref()
    }
}

// Equality ignores the verbatim copy: two responses are the same when all
// decoded fields are.
impl PartialEq for CommandResponse {
    fn eq(&self, other: &Self) -> bool {
        self.session == other.session
            && self.status == other.status
            && self.command == other.command
            && self.alert_code == other.alert_code
            && self.message == other.message
            && self.sefaz == other.sefaz
            && self.fields == other.fields
    }
}

impl Eq for CommandResponse {}
