//! Session Module
//!
//! Session numbers and their lifecycle.
//!
//! ## Responsibilities
//! - Allocate session numbers that are never reused while in flight
//! - Track which command each session carries
//! - Answer re-queries about past sessions (`ConsultarNumeroSessao`)
//!
//! ## Lifecycle
//! ```text
//!   begin ──► Pending ──complete──► Completed
//!                │                      ▲
//!              expire                   │ late response / re-query
//!                ▼                      │
//!             Expired ──────────────────┘
//! ```

mod tracker;

use serde::{Deserialize, Serialize};

pub use tracker::{Session, SessionState, SessionTracker};

/// Width of a session number on the wire
pub const SESSION_WIDTH: usize = 6;

/// A SAT session number (`000001..=999999`)
///
/// `0` is reserved and never issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionNumber(u32);

impl SessionNumber {
    pub const MIN: u32 = 1;
    pub const MAX: u32 = 999_999;

    pub fn new(value: u32) -> Option<Self> {
        (Self::MIN..=Self::MAX)
            .contains(&value)
            .then_some(SessionNumber(value))
    }

    /// Parse 1 to 6 ASCII digits
    pub fn parse(field: &str) -> Option<Self> {
        if field.is_empty()
            || field.len() > SESSION_WIDTH
            || !field.bytes().all(|b| b.is_ascii_digit())
        {
            return None;
        }
        field.parse().ok().and_then(Self::new)
    }

    pub fn value(self) -> u32 {
        self.0
    }

    /// Next number in sequence, wrapping from 999999 back to 1
    pub fn next(self) -> Self {
        if self.0 >= Self::MAX {
            SessionNumber(Self::MIN)
        } else {
            SessionNumber(self.0 + 1)
        }
    }
}

impl std::fmt::Display for SessionNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:06}", self.0)
    }
}

/// Milliseconds since the unix epoch
pub(crate) fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
