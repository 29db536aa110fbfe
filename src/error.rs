//! Error types for the SAT protocol core
//!
//! Provides a unified error type for local contract violations. Failures of a
//! whole command round trip are reported as [`crate::executor::ExecutionError`].

use thiserror::Error;

use crate::session::SessionNumber;
use crate::transport::LinkFault;

/// Result type alias using SatError
pub type Result<T> = std::result::Result<T, SatError>;

/// Unified error type for codec, tracker, transport and journal operations
#[derive(Debug, Error)]
pub enum SatError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Codec Errors
    // -------------------------------------------------------------------------
    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Response is not valid UTF-8 at byte {valid_up_to}")]
    EncodingNotUtf8 { valid_up_to: usize },

    // -------------------------------------------------------------------------
    // Session Errors
    // -------------------------------------------------------------------------
    #[error("Session {0} is already pending")]
    SessionAlreadyPending(SessionNumber),

    #[error("Unknown session {0}")]
    UnknownSession(SessionNumber),

    #[error("No free session number left")]
    SessionSpaceExhausted,

    // -------------------------------------------------------------------------
    // Transport Errors
    // -------------------------------------------------------------------------
    #[error("Link fault: {0}")]
    Link(LinkFault),

    // -------------------------------------------------------------------------
    // Journal Errors
    // -------------------------------------------------------------------------
    #[error("Journal corruption detected: {0}")]
    JournalCorruption(String),

    #[error("Journal {0} is closed after a write it could not undo")]
    JournalFailed(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<bincode::Error> for SatError {
    fn from(err: bincode::Error) -> Self {
        SatError::Serialization(err.to_string())
    }
}
