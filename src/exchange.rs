//! Exchange log and certificate source
//!
//! Collaborators injected into the executor and the client. Neither one
//! takes part in the protocol itself.

use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;

use crate::classifier::Outcome;
use crate::error::{Result, SatError};
use crate::protocol::{CommandKind, StatusCode};
use crate::session::SessionNumber;

// =============================================================================
// Exchange Log
// =============================================================================

/// What happened to a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeEvent {
    /// The request line is about to be handed to the transport
    Sent { frame: Bytes },

    /// A `Sent` request never left: the send failed or the command was
    /// cancelled first
    Withdrawn,

    /// A response for the session arrived and was classified
    Received {
        frame: Bytes,
        status: StatusCode,
        outcome: Outcome,
    },

    /// No answer in time (or the caller gave up); the outcome is unknown
    Expired,

    /// The real outcome of an expired session was learned later
    Resolved { status: StatusCode, outcome: Outcome },

    /// A frame that matched no session in flight
    Stray { frame: Bytes },
}

/// One logged event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exchange {
    pub session: SessionNumber,
    pub kind: CommandKind,
    pub event: ExchangeEvent,
}

impl Exchange {
    pub fn new(session: SessionNumber, kind: CommandKind, event: ExchangeEvent) -> Self {
        Self {
            session,
            kind,
            event,
        }
    }
}

/// Sink for session events
///
/// `Sent` is recorded before the frame leaves; an error there aborts the
/// command before anything reaches the device.
pub trait ExchangeLog: Send + Sync {
    fn record(&self, exchange: &Exchange) -> Result<()>;
}

impl<L: ExchangeLog + ?Sized> ExchangeLog for Arc<L> {
    fn record(&self, exchange: &Exchange) -> Result<()> {
        (**self).record(exchange)
    }
}

impl<L: ExchangeLog + ?Sized> ExchangeLog for Box<L> {
    fn record(&self, exchange: &Exchange) -> Result<()> {
        (**self).record(exchange)
    }
}

/// Both logs, in order; the first error wins
impl<A: ExchangeLog, B: ExchangeLog> ExchangeLog for (A, B) {
    fn record(&self, exchange: &Exchange) -> Result<()> {
        self.0.record(exchange)?;
        self.1.record(exchange)
    }
}

/// Logs every exchange through `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLog;

impl ExchangeLog for TracingLog {
    fn record(&self, exchange: &Exchange) -> Result<()> {
        let Exchange {
            session,
            kind,
            event,
        } = exchange;
        match event {
            ExchangeEvent::Sent { frame } => {
                tracing::debug!("[{}] {} >> {}", session, kind, String::from_utf8_lossy(frame));
            }
            ExchangeEvent::Received {
                frame,
                status,
                outcome,
            } => {
                tracing::debug!(
                    "[{}] {} << {} ({}, {:?})",
                    session,
                    kind,
                    String::from_utf8_lossy(frame),
                    status,
                    outcome
                );
            }
            ExchangeEvent::Withdrawn => {
                tracing::debug!("[{}] {} withdrawn before sending", session, kind);
            }
            ExchangeEvent::Expired => {
                tracing::warn!("[{}] {} expired without an answer", session, kind);
            }
            ExchangeEvent::Resolved { status, outcome } => {
                tracing::info!("[{}] {} resolved late: {} ({:?})", session, kind, status, outcome);
            }
            ExchangeEvent::Stray { frame } => {
                tracing::warn!(
                    "[{}] {} ignored stray frame {}",
                    session,
                    kind,
                    String::from_utf8_lossy(frame)
                );
            }
        }
        Ok(())
    }
}

// =============================================================================
// Certificate Source
// =============================================================================

/// Supplies the certificate sent by ComunicarCertificadoICPBRASIL
///
/// The certificate is opaque text to this crate.
pub trait CertificateSource {
    fn certificate(&self) -> Result<String>;
}

/// A certificate held in memory
#[derive(Debug, Clone)]
pub struct StaticCertificate(pub String);

impl CertificateSource for StaticCertificate {
    fn certificate(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}

/// A certificate read from a file on every call
#[derive(Debug, Clone)]
pub struct FileCertificate {
    path: PathBuf,
}

impl FileCertificate {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl CertificateSource for FileCertificate {
    fn certificate(&self) -> Result<String> {
        let text = std::fs::read_to_string(&self.path)?;
        let certificate = text.trim();
        if certificate.is_empty() {
            return Err(SatError::Config(format!(
                "certificate file {} is empty",
                self.path.display()
            )));
        }
        Ok(certificate.to_string())
    }
}
