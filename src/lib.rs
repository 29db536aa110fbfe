//! # satcfe
//!
//! Protocol core for SAT-CF-e fiscal devices:
//! - Wire codec for the `|`-separated request and response lines
//! - Status classification through a data-driven table
//! - Session numbering and tracking, with re-queries of past sessions
//! - Command execution with timeouts, cancellation and safe retries
//! - Optional session journal so in-doubt sessions survive a restart
//! - Operator alerts derived from the operational status
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        SatClient                             │
//! │               (one method per SAT function)                  │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                    CommandExecutor                           │
//! │        (one command in flight, retries, late frames)         │
//! └──────┬──────────────┬──────────────────┬────────────────────┘
//!        │              │                  │
//!        ▼              ▼                  ▼
//! ┌─────────────┐ ┌─────────────┐  ┌──────────────┐
//! │  Protocol   │ │  Sessions   │  │ ExchangeLog  │
//! │   (codec)   │ │  (RwLock)   │  │  (journal)   │
//! └─────────────┘ └─────────────┘  └──────────────┘
//!        │
//!        ▼
//! ┌─────────────┐
//! │  Transport  │
//! │  (device)   │
//! └─────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod protocol;
pub mod classifier;
pub mod session;
pub mod transport;
pub mod exchange;
pub mod journal;
pub mod executor;
pub mod client;
pub mod alerts;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use alerts::{Alert, AlertKind, AlertRegistry};
pub use error::{Result, SatError};
pub use config::Config;
pub use classifier::{Outcome, StatusTable};
pub use client::SatClient;
pub use executor::{CancelToken, CommandExecutor, ExecutionError};
pub use protocol::{CommandKind, CommandRequest, CommandResponse, StatusCode};
pub use session::{SessionNumber, SessionState, SessionTracker};
pub use transport::{LinkFault, Transport};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of satcfe
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
