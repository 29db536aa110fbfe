//! Session Journal Module
//!
//! Makes session numbers survive a restart.
//!
//! ## Responsibilities
//! - Append a record for every session transition, before the frame leaves
//! - CRC32 checksums for corruption detection
//! - Log Sequence Numbers (LSN) for ordering
//! - Recovery: last issued session and the sessions still in doubt
//!
//! ## File Format
//! ```text
//! ┌─────────────────────────────────────────┐
//! │ Record 1                                │
//! │ ┌─────────┬─────────┬────────┬────────┐ │
//! │ │ LSN (8) │ CRC (4) │Len (4) │ Data   │ │
//! │ └─────────┴─────────┴────────┴────────┘ │
//! ├─────────────────────────────────────────┤
//! │ Record 2                                │
//! │ ┌─────────┬─────────┬────────┬────────┐ │
//! │ │ LSN (8) │ CRC (4) │Len (4) │ Data   │ │
//! │ └─────────┴─────────┴────────┴────────┘ │
//! └─────────────────────────────────────────┘
//! ```
//! Data is a bincode [`JournalEntry`]; the CRC covers the data only.

mod entry;
mod reader;
mod recovery;
mod writer;
mod log;

pub use entry::{JournalEntry, JournalEvent, HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use reader::{JournalIterator, JournalReader};
pub use recovery::{JournalRecovery, RecoveryResult};
pub use writer::JournalWriter;
pub use log::SessionJournal;
