//! Session journal
//!
//! Adapts the journal writer to the executor's exchange log.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use super::{JournalEvent, JournalRecovery, JournalWriter, RecoveryResult};
use crate::config::JournalSync;
use crate::error::Result;
use crate::exchange::{Exchange, ExchangeEvent, ExchangeLog};

/// Durable record of session transitions
///
/// Only the events needed to rebuild the tracker are written: stray frames
/// are not.
pub struct SessionJournal {
    writer: Mutex<JournalWriter>,
    path: PathBuf,
}

impl SessionJournal {
    /// Open (or create) a journal, recovering what it already holds
    ///
    /// The returned [`RecoveryResult`] seeds a new executor so in-doubt
    /// sessions are neither reissued nor forgotten.
    pub fn open(path: impl AsRef<Path>, sync: JournalSync) -> Result<(Self, RecoveryResult)> {
        let path = path.as_ref();
        let (_, recovered) = JournalRecovery::recover(path)?;
        Self::resume(path, sync, recovered)
    }

    /// Like [`SessionJournal::open`], compacting the journal first
    ///
    /// See [`JournalRecovery::compact`] for what `keep_recent` keeps.
    pub fn open_compacted(
        path: impl AsRef<Path>,
        sync: JournalSync,
        keep_recent: usize,
    ) -> Result<(Self, RecoveryResult)> {
        let path = path.as_ref();
        let (_, recovered) = JournalRecovery::compact(path, keep_recent)?;
        Self::resume(path, sync, recovered)
    }

    fn resume(path: &Path, sync: JournalSync, recovered: RecoveryResult) -> Result<(Self, RecoveryResult)> {
        let writer = JournalWriter::resume(path, sync, &recovered)?;

        tracing::info!(
            "Session journal {} opened at LSN {}",
            path.display(),
            recovered.last_lsn + 1
        );

        Ok((
            Self {
                writer: Mutex::new(writer),
                path: path.to_path_buf(),
            },
            recovered,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Force buffered records to disk
    pub fn sync(&self) -> Result<()> {
        self.writer.lock().sync()
    }

    /// LSN the next record will get
    pub fn current_lsn(&self) -> u64 {
        self.writer.lock().current_lsn()
    }
}

impl ExchangeLog for SessionJournal {
    fn record(&self, exchange: &Exchange) -> Result<()> {
        let event = match &exchange.event {
            ExchangeEvent::Sent { .. } => JournalEvent::Sent,
            ExchangeEvent::Received {
                status, outcome, ..
            }
            | ExchangeEvent::Resolved { status, outcome } => JournalEvent::Completed {
                status: *status,
                outcome: *outcome,
            },
            ExchangeEvent::Expired => JournalEvent::Expired,
            ExchangeEvent::Withdrawn => JournalEvent::Withdrawn,
            ExchangeEvent::Stray { .. } => return Ok(()),
        };

        self.writer
            .lock()
            .append(exchange.session, exchange.kind, event)
            .map(|_| ())
    }
}
