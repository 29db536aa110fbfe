//! Journal writer
//!
//! Handles appending records to the journal file.
//!
//! A record either lands whole or not at all: if a write fails halfway, the
//! file is cut back to the end of the last good record before the error is
//! returned. When even that fails the writer refuses further appends, since
//! anything written after a torn record would be dropped by recovery.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use super::{JournalEntry, JournalEvent, JournalRecovery, RecoveryResult};
use crate::config::JournalSync;
use crate::error::{Result, SatError};
use crate::protocol::CommandKind;
use crate::session::SessionNumber;

/// Appends records to the journal file
pub struct JournalWriter {
    writer: BufWriter<File>,
    path: PathBuf,

    /// LSN the next record gets
    next_lsn: u64,

    /// File length up to the end of the last complete record
    good_len: u64,

    /// Set when a torn record could not be removed
    failed: bool,

    sync: JournalSync,

    /// Records written since the last fsync
    unsynced: usize,
}

impl JournalWriter {
    /// Open or create a journal, dropping any torn tail first
    pub fn open(path: &Path, sync: JournalSync) -> Result<Self> {
        let (_, recovered) = JournalRecovery::recover(path)?;
        Self::resume(path, sync, &recovered)
    }

    /// Open a journal that was just recovered
    pub(crate) fn resume(path: &Path, sync: JournalSync, recovered: &RecoveryResult) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let good_len = file.metadata()?.len();
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            next_lsn: recovered.last_lsn + 1,
            good_len,
            failed: false,
            sync,
            unsynced: 0,
        })
    }

    /// Append a record, returning its LSN
    pub fn append(
        &mut self,
        session: SessionNumber,
        kind: CommandKind,
        event: JournalEvent,
    ) -> Result<u64> {
        self.append_entry(JournalEntry::new(self.next_lsn, session, kind, event))
    }

    /// Append a record taken from another journal, keeping its timestamp
    pub(crate) fn carry_over(&mut self, entry: &JournalEntry) -> Result<u64> {
        self.append_entry(JournalEntry {
            lsn: self.next_lsn,
            ..entry.clone()
        })
    }

    fn append_entry(&mut self, entry: JournalEntry) -> Result<u64> {
        if self.failed {
            return Err(SatError::JournalFailed(self.path.display().to_string()));
        }

        let bytes = entry.serialize()?;
        if let Err(e) = self.write_record(&bytes) {
            if let Err(undo) = self.roll_back() {
                tracing::error!(
                    "Journal {}: could not remove torn record {}: {}",
                    self.path.display(),
                    entry.lsn,
                    undo
                );
                self.failed = true;
            }
            return Err(e);
        }

        self.next_lsn += 1;
        self.good_len += bytes.len() as u64;
        tracing::trace!(
            "Journal LSN {}: session {} {} {:?}",
            entry.lsn,
            entry.session,
            entry.kind,
            entry.event
        );
        Ok(entry.lsn)
    }

    fn write_record(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer.write_all(bytes)?;
        self.unsynced += 1;

        let due = match self.sync {
            JournalSync::EveryWrite => true,
            JournalSync::EveryNEntries { count } => self.unsynced >= count.max(1),
        };
        if due {
            self.sync()
        } else {
            self.writer.flush().map_err(Into::into)
        }
    }

    /// Drop whatever part of a record is buffered or on disk past `good_len`
    fn roll_back(&mut self) -> Result<()> {
        let file = self.writer.get_ref().try_clone()?;
        let stale = std::mem::replace(&mut self.writer, BufWriter::new(file));
        // into_parts hands back the file without flushing the partial record
        let (file, _) = stale.into_parts();
        file.set_len(self.good_len)?;
        file.sync_all()?;
        self.unsynced = 0;
        tracing::warn!(
            "Journal {} rolled back to {} bytes",
            self.path.display(),
            self.good_len
        );
        Ok(())
    }

    /// Force buffered records to disk
    pub fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        self.unsynced = 0;
        Ok(())
    }

    /// LSN the next record will get
    pub fn current_lsn(&self) -> u64 {
        self.next_lsn
    }

    /// Whether the writer stopped accepting records
    pub fn is_failed(&self) -> bool {
        self.failed
    }
}

impl Drop for JournalWriter {
    fn drop(&mut self) {
        if self.unsynced > 0 && !self.failed {
            if let Err(e) = self.sync() {
                tracing::warn!("Failed to sync journal on close: {}", e);
            }
        }
    }
}
