//! Journal recovery
//!
//! Rebuilds session state after a restart by scanning the journal.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::Path;

use super::{JournalEntry, JournalEvent, JournalReader, JournalWriter};
use crate::config::JournalSync;
use crate::error::{Result, SatError};
use crate::protocol::CommandKind;
use crate::session::SessionNumber;

/// Handles journal recovery after a crash
pub struct JournalRecovery;

/// Result of a recovery operation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryResult {
    /// Number of records successfully recovered
    pub entries_recovered: u64,

    /// Number of corrupted records found (scanning stops at the first)
    pub entries_corrupted: u64,

    /// Last valid LSN (0 for an empty journal)
    pub last_lsn: u64,

    /// Whether bytes after the last good record were found (and, for
    /// `recover`, removed)
    pub was_truncated: bool,

    /// Session of the most recent `Sent` record
    pub last_issued: Option<SessionNumber>,

    /// Sessions whose last record is `Sent` or `Expired`, by session number
    pub in_doubt: Vec<(SessionNumber, CommandKind)>,
}

impl JournalRecovery {
    /// Recover records from a journal file
    ///
    /// This will:
    /// 1. Read all valid records
    /// 2. Stop at the first torn or corrupted record
    /// 3. Truncate the file after the last good record
    /// 4. Return the records in order with the session summary
    ///
    /// A missing file is an empty journal.
    pub fn recover(path: &Path) -> Result<(Vec<JournalEntry>, RecoveryResult)> {
        let (entries, result, good_len) = Self::scan(path)?;

        if result.was_truncated {
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(good_len)?;
            file.sync_all()?;
            tracing::warn!(
                "Journal {} truncated to {} bytes after LSN {}",
                path.display(),
                good_len,
                result.last_lsn
            );
        }

        tracing::debug!(
            "Journal recovered: {} records, {} in doubt",
            result.entries_recovered,
            result.in_doubt.len()
        );
        Ok((entries, result))
    }

    /// Same scan as `recover`, without modifying the file
    pub fn verify(path: &Path) -> Result<RecoveryResult> {
        Self::scan(path).map(|(_, result, _)| result)
    }

    /// Recover, then rewrite the journal without records recovery no longer
    /// needs
    ///
    /// Kept records: the last one of every in-doubt session, and everything
    /// from the last `Sent` record or the `keep_recent` newest records,
    /// whichever reaches further back. The summary is unchanged by the
    /// rewrite. LSNs are renumbered from 1. The new file is written next to
    /// the old one and renamed over it, so a crash leaves one or the other.
    pub fn compact(path: &Path, keep_recent: usize) -> Result<(Vec<JournalEntry>, RecoveryResult)> {
        let (entries, result) = Self::recover(path)?;

        let last_sent = entries.iter().rposition(|e| e.event == JournalEvent::Sent);
        let tail_start = entries
            .len()
            .saturating_sub(keep_recent)
            .min(last_sent.unwrap_or(entries.len()));

        let mut last_index: HashMap<SessionNumber, usize> = HashMap::new();
        for (i, entry) in entries.iter().enumerate() {
            last_index.insert(entry.session, i);
        }
        let kept: Vec<JournalEntry> = entries
            .into_iter()
            .enumerate()
            .filter(|(i, entry)| {
                *i >= tail_start || (last_index[&entry.session] == *i && entry.event.is_in_doubt())
            })
            .map(|(_, entry)| entry)
            .collect();

        if kept.len() as u64 == result.entries_recovered {
            return Ok((kept, result));
        }

        let staging = path.with_extension("compacting");
        if staging.exists() {
            std::fs::remove_file(&staging)?;
        }
        {
            let mut writer = JournalWriter::resume(
                &staging,
                JournalSync::EveryNEntries { count: usize::MAX },
                &RecoveryResult::default(),
            )?;
            for entry in &kept {
                writer.carry_over(entry)?;
            }
            writer.sync()?;
        }
        std::fs::rename(&staging, path)?;

        tracing::info!(
            "Journal {} compacted from {} to {} records",
            path.display(),
            result.entries_recovered,
            kept.len()
        );

        let kept: Vec<JournalEntry> = kept
            .into_iter()
            .zip(1u64..)
            .map(|(entry, lsn)| JournalEntry { lsn, ..entry })
            .collect();
        let mut compacted = RecoveryResult {
            entries_recovered: kept.len() as u64,
            last_lsn: kept.len() as u64,
            ..RecoveryResult::default()
        };
        summarize(&kept, &mut compacted);
        Ok((kept, compacted))
    }

    fn scan(path: &Path) -> Result<(Vec<JournalEntry>, RecoveryResult, u64)> {
        let mut result = RecoveryResult::default();
        if !path.exists() {
            return Ok((Vec::new(), result, 0));
        }

        let file_len = std::fs::metadata(path)?.len();
        let mut reader = JournalReader::open(path)?;
        let mut entries = Vec::new();

        loop {
            match reader.next_entry() {
                Ok(Some(entry)) => {
                    result.entries_recovered += 1;
                    result.last_lsn = entry.lsn;
                    entries.push(entry);
                }
                Ok(None) => break,
                Err(SatError::JournalCorruption(reason)) | Err(SatError::Serialization(reason)) => {
                    tracing::warn!("Journal corruption after LSN {}: {}", result.last_lsn, reason);
                    result.entries_corrupted += 1;
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        let good_len = reader.position();
        result.was_truncated = file_len > good_len;
        summarize(&entries, &mut result);
        Ok((entries, result, good_len))
    }
}

/// Fill in the session summary from the records, oldest first
fn summarize(entries: &[JournalEntry], result: &mut RecoveryResult) {
    let mut last_event: HashMap<SessionNumber, (CommandKind, JournalEvent)> = HashMap::new();
    for entry in entries {
        if entry.event == JournalEvent::Sent {
            result.last_issued = Some(entry.session);
        }
        last_event.insert(entry.session, (entry.kind, entry.event));
    }

    let mut in_doubt: Vec<_> = last_event
        .into_iter()
        .filter(|(_, (_, event))| event.is_in_doubt())
        .map(|(session, (kind, _))| (session, kind))
        .collect();
    in_doubt.sort_unstable();
    result.in_doubt = in_doubt;
}
