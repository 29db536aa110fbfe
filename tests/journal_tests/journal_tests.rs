//! Tests for the session journal
//!
//! These tests verify:
//! - Record serialization and CRC checks
//! - LSN sequencing across reopen
//! - Recovery from torn tails and corrupted records
//! - The in-doubt session summary
//! - Compaction keeps the summary while dropping settled records
//! - The journal as an exchange log

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use bytes::Bytes;
use satcfe::classifier::Outcome;
use satcfe::config::JournalSync;
use satcfe::exchange::{Exchange, ExchangeEvent, ExchangeLog};
use satcfe::journal::{
    JournalEntry, JournalEvent, JournalReader, JournalRecovery, JournalWriter, SessionJournal,
    HEADER_SIZE,
};
use satcfe::protocol::CommandKind;
use satcfe::{SatError, SessionNumber, StatusCode};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_temp_journal() -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("sessions.journal");
    (temp_dir, path)
}

fn session(n: u32) -> SessionNumber {
    SessionNumber::new(n).unwrap()
}

fn completed(code: u32) -> JournalEvent {
    JournalEvent::Completed {
        status: StatusCode::new(code).unwrap(),
        outcome: Outcome::Success,
    }
}

// =============================================================================
// Entry Tests
// =============================================================================

#[test]
fn test_entry_serialize_deserialize() {
    let entry = JournalEntry::new(7, session(42), CommandKind::SendSaleData, completed(6000));
    let bytes = entry.serialize().unwrap();

    assert_eq!(JournalEntry::deserialize(&bytes).unwrap(), entry);
    assert_eq!(&bytes[0..8], &7u64.to_le_bytes());
}

#[test]
fn test_entry_crc_corruption_detected() {
    let entry = JournalEntry::new(1, session(1), CommandKind::QuerySat, JournalEvent::Sent);
    let mut bytes = entry.serialize().unwrap();
    if let Some(byte) = bytes.last_mut() {
        *byte ^= 0xFF;
    }

    assert!(matches!(
        JournalEntry::deserialize(&bytes),
        Err(SatError::JournalCorruption(_))
    ));
}

#[test]
fn test_entry_truncated() {
    let entry = JournalEntry::new(1, session(1), CommandKind::QuerySat, JournalEvent::Expired);
    let bytes = entry.serialize().unwrap();

    assert!(JournalEntry::deserialize(&bytes[..HEADER_SIZE + 2]).is_err());
    assert!(JournalEntry::deserialize(&bytes[..10]).is_err());
    assert!(JournalEntry::deserialize(&[]).is_err());
}

// =============================================================================
// Writer / Reader Tests
// =============================================================================

#[test]
fn test_lsn_sequencing_across_reopen() {
    let (_temp, path) = setup_temp_journal();

    {
        let mut writer = JournalWriter::open(&path, JournalSync::EveryWrite).unwrap();
        assert_eq!(
            writer
                .append(session(1), CommandKind::QuerySat, JournalEvent::Sent)
                .unwrap(),
            1
        );
        assert_eq!(
            writer
                .append(session(1), CommandKind::QuerySat, completed(8000))
                .unwrap(),
            2
        );
        assert_eq!(writer.current_lsn(), 3);
    }

    let mut writer =
        JournalWriter::open(&path, JournalSync::EveryNEntries { count: 10 }).unwrap();
    assert_eq!(writer.current_lsn(), 3);
    assert_eq!(
        writer
            .append(session(2), CommandKind::Block, JournalEvent::Sent)
            .unwrap(),
        3
    );
}

#[test]
fn test_reader_returns_records_in_order() {
    let (_temp, path) = setup_temp_journal();
    {
        let mut writer = JournalWriter::open(&path, JournalSync::EveryWrite).unwrap();
        for n in 1..=5 {
            writer
                .append(session(n), CommandKind::QuerySat, JournalEvent::Sent)
                .unwrap();
        }
    }

    let reader = JournalReader::open(&path).unwrap();
    let entries: Vec<_> = reader.entries().map(|e| e.unwrap()).collect();
    let lsns: Vec<u64> = entries.iter().map(|e| e.lsn).collect();
    assert_eq!(lsns, vec![1, 2, 3, 4, 5]);
    assert_eq!(entries[4].session, session(5));
}

#[test]
fn test_reader_stops_at_torn_tail() {
    let (_temp, path) = setup_temp_journal();
    let good = JournalEntry::new(1, session(1), CommandKind::QuerySat, JournalEvent::Sent)
        .serialize()
        .unwrap();
    let mut torn = JournalEntry::new(2, session(2), CommandKind::QuerySat, JournalEvent::Sent)
        .serialize()
        .unwrap();
    torn.truncate(HEADER_SIZE + 3);

    let mut file = File::create(&path).unwrap();
    file.write_all(&good).unwrap();
    file.write_all(&torn).unwrap();
    file.sync_all().unwrap();

    let mut reader = JournalReader::open(&path).unwrap();
    assert!(reader.next_entry().unwrap().is_some());
    assert!(reader.next_entry().unwrap().is_none());
    assert_eq!(reader.position(), good.len() as u64);
}

// =============================================================================
// Recovery Tests
// =============================================================================

#[test]
fn test_recover_missing_file() {
    let (_temp, path) = setup_temp_journal();
    let (entries, result) = JournalRecovery::recover(&path).unwrap();

    assert!(entries.is_empty());
    assert_eq!(result.last_lsn, 0);
    assert_eq!(result.last_issued, None);
    assert!(!result.was_truncated);
}

#[test]
fn test_recover_truncates_torn_tail() {
    let (_temp, path) = setup_temp_journal();
    {
        let mut writer = JournalWriter::open(&path, JournalSync::EveryWrite).unwrap();
        writer
            .append(session(1), CommandKind::SendSaleData, JournalEvent::Sent)
            .unwrap();
    }
    let good_len = std::fs::metadata(&path).unwrap().len();
    {
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[0u8; 9]).unwrap();
    }

    let (entries, result) = JournalRecovery::recover(&path).unwrap();
    assert_eq!(entries.len(), 1);
    assert!(result.was_truncated);
    assert_eq!(std::fs::metadata(&path).unwrap().len(), good_len);

    // A second pass finds a clean file
    let result = JournalRecovery::verify(&path).unwrap();
    assert!(!result.was_truncated);
    assert_eq!(result.entries_recovered, 1);
}

#[test]
fn test_recover_stops_at_corruption() {
    let (_temp, path) = setup_temp_journal();
    let first = JournalEntry::new(1, session(1), CommandKind::QuerySat, JournalEvent::Sent)
        .serialize()
        .unwrap();
    let mut second = JournalEntry::new(2, session(1), CommandKind::QuerySat, completed(8000))
        .serialize()
        .unwrap();
    second[HEADER_SIZE + 1] ^= 0xFF;

    let mut file = File::create(&path).unwrap();
    file.write_all(&first).unwrap();
    file.write_all(&second).unwrap();
    file.sync_all().unwrap();

    let result = JournalRecovery::verify(&path).unwrap();
    assert_eq!(result.entries_recovered, 1);
    assert_eq!(result.entries_corrupted, 1);
    assert_eq!(result.last_lsn, 1);
    assert!(result.was_truncated);
    // The completion was lost, so the session is in doubt again
    assert_eq!(result.in_doubt, vec![(session(1), CommandKind::QuerySat)]);
}

#[test]
fn test_recover_in_doubt_summary() {
    let (_temp, path) = setup_temp_journal();
    {
        let mut writer = JournalWriter::open(&path, JournalSync::EveryWrite).unwrap();
        writer
            .append(session(1), CommandKind::SendSaleData, JournalEvent::Sent)
            .unwrap();
        writer
            .append(session(1), CommandKind::SendSaleData, completed(6000))
            .unwrap();
        writer
            .append(session(2), CommandKind::SendSaleData, JournalEvent::Sent)
            .unwrap();
        writer
            .append(session(2), CommandKind::SendSaleData, JournalEvent::Expired)
            .unwrap();
        writer
            .append(session(3), CommandKind::CancelLastSale, JournalEvent::Sent)
            .unwrap();
    }

    let (_, result) = JournalRecovery::recover(&path).unwrap();
    assert_eq!(result.entries_recovered, 5);
    assert_eq!(result.last_issued, Some(session(3)));
    assert_eq!(
        result.in_doubt,
        vec![
            (session(2), CommandKind::SendSaleData),
            (session(3), CommandKind::CancelLastSale),
        ]
    );
}

#[test]
fn test_withdrawn_session_is_not_in_doubt() {
    let (_temp, path) = setup_temp_journal();
    {
        let mut writer = JournalWriter::open(&path, JournalSync::EveryWrite).unwrap();
        writer
            .append(session(4), CommandKind::SendSaleData, JournalEvent::Sent)
            .unwrap();
        writer
            .append(session(4), CommandKind::SendSaleData, JournalEvent::Withdrawn)
            .unwrap();
    }

    let (_, result) = JournalRecovery::recover(&path).unwrap();
    assert!(result.in_doubt.is_empty());
    // The number was still consumed
    assert_eq!(result.last_issued, Some(session(4)));
}

// =============================================================================
// Compaction Tests
// =============================================================================

#[test]
fn test_compact_keeps_in_doubt_and_recent_records() {
    let (_temp, path) = setup_temp_journal();
    {
        let mut writer = JournalWriter::open(&path, JournalSync::EveryWrite).unwrap();
        writer
            .append(session(1), CommandKind::SendSaleData, JournalEvent::Sent)
            .unwrap();
        writer
            .append(session(1), CommandKind::SendSaleData, JournalEvent::Expired)
            .unwrap();
        for n in 2..=50 {
            writer
                .append(session(n), CommandKind::QuerySat, JournalEvent::Sent)
                .unwrap();
            writer
                .append(session(n), CommandKind::QuerySat, completed(8000))
                .unwrap();
        }
    }
    let before = JournalRecovery::verify(&path).unwrap();

    let (entries, result) = JournalRecovery::compact(&path, 4).unwrap();

    // Expired session 1, then the four newest records
    assert_eq!(entries.len(), 5);
    assert_eq!(entries[0].session, session(1));
    assert_eq!(entries[0].event, JournalEvent::Expired);
    assert_eq!(entries[4].session, session(50));
    assert_eq!(result.last_lsn, 5);
    assert_eq!(result.last_issued, before.last_issued);
    assert_eq!(result.in_doubt, before.in_doubt);

    // The file itself was rewritten and stays appendable
    let reread = JournalRecovery::verify(&path).unwrap();
    assert_eq!(reread, result);
    let (journal, reopened) = SessionJournal::open(&path, JournalSync::EveryWrite).unwrap();
    assert_eq!(reopened.in_doubt, vec![(session(1), CommandKind::SendSaleData)]);
    assert_eq!(journal.current_lsn(), 6);
}

#[test]
fn test_compact_keeps_records_after_last_sent() {
    let (_temp, path) = setup_temp_journal();
    {
        let mut writer = JournalWriter::open(&path, JournalSync::EveryWrite).unwrap();
        for n in 1..=10 {
            writer
                .append(session(n), CommandKind::QuerySat, JournalEvent::Sent)
                .unwrap();
            writer
                .append(session(n), CommandKind::QuerySat, completed(8000))
                .unwrap();
        }
    }

    let (entries, result) = JournalRecovery::compact(&path, 0).unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(result.last_issued, Some(session(10)));
    assert!(result.in_doubt.is_empty());

    // Nothing left to drop
    let (again, _) = JournalRecovery::compact(&path, 0).unwrap();
    assert_eq!(again, entries);
}

// =============================================================================
// Session Journal Tests
// =============================================================================

#[test]
fn test_session_journal_records_exchanges() {
    let (_temp, path) = setup_temp_journal();
    let status = StatusCode::new(8000).unwrap();
    {
        let (journal, recovered) = SessionJournal::open(&path, JournalSync::EveryWrite).unwrap();
        assert_eq!(recovered.entries_recovered, 0);

        let frame = Bytes::from_static(b"ConsultarSAT|000001");
        journal
            .record(&Exchange::new(
                session(1),
                CommandKind::QuerySat,
                ExchangeEvent::Sent { frame },
            ))
            .unwrap();
        journal
            .record(&Exchange::new(
                session(1),
                CommandKind::QuerySat,
                ExchangeEvent::Stray {
                    frame: Bytes::from_static(b"000099|08000|ok||"),
                },
            ))
            .unwrap();
        journal
            .record(&Exchange::new(
                session(1),
                CommandKind::QuerySat,
                ExchangeEvent::Received {
                    frame: Bytes::from_static(b"000001|08000|ok||"),
                    status,
                    outcome: Outcome::Success,
                },
            ))
            .unwrap();
        assert_eq!(journal.current_lsn(), 3);
    }

    let (entries, result) = JournalRecovery::recover(&path).unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].event, JournalEvent::Sent);
    assert_eq!(
        entries[1].event,
        JournalEvent::Completed {
            status,
            outcome: Outcome::Success
        }
    );
    assert!(result.in_doubt.is_empty());
}
