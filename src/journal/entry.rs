//! Journal entry definitions
//!
//! Defines the structure of individual journal records.

use serde::{Deserialize, Serialize};

use crate::classifier::Outcome;
use crate::error::{Result, SatError};
use crate::protocol::{CommandKind, StatusCode};
use crate::session::{unix_millis, SessionNumber};

/// Header: lsn (8) + crc32 (4) + payload length (4)
pub const HEADER_SIZE: usize = 16;

/// Payloads above this size are treated as corruption
pub const MAX_PAYLOAD_SIZE: usize = 1024 * 1024;

/// A single record in the session journal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Log Sequence Number - monotonically increasing
    pub lsn: u64,

    /// Timestamp (unix millis) when the entry was created
    pub timestamp: u64,

    pub session: SessionNumber,
    pub kind: CommandKind,
    pub event: JournalEvent,
}

/// Session transitions worth surviving a restart
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JournalEvent {
    /// Request handed to the device
    Sent,

    /// Outcome known
    Completed { status: StatusCode, outcome: Outcome },

    /// Gave up waiting; outcome unknown
    Expired,

    /// The request never reached the device
    Withdrawn,
}

impl JournalEvent {
    /// The device may or may not have executed the command
    pub fn is_in_doubt(self) -> bool {
        matches!(self, JournalEvent::Sent | JournalEvent::Expired)
    }
}

impl JournalEntry {
    pub fn new(lsn: u64, session: SessionNumber, kind: CommandKind, event: JournalEvent) -> Self {
        Self {
            lsn,
            timestamp: unix_millis(),
            session,
            kind,
            event,
        }
    }

    /// Encode as `lsn | crc32 | len | payload`
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let payload = bincode::serialize(self)?;
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(SatError::Serialization(format!(
                "journal entry of {} bytes exceeds {}",
                payload.len(),
                MAX_PAYLOAD_SIZE
            )));
        }

        let mut bytes = Vec::with_capacity(HEADER_SIZE + payload.len());
        bytes.extend_from_slice(&self.lsn.to_le_bytes());
        bytes.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
        bytes.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&payload);
        Ok(bytes)
    }

    /// Decode one complete record, checking its CRC
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        let header = RecordHeader::parse(bytes)?;
        let payload = bytes
            .get(HEADER_SIZE..HEADER_SIZE + header.len)
            .ok_or_else(|| {
                SatError::JournalCorruption(format!(
                    "record {} truncated: {} of {} payload bytes",
                    header.lsn,
                    bytes.len().saturating_sub(HEADER_SIZE),
                    header.len
                ))
            })?;
        header.decode(payload)
    }
}

/// Fixed-size prefix of a record
#[derive(Debug, Clone, Copy)]
pub(crate) struct RecordHeader {
    pub lsn: u64,
    pub crc: u32,
    pub len: usize,
}

impl RecordHeader {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(SatError::JournalCorruption(format!(
                "header needs {} bytes, got {}",
                HEADER_SIZE,
                bytes.len()
            )));
        }

        let mut lsn = [0u8; 8];
        let mut crc = [0u8; 4];
        let mut len = [0u8; 4];
        lsn.copy_from_slice(&bytes[0..8]);
        crc.copy_from_slice(&bytes[8..12]);
        len.copy_from_slice(&bytes[12..16]);

        let header = Self {
            lsn: u64::from_le_bytes(lsn),
            crc: u32::from_le_bytes(crc),
            len: u32::from_le_bytes(len) as usize,
        };
        if header.len > MAX_PAYLOAD_SIZE {
            return Err(SatError::JournalCorruption(format!(
                "record {} claims {} payload bytes",
                header.lsn, header.len
            )));
        }
        Ok(header)
    }

    /// Verify and decode the payload that follows this header
    pub fn decode(&self, payload: &[u8]) -> Result<JournalEntry> {
        let actual = crc32fast::hash(payload);
        if actual != self.crc {
            return Err(SatError::JournalCorruption(format!(
                "CRC mismatch in record {}: expected {:08x}, got {:08x}",
                self.lsn, self.crc, actual
            )));
        }

        let entry: JournalEntry = bincode::deserialize(payload)?;
        if entry.lsn != self.lsn {
            return Err(SatError::JournalCorruption(format!(
                "record header says LSN {}, payload says {}",
                self.lsn, entry.lsn
            )));
        }
        Ok(entry)
    }
}
