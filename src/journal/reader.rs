//! Journal reader
//!
//! Sequential scan over journal records.

use std::fs::File;
use std::io::{BufReader, ErrorKind, Read};
use std::path::Path;

use super::entry::{JournalEntry, RecordHeader, HEADER_SIZE};
use crate::error::Result;

/// Reads records from a journal file, oldest first
pub struct JournalReader {
    reader: BufReader<File>,

    /// Offset just past the last record read successfully
    position: u64,
}

impl JournalReader {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self {
            reader: BufReader::new(file),
            position: 0,
        })
    }

    /// Read the next record
    ///
    /// `Ok(None)` at the end of the file or at a torn tail (a record cut
    /// short by a crash). A complete record that fails its checksum is an
    /// error.
    pub fn next_entry(&mut self) -> Result<Option<JournalEntry>> {
        let mut header_bytes = [0u8; HEADER_SIZE];
        if !read_full(&mut self.reader, &mut header_bytes)? {
            return Ok(None);
        }
        let header = RecordHeader::parse(&header_bytes)?;

        let mut payload = vec![0u8; header.len];
        if !read_full(&mut self.reader, &mut payload)? {
            return Ok(None);
        }

        let entry = header.decode(&payload)?;
        self.position += (HEADER_SIZE + header.len) as u64;
        Ok(Some(entry))
    }

    /// Offset just past the last good record
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Iterate over records until the end, a torn tail or the first error
    pub fn entries(self) -> JournalIterator {
        JournalIterator {
            reader: self,
            done: false,
        }
    }
}

/// Iterator over journal records
pub struct JournalIterator {
    reader: JournalReader,
    done: bool,
}

impl Iterator for JournalIterator {
    type Item = Result<JournalEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.reader.next_entry() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Fill `buf`; `false` when the file ends first
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e.into()),
    }
}
