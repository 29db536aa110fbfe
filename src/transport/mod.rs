//! Transport Module
//!
//! Byte-level link between the executor and a SAT device.
//!
//! ## Responsibilities
//! - Deliver one request line to the device
//! - Hand back whole response lines, one per `receive`
//! - Report driver failures as [`LinkFault`]s
//!
//! A transport carries no protocol knowledge: framing of individual lines
//! is its concern, field layout is not.

mod mockup;

use std::time::Duration;

use bytes::Bytes;

use crate::error::Result;

pub use mockup::{Fault, MockupConfig, MockupDevice, MockupHandle, MockupTransport};

/// Outcome of waiting for a frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    /// One complete response line
    Frame(Bytes),

    /// Nothing arrived before the timeout
    TimedOut,
}

/// Link between the commercial application and one device
///
/// Implementations report driver failures as
/// [`SatError::Link`](crate::SatError::Link).
pub trait Transport: Send {
    /// Send one request line
    fn send(&mut self, frame: &[u8]) -> Result<()>;

    /// Wait up to `timeout` for the next response line
    fn receive(&mut self, timeout: Duration) -> Result<Received>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send(&mut self, frame: &[u8]) -> Result<()> {
        (**self).send(frame)
    }

    fn receive(&mut self, timeout: Duration) -> Result<Received> {
        (**self).receive(timeout)
    }
}

/// Driver-level failures, numbered as the vendor communication layer
/// numbers them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkFault {
    /// Device not connected or port unavailable
    NoConnect,
    ReadError,
    ChecksumError,
    /// The driver did not recognise the command
    UnknownCommand,
    Timeout,
    /// Clear-to-send never asserted
    NoCts,
}

impl LinkFault {
    pub fn code(self) -> u16 {
        match self {
            LinkFault::NoConnect => 1,
            LinkFault::ReadError => 2,
            LinkFault::ChecksumError => 3,
            LinkFault::UnknownCommand => 4,
            LinkFault::Timeout => 0x8000,
            LinkFault::NoCts => 0x8001,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            1 => Some(LinkFault::NoConnect),
            2 => Some(LinkFault::ReadError),
            3 => Some(LinkFault::ChecksumError),
            4 => Some(LinkFault::UnknownCommand),
            0x8000 => Some(LinkFault::Timeout),
            0x8001 => Some(LinkFault::NoCts),
            _ => None,
        }
    }

    /// Faults after which the line may still work
    pub fn is_transient(self) -> bool {
        !matches!(self, LinkFault::NoConnect | LinkFault::UnknownCommand)
    }
}

impl std::fmt::Display for LinkFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            LinkFault::NoConnect => "device not connected",
            LinkFault::ReadError => "read error",
            LinkFault::ChecksumError => "checksum error",
            LinkFault::UnknownCommand => "unknown command",
            LinkFault::Timeout => "link timeout",
            LinkFault::NoCts => "no clear-to-send",
        };
        write!(f, "{} (0x{:04x})", text, self.code())
    }
}
