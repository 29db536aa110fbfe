//! Device date formats
//!
//! The SAT writes local times as `AAAAMMDDhhmmss` and dates as `AAAAMMDD`,
//! with no zone.

use chrono::{NaiveDate, NaiveDateTime};

use crate::error::{Result, SatError};

pub const DATETIME_FORMAT: &str = "%Y%m%d%H%M%S";
pub const DATE_FORMAT: &str = "%Y%m%d";

/// Parse an `AAAAMMDDhhmmss` field
pub fn parse_datetime(field: &str, value: &str) -> Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(value.trim(), DATETIME_FORMAT)
        .map_err(|e| SatError::MalformedResponse(format!("{} {:?}: {}", field, value, e)))
}

/// Parse an `AAAAMMDD` field
pub fn parse_date(field: &str, value: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), DATE_FORMAT)
        .map_err(|e| SatError::MalformedResponse(format!("{} {:?}: {}", field, value, e)))
}

/// Format a time the way the device sends it
pub fn format_datetime(value: &NaiveDateTime) -> String {
    value.format(DATETIME_FORMAT).to_string()
}
