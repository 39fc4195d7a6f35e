//! Error Types for Framehouse
//!
//! This module defines the errors raised by the pure data layer: the record
//! codec, the range algorithms, and the downsampler.
//!
//! ## Error Categories
//!
//! ### Data Integrity Errors
//! - `InvalidRecordHeader`: The finished marker of a record was not 0
//! - `TruncatedRecord`: A record declares more bytes than remain in the buffer
//! - `InvalidRecord`: A decoded header field is out of range (rate 0, fractional width)
//! - `InvalidIndex`: An index line or chunk blob could not be parsed
//!
//! ### Consistency Errors
//! These indicate a defect in the caller, never bad input from disk:
//! - `InvalidSpan`: A span whose last time precedes its first time
//! - `OverlappingRanges`: Two spans overlap while frame counts are accumulated
//! - `FillOverflow`: A fill-rate update would make a span more than 100% full
//! - `RangeNotFound`: A mutation referenced a span that was never added
//!
//! ### Configuration Errors
//! - `InvalidBaseRate`: Downsampling base below 2 or fractional
//!
//! ## Usage
//! All functions in this crate return `Result<T>` which is aliased to `Result<T, Error>`.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid record header at byte {pos}: finished marker was {marker}")]
    InvalidRecordHeader { pos: u64, marker: u8 },

    #[error("Truncated record at byte {pos}: needs {needed} bytes, {available} available")]
    TruncatedRecord {
        pos: u64,
        needed: u64,
        available: u64,
    },

    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Invalid index: {0}")]
    InvalidIndex(String),

    #[error("Invalid span: last time {last_time} is before first time {first_time}")]
    InvalidSpan { first_time: i64, last_time: i64 },

    #[error("Overlapping ranges while counting frames: {0}")]
    OverlappingRanges(String),

    #[error("Fill rate overflow: {0}")]
    FillOverflow(String),

    #[error("Range not found: {0}")]
    RangeNotFound(String),

    #[error("Invalid base rate {0}: must be an integer >= 2")]
    InvalidBaseRate(f64),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
