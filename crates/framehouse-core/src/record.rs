//! Frame Data Structures
//!
//! This module defines the `NalRecord` type, the unit of data Framehouse stores,
//! and the `IndexEntry` that locates one record inside a chunk's log file.
//!
//! ## What is a NAL record?
//! A NAL (Network Abstraction Layer unit) is one encoded video frame as it leaves
//! the camera's H.264 encoder. Each record carries:
//! - **rate**: the retention tier it belongs to (rate `r` keeps every `r`-th frame)
//! - **time**: capture time, fixed-point microseconds since the epoch
//! - **frame_type**: keyframe or interframe
//! - **width / height**: coded picture size
//! - **sps / pps**: codec parameter sets, needed to mux a window starting at a keyframe
//! - **nal**: the encoded frame bytes
//! - **add_seq_num**: global ingestion sequence number, used to resume numbering after restart
//!
//! ## Time
//! Times are `i64` microseconds internally. The on-disk formats store milliseconds
//! as `f64`; conversion happens only in the codec (see `ms_to_micros`).
//!
//! ## Example
//! ```ignore
//! let record = NalRecord {
//!     rate: 1,
//!     time: 1_700_000_000_000_000,
//!     frame_type: FrameType::Keyframe,
//!     width: 1920,
//!     height: 1080,
//!     sps: Bytes::from_static(&[0x67, 0x42]),
//!     pps: Bytes::from_static(&[0x68, 0xce]),
//!     nal: Bytes::from(frame_bytes),
//!     add_seq_num: 42,
//! };
//! ```

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Microseconds since the Unix epoch.
pub type Timestamp = i64;

/// Convert an on-disk millisecond time to microseconds.
///
/// Rounds to the nearest microsecond. Present-day epoch times in milliseconds
/// keep sub-microsecond precision in an `f64`, so a round-trip is exact.
pub fn ms_to_micros(ms: f64) -> Timestamp {
    (ms * 1000.0).round() as Timestamp
}

/// Convert microseconds to the on-disk millisecond representation.
pub fn micros_to_ms(micros: Timestamp) -> f64 {
    micros as f64 / 1000.0
}

/// H.264 frame type as stored in the record header.
///
/// Parameter sets (0 and 1) never reach storage; they travel inside keyframe
/// records as `sps`/`pps`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum FrameType {
    Keyframe,
    Interframe,
}

impl FrameType {
    pub fn code(self) -> u8 {
        match self {
            FrameType::Keyframe => 2,
            FrameType::Interframe => 3,
        }
    }

    pub fn is_keyframe(self) -> bool {
        matches!(self, FrameType::Keyframe)
    }
}

impl From<FrameType> for u8 {
    fn from(value: FrameType) -> Self {
        value.code()
    }
}

impl TryFrom<u8> for FrameType {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            2 => Ok(FrameType::Keyframe),
            3 => Ok(FrameType::Interframe),
            other => Err(format!("unknown frame type {}", other)),
        }
    }
}

/// A single encoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NalRecord {
    pub rate: u64,
    pub time: Timestamp,
    pub frame_type: FrameType,
    pub width: u32,
    pub height: u32,
    pub sps: Bytes,
    pub pps: Bytes,
    pub nal: Bytes,
    pub add_seq_num: u64,
}

impl NalRecord {
    /// Size of this record once encoded into a chunk log
    pub fn encoded_len(&self) -> u64 {
        crate::codec::RECORD_HEADER_LEN as u64
            + self.sps.len() as u64
            + self.pps.len() as u64
            + self.nal.len() as u64
    }

    pub fn is_keyframe(&self) -> bool {
        self.frame_type.is_keyframe()
    }

    /// Index entry describing this record when written at `pos`
    pub fn index_entry(&self, pos: u64) -> IndexEntry {
        IndexEntry {
            pos,
            len: self.encoded_len(),
            rate: self.rate,
            time: self.time,
            frame_type: self.frame_type,
            width: self.width,
            height: self.height,
            add_seq_num: self.add_seq_num,
        }
    }
}

/// Location and metadata of one record inside a chunk log.
///
/// Serialized as one JSON line of the `.index` file:
/// `{"pos":0,"len":97,"rate":1,"time":1700000000000.5,"type":2,"width":1920,"height":1080,"addSeqNum":7}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub pos: u64,
    pub len: u64,
    pub rate: u64,
    #[serde(with = "time_ms")]
    pub time: Timestamp,
    #[serde(rename = "type")]
    pub frame_type: FrameType,
    pub width: u32,
    pub height: u32,
    #[serde(rename = "addSeqNum")]
    pub add_seq_num: u64,
}

impl IndexEntry {
    /// Byte offset one past the end of this record
    pub fn end(&self) -> u64 {
        self.pos + self.len
    }

    pub fn is_keyframe(&self) -> bool {
        self.frame_type.is_keyframe()
    }
}

mod time_ms {
    use super::{micros_to_ms, ms_to_micros, Timestamp};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(time: &Timestamp, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(micros_to_ms(*time))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Timestamp, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = f64::deserialize(deserializer)?;
        Ok(ms_to_micros(ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keyframe(time: Timestamp) -> NalRecord {
        NalRecord {
            rate: 1,
            time,
            frame_type: FrameType::Keyframe,
            width: 1000,
            height: 500,
            sps: Bytes::from_static(&[1, 2, 3]),
            pps: Bytes::from_static(&[4, 5]),
            nal: Bytes::from(vec![9u8; 20]),
            add_seq_num: 11,
        }
    }

    #[test]
    fn test_encoded_len_includes_header_and_payloads() {
        let record = keyframe(5_000);
        assert_eq!(record.encoded_len(), 73 + 3 + 2 + 20);
    }

    #[test]
    fn test_index_entry_json_uses_millisecond_time() {
        let entry = keyframe(1_500).index_entry(100);
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"time\":1.5"));
        assert!(json.contains("\"type\":2"));
        assert!(json.contains("\"addSeqNum\":11"));

        let parsed: IndexEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, entry);
        assert_eq!(parsed.end(), 100 + 98);
    }

    #[test]
    fn test_unknown_frame_type_rejected() {
        let json = r#"{"pos":0,"len":73,"rate":1,"time":0,"type":7,"width":1,"height":1,"addSeqNum":0}"#;
        assert!(serde_json::from_str::<IndexEntry>(json).is_err());
    }

    #[test]
    fn test_ms_conversion_round_trips_epoch_micros() {
        assert_eq!(ms_to_micros(2.25), 2250);
        assert_eq!(micros_to_ms(2250), 2.25);

        for t in [1_700_000_000_000_123i64, 1_700_000_000_999_999, 1_900_000_000_000_001] {
            assert_eq!(ms_to_micros(micros_to_ms(t)), t);
        }
    }
}
