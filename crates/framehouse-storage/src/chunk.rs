//! Chunk identity and metadata shared by every tier.

use crate::error;
use crate::signal::Signal;
use bytes::Bytes;
use framehouse_core::{IndexEntry, Span, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A chunk is named by its rate and the `add_seq_num` of its first record.
///
/// Renders as `chunk_rate_{rate}_addSeqNum_{start}`, which is also the file
/// stem of the chunk's `.nal`/`.index` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct ChunkId {
    pub rate: u64,
    pub start_add_seq_num: u64,
}

impl ChunkId {
    pub fn new(rate: u64, start_add_seq_num: u64) -> Self {
        Self {
            rate,
            start_add_seq_num,
        }
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chunk_rate_{}_addSeqNum_{}", self.rate, self.start_add_seq_num)
    }
}

impl FromStr for ChunkId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix("chunk_rate_")
            .ok_or_else(|| format!("not a chunk name: {}", s))?;
        let (rate, seq) = rest
            .split_once("_addSeqNum_")
            .ok_or_else(|| format!("not a chunk name: {}", s))?;
        let rate = rate.parse().map_err(|_| format!("bad rate in {}", s))?;
        let start_add_seq_num = seq.parse().map_err(|_| format!("bad addSeqNum in {}", s))?;
        Ok(Self {
            rate,
            start_add_seq_num,
        })
    }
}

impl From<ChunkId> for String {
    fn from(id: ChunkId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for ChunkId {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// What a tier knows about one of its chunks without reading it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkMetadata {
    pub chunk_id: ChunkId,
    /// Spans of the chunk's records, split at the rate's minimum gap
    pub ranges: Vec<Span>,
    /// Bytes of the record log
    pub size: u64,
    pub is_live: bool,
    /// One-way latch: set once the chunk is leaving the tier
    pub is_moved: bool,
    pub first_add_seq_num: u64,
    pub last_add_seq_num: u64,
}

impl ChunkMetadata {
    /// Time of the chunk's first record
    pub fn first_time(&self) -> Option<Timestamp> {
        self.ranges.first().map(|s| s.first_time)
    }

    /// Time of the chunk's last record
    pub fn last_time(&self) -> Option<Timestamp> {
        self.ranges.last().map(|s| s.last_time)
    }
}

/// A finalized chunk in transit between tiers
#[derive(Debug, Clone)]
pub struct ExportedChunk {
    pub metadata: ChunkMetadata,
    /// `[u32 BE index length][JSON index][record log]`
    pub data: Bytes,
}

/// One slot of a chunk's in-memory index.
///
/// A live chunk's index always ends in exactly one `Pending` slot, resolved
/// when the next record lands or the chunk is finalized.
#[derive(Debug, Clone)]
pub enum IndexSlot {
    Fixed(FixedEntry),
    Pending(Signal),
}

#[derive(Debug, Clone)]
pub struct FixedEntry {
    pub entry: IndexEntry,
    /// Resolved once the record's bytes are on disk
    pub written: Signal,
}

impl IndexSlot {
    pub fn entry(&self) -> Option<&IndexEntry> {
        match self {
            IndexSlot::Fixed(fixed) => Some(&fixed.entry),
            IndexSlot::Pending(_) => None,
        }
    }
}

/// Split an index snapshot into its fixed entries and the trailing pending slot.
pub fn split_slots(slots: &[IndexSlot]) -> (Vec<IndexEntry>, Option<Signal>) {
    let mut entries = Vec::with_capacity(slots.len());
    let mut pending = None;
    for slot in slots {
        match slot {
            IndexSlot::Fixed(fixed) => entries.push(fixed.entry),
            IndexSlot::Pending(signal) => pending = Some(signal.clone()),
        }
    }
    (entries, pending)
}

/// Result of a cancellable read
#[derive(Debug, Clone, PartialEq)]
pub enum ReadOutcome<T> {
    Ready(T),
    Cancelled,
}

impl<T> ReadOutcome<T> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ReadOutcome::Cancelled)
    }

    pub fn ready(self) -> Option<T> {
        match self {
            ReadOutcome::Ready(value) => Some(value),
            ReadOutcome::Cancelled => None,
        }
    }
}

/// What a read selector wants after looking at a chunk's index
#[derive(Debug)]
pub enum Selection {
    /// Read these records
    Read(Vec<IndexEntry>),
    /// Wait for the signal, then look at the index again
    Wait(Signal),
    /// Read nothing
    Skip,
}

/// Picks records to read from a chunk's current index. Called again after
/// every `Selection::Wait`.
pub type Selector<'a> = dyn FnMut(&[IndexSlot]) -> error::Result<Selection> + Send + 'a;
