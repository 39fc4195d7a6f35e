//! Storage Error Types
//!
//! ## Error Categories
//!
//! ### Ingest Errors
//! - `TimeOrder`: a record's time did not advance past the rate's last time
//! - `NotAppendable`: a tier that only accepts whole chunks was asked to take a live record
//! - `WriterClosed` / `WriteFailed`: the chunk's write loop stopped or failed
//!
//! ### Chunk Errors
//! - `ChunkNotFound` / `ChunkMoved`: the chunk left this tier
//! - `ChunkLive` / `ChunkExporting`: the chunk is in the wrong state for an export
//! - `Corrupt`: a chunk file could not be recovered
//!
//! ### Read Errors
//! - `DuplicateRead`: the cancel id is already registered on the chunk
//! - `ReadBarrier`: pending reads never drained, so the chunk could not be removed
//! - `LiveIterationLimit`: a live video request waited too many times
//!
//! ### Setup Errors
//! - `Config` / `TierSetup`: invalid configuration or no usable tier chain
//!
//! Lower-level errors (`framehouse_core`, I/O, JSON, object store) convert
//! through `#[from]` so every operation can use `?`.

use framehouse_core::Timestamp;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Core error: {0}")]
    Core(#[from] framehouse_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("Time did not advance for rate {rate}: {time} <= {last_time}")]
    TimeOrder {
        rate: u64,
        time: Timestamp,
        last_time: Timestamp,
    },

    #[error("Record for rate {record_rate} sent to rate {rate}")]
    WrongRate { rate: u64, record_rate: u64 },

    #[error("Tier {0} does not accept live appends")]
    NotAppendable(String),

    #[error("Chunk not found: {0}")]
    ChunkNotFound(String),

    #[error("Chunk has been moved: {0}")]
    ChunkMoved(String),

    #[error("Chunk is still live: {0}")]
    ChunkLive(String),

    #[error("Chunk is already being exported: {0}")]
    ChunkExporting(String),

    #[error("Chunk write loop closed: {0}")]
    WriterClosed(String),

    #[error("Chunk write failed: {0}")]
    WriteFailed(String),

    #[error("Corrupt chunk file {path:?}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("Cancel id {cancel_id} already registered on chunk {chunk}")]
    DuplicateRead { cancel_id: String, chunk: String },

    #[error("Pending reads on chunk {chunk} did not finish after {waits} waits")]
    ReadBarrier { chunk: String, waits: u32 },

    #[error("Live video request exceeded {0} iterations")]
    LiveIterationLimit(u32),

    #[error("Muxing failed: {0}")]
    Mux(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Tier setup failed: {0}")]
    TierSetup(String),
}
