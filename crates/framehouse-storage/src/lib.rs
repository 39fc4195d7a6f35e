//! Framehouse Storage Layer
//!
//! This crate stores a live camera's NAL records: it appends them to chunked
//! logs on local disk, migrates finalized chunks down a chain of cheaper tiers
//! as budgets fill, and serves keyframe-aligned video windows back out.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────┐
//! │   Camera    │
//! └──────┬──────┘
//!        │ NAL records (one stream per rate)
//!        ▼
//! ┌──────────────────┐
//! │ StorageManager   │  rate → pipeline, new-rate notifications
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │ TierOrchestrator │  ranges, budgets, migrations
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐     export     ┌──────────────────┐
//! │ RateStorage      │ ─────────────→ │ ObjectStoreTier  │ ──→ ... ──→ deleted
//! │ (ChunkLog files) │                │ (object_store)   │
//! └──────────────────┘                └──────────────────┘
//! ```
//!
//! ## Main Components
//!
//! ### ChunkLog
//! One chunk's `.nal` record log and `.index` JSON-lines index, written by a
//! single background task. Reads wait on per-record write completion and can
//! be cancelled; deletion waits for registered reads.
//!
//! ### RateStorage
//! The local tier for one rate: owns the live chunk, rotates on the first
//! keyframe past the chunk size threshold, and recovers chunks on restart.
//!
//! ### Tiers
//! [`StorageTier`] is the seam between the orchestrator and a backend.
//! [`select_tiers`] turns a monthly cost budget into per-tier byte limits.
//!
//! ### Video reads
//! [`get_video_times`] picks a window from one chunk's index; the manager's
//! `get_video` runs it across the tier chain, waiting on live data when asked.
//!
//! ## Usage Example
//!
//! ```ignore
//! use framehouse_storage::{ObjectStoreTierFactory, ObjectTierClass, StorageConfig, StorageManager};
//! use object_store::memory::InMemory;
//!
//! let remote = ObjectStoreTierFactory::new(Arc::new(InMemory::new()), "archive", ObjectTierClass::Warm);
//! let manager = StorageManager::new(StorageConfig::default())?
//!     .with_remote_tier(Arc::new(remote))
//!     .recover()
//!     .await?;
//!
//! manager.add_nal(record).await?;
//! ```

pub mod chunk;
pub mod chunk_log;
pub mod config;
pub mod error;
pub mod manager;
pub mod object_tier;
pub mod orchestrator;
pub mod rate_storage;
pub mod signal;
pub mod tiering;
pub mod video;

pub use chunk::{ChunkId, ChunkMetadata, ExportedChunk, IndexSlot, ReadOutcome, Selection};
pub use chunk_log::{ChunkLog, ReadGuard};
pub use config::StorageConfig;
pub use error::{Error, Result};
pub use manager::{MuxedVideoResult, StorageManager, VideoMuxer};
pub use object_tier::{ObjectStoreTier, ObjectStoreTierFactory, ObjectTierClass};
pub use orchestrator::{RangeEvent, RangeSubscription, TierOrchestrator};
pub use rate_storage::{LocalTierFactory, RateStorage};
pub use signal::Signal;
pub use tiering::{select_tiers, StorageTier, TierBudget, TierFactory, TierPlan};
pub use video::{get_video_times, Video, VideoBoundary, VideoRequest, VideoResult, VideoTimes};
