//! Framehouse Core
//!
//! Frame types and the pure algorithms the storage engine is built from. No I/O
//! happens in this crate.
//!
//! - [`record`]: `NalRecord`, `IndexEntry`, `FrameType`, and the microsecond `Timestamp`
//! - [`codec`]: the chunk log record layout, index lines, and exported chunk blobs
//! - [`ranges`]: `RangeSet`, sorted disjoint time spans with gap-tolerant merging
//! - [`downsample`]: `Downsampler`, hierarchical per-rate sampling
//! - [`summary`]: `RangeSummary`, multi-resolution span summaries with fill rates
//! - [`sized_cache`]: `SizedCache`, a size-bounded FIFO cache

pub mod codec;
pub mod downsample;
pub mod error;
pub mod ranges;
pub mod record;
pub mod sized_cache;
pub mod summary;

pub use downsample::{DownsampledSink, Downsampler};
pub use error::{Error, Result};
pub use ranges::{min_gap_for_rate, RangeSet, Span};
pub use record::{FrameType, IndexEntry, NalRecord, Timestamp};
pub use sized_cache::SizedCache;
pub use summary::RangeSummary;
