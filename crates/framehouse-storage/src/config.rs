//! Storage Configuration
//!
//! ## StorageConfig
//!
//! Controls where chunks live, how large they grow, and how the monthly cost
//! budget is split into per-tier byte limits:
//!
//! - **root_dir**: local tier directory; each rate gets `rate_{rate}/` below it
//! - **base_rate**: downsampling base, rates are `1, b, b², ...` (default: 4)
//! - **bytes_per_second**: expected camera bitrate, used to size chunks
//! - **seconds_per_chunk**: target seconds of rate-1 video per chunk (default: 20)
//! - **max_cost_per_month**: total budget split across rates and tiers
//! - **disk_cost_per_month** / **disk_bytes**: what the local disk costs and holds,
//!   so a budget share converts into local bytes
//! - **min_chunks_per_tier**: tiers that cannot hold this many chunks are dropped (default: 3)
//!
//! ## Usage
//!
//! ```ignore
//! use framehouse_storage::StorageConfig;
//!
//! let config = StorageConfig {
//!     root_dir: "/var/lib/framehouse".into(),
//!     bytes_per_second: 500_000.0,
//!     max_cost_per_month: 5.0,
//!     ..Default::default()
//! };
//! config.validate()?;
//! ```

use crate::error::{Error, Result};
use framehouse_core::downsample::validate_base_rate;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const GB: f64 = 1024.0 * 1024.0 * 1024.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Local tier directory
    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,

    /// Downsampling base (default: 4)
    #[serde(default = "default_base_rate")]
    pub base_rate: f64,

    /// Expected bytes per second of rate-1 video (default: 500KB/s)
    #[serde(default = "default_bytes_per_second")]
    pub bytes_per_second: f64,

    /// Seconds of rate-1 video per chunk (default: 20)
    #[serde(default = "default_seconds_per_chunk")]
    pub seconds_per_chunk: f64,

    /// Monthly budget across every rate and tier (default: 10.0)
    #[serde(default = "default_max_cost_per_month")]
    pub max_cost_per_month: f64,

    /// Monthly cost of the whole local disk (default: 10.0)
    #[serde(default = "default_disk_cost_per_month")]
    pub disk_cost_per_month: f64,

    /// Capacity of the whole local disk in bytes (default: 256GB)
    #[serde(default = "default_disk_bytes")]
    pub disk_bytes: u64,

    /// Minimum chunks a tier must hold to be kept in the chain (default: 3)
    #[serde(default = "default_min_chunks_per_tier")]
    pub min_chunks_per_tier: u64,

    /// Buffered records per rate between `add_nal` and the rate's ingest task (default: 1024)
    #[serde(default = "default_ingest_channel_capacity")]
    pub ingest_channel_capacity: usize,

    /// Byte limit of the muxed video cache (default: 64MB)
    #[serde(default = "default_muxed_cache_bytes")]
    pub muxed_cache_bytes: u64,

    /// Byte limit of each remote tier's decoded blob cache (default: 32MB)
    #[serde(default = "default_blob_cache_bytes")]
    pub blob_cache_bytes: u64,

    /// How many times chunk removal waits on pending reads before failing (default: 10)
    #[serde(default = "default_max_read_barrier_waits")]
    pub max_read_barrier_waits: u32,

    /// How many times a live video request re-evaluates before failing (default: 1000)
    #[serde(default = "default_max_live_iterations")]
    pub max_live_iterations: u32,

    /// Attempts to hand an exported chunk to the next tier (default: 3)
    #[serde(default = "default_export_retries")]
    pub export_retries: u32,

    /// Delay before the first export retry, doubled on each further retry (default: 500ms)
    #[serde(default = "default_export_retry_backoff", with = "duration_ms")]
    pub export_retry_backoff: Duration,

    /// fsync chunk files after each write batch (default: false)
    #[serde(default)]
    pub sync_writes: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            base_rate: default_base_rate(),
            bytes_per_second: default_bytes_per_second(),
            seconds_per_chunk: default_seconds_per_chunk(),
            max_cost_per_month: default_max_cost_per_month(),
            disk_cost_per_month: default_disk_cost_per_month(),
            disk_bytes: default_disk_bytes(),
            min_chunks_per_tier: default_min_chunks_per_tier(),
            ingest_channel_capacity: default_ingest_channel_capacity(),
            muxed_cache_bytes: default_muxed_cache_bytes(),
            blob_cache_bytes: default_blob_cache_bytes(),
            max_read_barrier_waits: default_max_read_barrier_waits(),
            max_live_iterations: default_max_live_iterations(),
            export_retries: default_export_retries(),
            export_retry_backoff: default_export_retry_backoff(),
            sync_writes: false,
        }
    }
}

impl StorageConfig {
    /// Check the configuration before any directory is touched.
    ///
    /// # Errors
    /// `Config` describing the first invalid field.
    pub fn validate(&self) -> Result<()> {
        validate_base_rate(self.base_rate)
            .map_err(|_| Error::Config(format!("base_rate must be an integer >= 2, got {}", self.base_rate)))?;
        if !(self.bytes_per_second > 0.0) {
            return Err(Error::Config("bytes_per_second must be positive".to_string()));
        }
        if !(self.seconds_per_chunk > 0.0) {
            return Err(Error::Config("seconds_per_chunk must be positive".to_string()));
        }
        if !(self.max_cost_per_month >= 0.0) {
            return Err(Error::Config("max_cost_per_month must not be negative".to_string()));
        }
        if !(self.disk_cost_per_month > 0.0) || self.disk_bytes == 0 {
            return Err(Error::Config(
                "disk_cost_per_month and disk_bytes must be positive".to_string(),
            ));
        }
        if self.ingest_channel_capacity == 0 {
            return Err(Error::Config("ingest_channel_capacity must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Downsampling base as an integer. Only meaningful after `validate`.
    pub fn base(&self) -> u64 {
        self.base_rate as u64
    }

    /// Directory of one rate on the local tier
    pub fn rate_dir(&self, rate: u64) -> PathBuf {
        self.root_dir.join(format!("rate_{}", rate))
    }

    /// Bytes after which a rate's live chunk rotates on the next keyframe
    pub fn chunk_threshold_bytes(&self, rate: u64) -> u64 {
        (self.bytes_per_second * rate as f64 * self.seconds_per_chunk) as u64
    }

    /// Share of the monthly budget given to one rate.
    ///
    /// Rate `b^k` gets `max_cost / 2^(k+1)`, so the shares over every rate sum
    /// to at most the full budget.
    pub fn rate_cost(&self, rate: u64) -> f64 {
        let base = self.base().max(2);
        let mut exponent = 0i32;
        let mut r = rate.max(1);
        while r >= base {
            r /= base;
            exponent += 1;
        }
        self.max_cost_per_month / 2f64.powi(exponent + 1)
    }
}

fn default_root_dir() -> PathBuf {
    PathBuf::from("./data/framehouse")
}

fn default_base_rate() -> f64 {
    4.0
}

fn default_bytes_per_second() -> f64 {
    500_000.0
}

fn default_seconds_per_chunk() -> f64 {
    20.0
}

fn default_max_cost_per_month() -> f64 {
    10.0
}

fn default_disk_cost_per_month() -> f64 {
    10.0
}

fn default_disk_bytes() -> u64 {
    256 * 1024 * 1024 * 1024 // 256GB
}

fn default_min_chunks_per_tier() -> u64 {
    3
}

fn default_ingest_channel_capacity() -> usize {
    1024
}

fn default_muxed_cache_bytes() -> u64 {
    64 * 1024 * 1024 // 64MB
}

fn default_blob_cache_bytes() -> u64 {
    32 * 1024 * 1024 // 32MB
}

fn default_max_read_barrier_waits() -> u32 {
    10
}

fn default_max_live_iterations() -> u32 {
    1000
}

fn default_export_retries() -> u32 {
    3
}

fn default_export_retry_backoff() -> Duration {
    Duration::from_millis(500)
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}
