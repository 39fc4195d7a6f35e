//! Storage Tiers for Framehouse
//!
//! A rate's chunks live on a chain of backends, cheapest to read first:
//!
//! ```text
//!   live records ─→ [disk]  ──export──→ [object store, standard] ──export──→ [archive] ──→ deleted
//!                   maxBytes            maxBytes                            maxBytes
//! ```
//!
//! Every backend implements [`StorageTier`]. Only the head of the chain takes
//! live records; every later tier receives whole finalized chunks through
//! `add_chunk`.
//!
//! ## Cost Model
//!
//! Each tier reports how many GB a monthly budget buys (`max_gb`) and what
//! one download of a given size costs (`cost_per_gb_download`). The rate's
//! share of the budget is `max_cost / 2^(log_base(rate) + 1)`, so coarser
//! rates get geometrically less. [`select_tiers`] turns those numbers into a
//! chain of byte budgets:
//!
//! 1. Split the rate's budget evenly across every candidate
//! 2. Sort candidates by download cost of one chunk (stable)
//! 3. The cheapest must accept live records, otherwise setup fails
//! 4. Skip tiers that hold less than the tier before them
//! 5. Re-split the budget across the survivors and drop tiers that cannot
//!    hold `min_chunks_per_tier` chunks

use crate::chunk::{ChunkId, ChunkMetadata, ExportedChunk, ReadOutcome, Selector};
use crate::config::{StorageConfig, GB};
use crate::error::{Error, Result};
use async_trait::async_trait;
use framehouse_core::NalRecord;
use std::sync::Arc;
use tracing::{info, warn};

/// One backend holding chunks of a single rate
#[async_trait]
pub trait StorageTier: Send + Sync {
    /// Short name used in logs and metric labels
    fn name(&self) -> &str;

    fn rate(&self) -> u64;

    /// GB this tier can hold for `max_cost` per month.
    ///
    /// Takes the stream's shape as well as the budget so tiers with minimum
    /// storage durations or per-object overhead can account for it.
    fn max_gb(&self, bytes_per_second: f64, seconds_per_chunk: f64, max_cost: f64) -> f64;

    /// Cost of one download of `bytes`
    fn cost_per_gb_download(&self, bytes: u64) -> f64;

    /// Whether the tier's capacity is fixed hardware rather than pay-per-use
    fn is_fixed_storage_size(&self) -> bool;

    fn supports_live_append(&self) -> bool {
        false
    }

    /// Append one live record
    async fn add_single_nal(&self, _record: &NalRecord) -> Result<()> {
        Err(Error::NotAppendable(self.name().to_string()))
    }

    /// Store a finalized chunk exported from the previous tier
    async fn add_chunk(&self, chunk: ExportedChunk) -> Result<()>;

    /// Metadata of every chunk, oldest first
    fn chunk_metadatas(&self) -> Vec<ChunkMetadata>;

    /// Bytes held by chunks that are not on their way out
    fn current_bytes(&self) -> u64 {
        self.chunk_metadatas()
            .iter()
            .filter(|m| !m.is_moved)
            .map(|m| m.size)
            .sum()
    }

    /// Read records picked by `selector` from one chunk.
    ///
    /// The read is registered under `cancel_id` until it returns, and the
    /// chunk is not removed while it is registered.
    async fn read_nals(
        &self,
        cancel_id: &str,
        chunk: &ChunkId,
        selector: &mut Selector<'_>,
    ) -> Result<ReadOutcome<Vec<NalRecord>>>;

    /// Cancel a read started with `read_nals`. Returns false if it was not found.
    fn cancel_read_nals(&self, cancel_id: &str, chunk: &ChunkId) -> bool;

    /// Set a chunk's moved latch. Returns false if it was already moved.
    fn mark_moved(&self, chunk: &ChunkId) -> Result<bool>;

    /// Serialize a finalized chunk for the next tier
    async fn export_chunk(&self, chunk: &ChunkId) -> Result<ExportedChunk>;

    /// Delete a chunk once its pending reads have finished
    async fn remove_chunk(&self, chunk: &ChunkId) -> Result<()>;

    /// Wait for buffered writes to reach the backend
    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Opens the tier of one backend for a given rate
#[async_trait]
pub trait TierFactory: Send + Sync {
    fn name(&self) -> &str;

    async fn open_rate(&self, rate: u64, config: &StorageConfig) -> Result<Arc<dyn StorageTier>>;
}

/// A tier in the write chain with its byte budget
#[derive(Clone)]
pub struct TierBudget {
    pub tier: Arc<dyn StorageTier>,
    pub max_bytes: u64,
}

impl std::fmt::Debug for TierBudget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TierBudget")
            .field("tier", &self.tier.name())
            .field("max_bytes", &self.max_bytes)
            .finish()
    }
}

/// Chains chosen for one rate
#[derive(Debug, Clone)]
pub struct TierPlan {
    /// Every candidate, cheapest download first. Reads consult all of them.
    pub read: Vec<TierBudget>,
    /// Tiers that receive chunks, in migration order
    pub write: Vec<TierBudget>,
    pub chunk_threshold_bytes: u64,
}

/// Choose the write chain and byte budgets for `rate`.
///
/// # Errors
/// `TierSetup` if there are no candidates or the cheapest one to read cannot
/// take live records.
pub fn select_tiers(
    rate: u64,
    candidates: Vec<Arc<dyn StorageTier>>,
    config: &StorageConfig,
) -> Result<TierPlan> {
    if candidates.is_empty() {
        return Err(Error::TierSetup(format!("no storage tiers for rate {}", rate)));
    }

    let chunk_threshold_bytes = config.chunk_threshold_bytes(rate);
    let bytes_per_second = config.bytes_per_second / rate as f64;
    let seconds_per_chunk = chunk_threshold_bytes as f64 / bytes_per_second;
    let rate_cost = config.rate_cost(rate);

    let split = rate_cost / candidates.len() as f64;
    let mut scored: Vec<(Arc<dyn StorageTier>, f64, f64)> = candidates
        .into_iter()
        .map(|tier| {
            let max_gb = tier.max_gb(bytes_per_second, seconds_per_chunk, split);
            let download = tier.cost_per_gb_download(chunk_threshold_bytes);
            (tier, max_gb, download)
        })
        .collect();
    scored.sort_by(|a, b| a.2.partial_cmp(&b.2).unwrap_or(std::cmp::Ordering::Equal));

    if !scored[0].0.supports_live_append() {
        return Err(Error::TierSetup(format!(
            "cheapest tier to read ({}) does not accept live records",
            scored[0].0.name()
        )));
    }

    let read = scored
        .iter()
        .map(|(tier, max_gb, _)| TierBudget {
            tier: tier.clone(),
            max_bytes: (max_gb * GB) as u64,
        })
        .collect();

    let mut accepted: Vec<Arc<dyn StorageTier>> = vec![scored[0].0.clone()];
    let mut max_gb = scored[0].1;
    for (tier, tier_gb, _) in scored.iter().skip(1) {
        if *tier_gb < max_gb {
            warn!(
                rate,
                tier = tier.name(),
                max_gb = tier_gb,
                previous_max_gb = max_gb,
                "Skipping tier: holds less than a tier that is cheaper to read"
            );
            continue;
        }
        max_gb = *tier_gb;
        accepted.push(tier.clone());
    }

    let split = rate_cost / accepted.len() as f64;
    let min_bytes = chunk_threshold_bytes.saturating_mul(config.min_chunks_per_tier);
    let write: Vec<TierBudget> = accepted
        .into_iter()
        .map(|tier| {
            let max_bytes = (tier.max_gb(bytes_per_second, seconds_per_chunk, split) * GB) as u64;
            TierBudget { tier, max_bytes }
        })
        .filter(|budget| {
            if budget.max_bytes < min_bytes {
                warn!(
                    rate,
                    tier = budget.tier.name(),
                    max_bytes = budget.max_bytes,
                    min_chunks = config.min_chunks_per_tier,
                    "Skipping tier: cannot hold the minimum number of chunks"
                );
                return false;
            }
            true
        })
        .collect();

    match write.first() {
        Some(head) if head.tier.supports_live_append() => {}
        Some(head) => {
            return Err(Error::TierSetup(format!(
                "head of the write chain for rate {} ({}) does not accept live records",
                rate,
                head.tier.name()
            )))
        }
        None => {
            return Err(Error::TierSetup(format!(
                "no tier for rate {} can hold {} chunks of {} bytes within its budget",
                rate, config.min_chunks_per_tier, chunk_threshold_bytes
            )))
        }
    }

    info!(
        rate,
        chain = ?write.iter().map(|b| (b.tier.name().to_string(), b.max_bytes)).collect::<Vec<_>>(),
        chunk_threshold_bytes,
        "Tier chain selected"
    );

    Ok(TierPlan {
        read,
        write,
        chunk_threshold_bytes,
    })
}
