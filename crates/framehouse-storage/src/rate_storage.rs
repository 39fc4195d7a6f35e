//! Local Rate Storage
//!
//! The disk tier of one rate: a directory of chunk pairs, exactly one of
//! which is live.
//!
//! ```text
//! rate_4/
//! ├── chunk_rate_4_addSeqNum_0.nal       finalized
//! ├── chunk_rate_4_addSeqNum_0.index
//! ├── chunk_rate_4_addSeqNum_812.nal     live
//! └── chunk_rate_4_addSeqNum_812.index
//! ```
//!
//! ## Rotation
//!
//! Records go to the live chunk until it holds more than the chunk threshold.
//! The first keyframe after that starts a new chunk, so every chunk begins on
//! a keyframe. The new chunk receives the keyframe before the old one is
//! finalized, so a reader woken by the old chunk's finalize already sees the
//! record that follows it.
//!
//! ## Recovery
//!
//! `open()` recovers every chunk in the directory. Chunks that fail recovery
//! are logged and skipped. If a crash left more than one unfinished chunk,
//! all but the newest are finalized.

use crate::chunk::{ChunkId, ChunkMetadata, ExportedChunk, ReadOutcome, Selector};
use crate::chunk_log::ChunkLog;
use crate::config::{StorageConfig, GB};
use crate::error::{Error, Result};
use crate::tiering::{StorageTier, TierFactory};
use async_trait::async_trait;
use framehouse_core::{NalRecord, Timestamp};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;
use tracing::{debug, info, warn};

const TIER_NAME: &str = "disk";

pub struct RateStorage {
    rate: u64,
    dir: PathBuf,
    chunk_threshold_bytes: u64,
    sync_writes: bool,
    max_read_barrier_waits: u32,
    disk_cost_per_month: f64,
    disk_bytes: u64,
    /// Oldest first
    chunks: RwLock<Vec<Arc<ChunkLog>>>,
    /// Serializes appends, which may suspend while rotating
    ingest: tokio::sync::Mutex<()>,
}

impl RateStorage {
    /// Open (and recover) the local tier of `rate` under the configured root.
    pub async fn open(rate: u64, config: &StorageConfig) -> Result<Self> {
        let dir = config.rate_dir(rate);
        tokio::fs::create_dir_all(&dir).await?;

        let mut ids = list_chunk_ids(&dir).await?;
        ids.sort_by_key(|id| id.start_add_seq_num);

        let mut chunks = Vec::with_capacity(ids.len());
        for id in ids {
            if id.rate != rate {
                warn!(rate, chunk = %id, "Chunk of another rate in rate directory, skipping");
                continue;
            }
            match ChunkLog::recover(&dir, id, config.sync_writes).await {
                Ok(Some(chunk)) => chunks.push(chunk),
                Ok(None) => {}
                Err(e) => {
                    warn!(rate, chunk = %id, error = %e, "Chunk recovery failed, skipping");
                    framehouse_observability::metrics::CHUNK_RECOVERIES_TOTAL
                        .with_label_values(&["skipped"])
                        .inc();
                }
            }
        }

        let live: Vec<&Arc<ChunkLog>> = chunks.iter().filter(|c| c.is_live()).collect();
        if live.len() > 1 {
            warn!(rate, live = live.len(), "Multiple unfinished chunks, finalizing all but the newest");
            for chunk in &live[..live.len() - 1] {
                chunk.finalize()?;
            }
        }

        info!(
            rate,
            chunks = chunks.len(),
            bytes = chunks.iter().map(|c| c.size()).sum::<u64>(),
            dir = ?dir,
            "Rate storage opened"
        );

        Ok(Self {
            rate,
            dir,
            chunk_threshold_bytes: config.chunk_threshold_bytes(rate),
            sync_writes: config.sync_writes,
            max_read_barrier_waits: config.max_read_barrier_waits,
            disk_cost_per_month: config.disk_cost_per_month,
            disk_bytes: config.disk_bytes,
            chunks: RwLock::new(chunks),
            ingest: tokio::sync::Mutex::new(()),
        })
    }

    /// Override the rotation threshold chosen from the configuration
    pub fn with_chunk_threshold(mut self, bytes: u64) -> Self {
        self.chunk_threshold_bytes = bytes;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn chunk_threshold_bytes(&self) -> u64 {
        self.chunk_threshold_bytes
    }

    fn chunks(&self) -> RwLockReadGuard<'_, Vec<Arc<ChunkLog>>> {
        self.chunks.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn chunks_mut(&self) -> RwLockWriteGuard<'_, Vec<Arc<ChunkLog>>> {
        self.chunks.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn find(&self, id: &ChunkId) -> Result<Arc<ChunkLog>> {
        self.chunks()
            .iter()
            .find(|c| c.id() == *id)
            .cloned()
            .ok_or_else(|| Error::ChunkNotFound(id.to_string()))
    }

    /// The live chunk, if any
    pub fn live_chunk(&self) -> Option<Arc<ChunkLog>> {
        self.chunks().iter().rev().find(|c| c.is_live()).cloned()
    }

    /// Time of the newest retained record
    pub fn last_time(&self) -> Option<Timestamp> {
        self.chunks().iter().rev().find_map(|c| c.last_time())
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks().len()
    }

    /// Append one record, rotating to a new chunk when the live chunk is full
    /// and the record is a keyframe.
    ///
    /// # Errors
    /// - `WrongRate` if the record belongs to another rate
    /// - `TimeOrder` if the record's time does not advance past the rate's last time
    pub async fn append(&self, record: &NalRecord) -> Result<()> {
        if record.rate != self.rate {
            return Err(Error::WrongRate {
                rate: self.rate,
                record_rate: record.rate,
            });
        }
        let _ingest = self.ingest.lock().await;

        if let Some(last_time) = self.last_time() {
            if record.time <= last_time {
                return Err(Error::TimeOrder {
                    rate: self.rate,
                    time: record.time,
                    last_time,
                });
            }
        }

        let live = self.live_chunk();
        match live {
            Some(chunk) if !(chunk.size() > self.chunk_threshold_bytes && record.is_keyframe()) => {
                chunk.append(record)?;
            }
            previous => {
                let chunk = ChunkLog::create(&self.dir, record, self.sync_writes).await?;
                chunk.append(record)?;
                {
                    let mut chunks = self.chunks_mut();
                    chunks.push(chunk);
                    if let Some(previous) = previous {
                        previous.finalize()?;
                    }
                }
            }
        }

        let rate = self.rate.to_string();
        framehouse_observability::metrics::NALS_APPENDED_TOTAL
            .with_label_values(&[&rate])
            .inc();
        framehouse_observability::metrics::BYTES_APPENDED_TOTAL
            .with_label_values(&[&rate])
            .inc_by(record.encoded_len());
        debug!(rate = self.rate, time = record.time, seq = record.add_seq_num, "NAL appended");
        Ok(())
    }
}

#[async_trait]
impl StorageTier for RateStorage {
    fn name(&self) -> &str {
        TIER_NAME
    }

    fn rate(&self) -> u64 {
        self.rate
    }

    fn max_gb(&self, _bytes_per_second: f64, _seconds_per_chunk: f64, max_cost: f64) -> f64 {
        max_cost / self.disk_cost_per_month * self.disk_bytes as f64 / GB
    }

    fn cost_per_gb_download(&self, _bytes: u64) -> f64 {
        0.0
    }

    fn is_fixed_storage_size(&self) -> bool {
        true
    }

    fn supports_live_append(&self) -> bool {
        true
    }

    async fn add_single_nal(&self, record: &NalRecord) -> Result<()> {
        self.append(record).await
    }

    async fn add_chunk(&self, chunk: ExportedChunk) -> Result<()> {
        let imported = ChunkLog::import(&self.dir, &chunk).await?;
        let mut chunks = self.chunks_mut();
        let idx = chunks
            .partition_point(|c| c.id().start_add_seq_num < imported.id().start_add_seq_num);
        chunks.insert(idx, imported);
        info!(rate = self.rate, chunk = %chunk.metadata.chunk_id, "Chunk imported");
        Ok(())
    }

    fn chunk_metadatas(&self) -> Vec<ChunkMetadata> {
        self.chunks().iter().map(|c| c.metadata()).collect()
    }

    fn current_bytes(&self) -> u64 {
        self.chunks()
            .iter()
            .filter(|c| !c.is_moved())
            .map(|c| c.size())
            .sum()
    }

    async fn read_nals(
        &self,
        cancel_id: &str,
        chunk: &ChunkId,
        selector: &mut Selector<'_>,
    ) -> Result<ReadOutcome<Vec<NalRecord>>> {
        let chunk = self.find(chunk)?;
        let started = Instant::now();
        let outcome = chunk.read_selected(cancel_id, selector).await;
        framehouse_observability::metrics::READ_LATENCY
            .with_label_values(&[TIER_NAME])
            .observe(started.elapsed().as_secs_f64());
        outcome
    }

    fn cancel_read_nals(&self, cancel_id: &str, chunk: &ChunkId) -> bool {
        match self.find(chunk) {
            Ok(chunk) => chunk.cancel_read(cancel_id),
            Err(_) => false,
        }
    }

    fn mark_moved(&self, chunk: &ChunkId) -> Result<bool> {
        Ok(self.find(chunk)?.mark_moved())
    }

    async fn export_chunk(&self, chunk: &ChunkId) -> Result<ExportedChunk> {
        self.find(chunk)?.export().await
    }

    async fn remove_chunk(&self, id: &ChunkId) -> Result<()> {
        let chunk = self.find(id)?;
        if chunk.is_live() {
            return Err(Error::ChunkLive(id.to_string()));
        }
        chunk.wait_for_reads(self.max_read_barrier_waits).await?;
        chunk.drain().await?;
        chunk.delete_files().await?;
        self.chunks_mut().retain(|c| c.id() != *id);
        info!(rate = self.rate, chunk = %id, size = chunk.size(), "Chunk removed from disk");
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        let chunks: Vec<Arc<ChunkLog>> = self.chunks().clone();
        for chunk in chunks {
            chunk.drain().await?;
        }
        Ok(())
    }
}

/// Chunk ids of every `.nal` file in `dir`. A missing directory has none.
pub async fn list_chunk_ids(dir: &Path) -> Result<Vec<ChunkId>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut ids = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("nal") {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        match stem.parse::<ChunkId>() {
            Ok(id) => ids.push(id),
            Err(e) => warn!(path = ?path, error = %e, "Ignoring unrecognized file"),
        }
    }
    Ok(ids)
}

/// Opens the disk tier of each rate under the configured root
#[derive(Debug, Default)]
pub struct LocalTierFactory;

#[async_trait]
impl TierFactory for LocalTierFactory {
    fn name(&self) -> &str {
        TIER_NAME
    }

    async fn open_rate(&self, rate: u64, config: &StorageConfig) -> Result<Arc<dyn StorageTier>> {
        Ok(Arc::new(RateStorage::open(rate, config).await?))
    }
}
