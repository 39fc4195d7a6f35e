//! Object Store Tier
//!
//! Holds finalized chunks of one rate as whole blobs in an `object_store`
//! backend (S3, local filesystem, or in-memory for tests):
//!
//! ```text
//! {prefix}/rate_{rate}/chunk_rate_4_addSeqNum_812.chunk   [u32 BE index len][JSON index][records]
//! {prefix}/rate_{rate}/chunk_rate_4_addSeqNum_812.meta    ChunkMetadata as JSON
//! ```
//!
//! Metadata is listed once at open and kept in memory. Blobs are fetched on
//! the first read and kept decoded in a size-bounded cache.
//!
//! ## Pricing
//!
//! | Class  | Storage Class  | $/GB-month | $/GB download | Minimum storage |
//! |--------|----------------|------------|---------------|-----------------|
//! | Hot    | STANDARD       | 0.023      | 0.09          | none            |
//! | Warm   | STANDARD_IA    | 0.0125     | 0.10          | 30 days         |
//! | Cold   | GLACIER_IR     | 0.004      | 0.12          | 90 days         |
//! | Frozen | DEEP_ARCHIVE   | 0.00099    | 0.11          | 180 days        |
//!
//! A class with a minimum storage duration holds nothing when the budget
//! cannot keep a chunk for that long: every chunk would be billed for the
//! full minimum anyway.

use crate::chunk::{
    ChunkId, ChunkMetadata, ExportedChunk, FixedEntry, IndexSlot, ReadOutcome, Selection,
    Selector,
};
use crate::config::{StorageConfig, GB};
use crate::error::{Error, Result};
use crate::signal::Signal;
use crate::tiering::{StorageTier, TierFactory};
use async_trait::async_trait;
use bytes::Bytes;
use framehouse_core::codec::decode_chunk_blob;
use framehouse_core::{codec::decode_record, IndexEntry, NalRecord, SizedCache};
use futures::TryStreamExt;
use object_store::path::Path;
use object_store::ObjectStore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Instant;
use tracing::{debug, info, warn};

const SECONDS_PER_DAY: f64 = 86_400.0;

/// Object storage pricing class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectTierClass {
    Hot,
    Warm,
    Cold,
    Frozen,
}

impl ObjectTierClass {
    /// S3 storage class name
    pub fn storage_class(&self) -> &'static str {
        match self {
            ObjectTierClass::Hot => "STANDARD",
            ObjectTierClass::Warm => "STANDARD_IA",
            ObjectTierClass::Cold => "GLACIER_IR",
            ObjectTierClass::Frozen => "DEEP_ARCHIVE",
        }
    }

    pub fn cost_per_gb_month(&self) -> f64 {
        match self {
            ObjectTierClass::Hot => 0.023,
            ObjectTierClass::Warm => 0.0125,
            ObjectTierClass::Cold => 0.004,
            ObjectTierClass::Frozen => 0.00099,
        }
    }

    /// Transfer plus retrieval, per GB
    pub fn download_cost_per_gb(&self) -> f64 {
        match self {
            ObjectTierClass::Hot => 0.09,
            ObjectTierClass::Warm => 0.10,
            ObjectTierClass::Cold => 0.12,
            ObjectTierClass::Frozen => 0.11,
        }
    }

    pub fn cost_per_request(&self) -> f64 {
        match self {
            ObjectTierClass::Hot => 0.000_000_4,
            ObjectTierClass::Warm => 0.000_001,
            ObjectTierClass::Cold => 0.000_01,
            ObjectTierClass::Frozen => 0.000_1,
        }
    }

    pub fn min_storage_days(&self) -> f64 {
        match self {
            ObjectTierClass::Hot => 0.0,
            ObjectTierClass::Warm => 30.0,
            ObjectTierClass::Cold => 90.0,
            ObjectTierClass::Frozen => 180.0,
        }
    }
}

impl std::fmt::Display for ObjectTierClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ObjectTierClass::Hot => write!(f, "hot"),
            ObjectTierClass::Warm => write!(f, "warm"),
            ObjectTierClass::Cold => write!(f, "cold"),
            ObjectTierClass::Frozen => write!(f, "frozen"),
        }
    }
}

impl std::str::FromStr for ObjectTierClass {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "hot" => Ok(ObjectTierClass::Hot),
            "warm" => Ok(ObjectTierClass::Warm),
            "cold" => Ok(ObjectTierClass::Cold),
            "frozen" => Ok(ObjectTierClass::Frozen),
            other => Err(Error::Config(format!("unknown storage class: {}", other))),
        }
    }
}

struct CachedChunk {
    entries: Vec<IndexEntry>,
    log: Bytes,
}

struct RemoteRead {
    cancel: Signal,
    done: Signal,
}

/// Registration of one read, released on drop
struct RemoteReadGuard<'a> {
    tier: &'a ObjectStoreTier,
    chunk: ChunkId,
    cancel_id: String,
    cancel: Signal,
}

impl Drop for RemoteReadGuard<'_> {
    fn drop(&mut self) {
        let mut reads = self.tier.reads();
        if let Some(chunk_reads) = reads.get_mut(&self.chunk) {
            if let Some(read) = chunk_reads.remove(&self.cancel_id) {
                read.done.resolve();
            }
            if chunk_reads.is_empty() {
                reads.remove(&self.chunk);
            }
        }
    }
}

pub struct ObjectStoreTier {
    rate: u64,
    name: String,
    class: ObjectTierClass,
    store: Arc<dyn ObjectStore>,
    dir: Path,
    max_read_barrier_waits: u32,
    /// Oldest first
    chunks: RwLock<Vec<ChunkMetadata>>,
    blobs: Mutex<SizedCache<ChunkId, Arc<CachedChunk>>>,
    reads: Mutex<HashMap<ChunkId, HashMap<String, RemoteRead>>>,
}

impl ObjectStoreTier {
    /// Open the tier of `rate` under `prefix`, listing the chunks already stored.
    ///
    /// Unreadable metadata objects are logged and skipped.
    pub async fn open(
        store: Arc<dyn ObjectStore>,
        prefix: &str,
        class: ObjectTierClass,
        rate: u64,
        config: &StorageConfig,
    ) -> Result<Self> {
        let dir = Path::from(format!("{}/rate_{}", prefix.trim_end_matches('/'), rate));
        let listed: Vec<_> = store.list(Some(&dir)).try_collect().await?;

        let mut chunks = Vec::new();
        for object in listed {
            if object.location.extension() != Some("meta") {
                continue;
            }
            match Self::load_metadata(store.as_ref(), &object.location).await {
                Ok(metadata) => chunks.push(metadata),
                Err(e) => warn!(
                    rate,
                    path = %object.location,
                    error = %e,
                    "Unreadable chunk metadata, skipping"
                ),
            }
        }
        chunks.sort_by_key(|m| m.chunk_id.start_add_seq_num);

        let name = format!("{}_{}", prefix.trim_end_matches('/'), class);
        info!(
            rate,
            tier = %name,
            storage_class = class.storage_class(),
            chunks = chunks.len(),
            "Object store tier opened"
        );

        Ok(Self {
            rate,
            name,
            class,
            store,
            dir,
            max_read_barrier_waits: config.max_read_barrier_waits,
            chunks: RwLock::new(chunks),
            blobs: Mutex::new(SizedCache::new(config.blob_cache_bytes)),
            reads: Mutex::new(HashMap::new()),
        })
    }

    async fn load_metadata(store: &dyn ObjectStore, location: &Path) -> Result<ChunkMetadata> {
        let bytes = store.get(location).await?.bytes().await?;
        let mut metadata: ChunkMetadata = serde_json::from_slice(&bytes)?;
        metadata.is_moved = false;
        metadata.is_live = false;
        Ok(metadata)
    }

    pub fn class(&self) -> ObjectTierClass {
        self.class
    }

    fn blob_path(&self, id: &ChunkId) -> Path {
        self.dir.child(format!("{}.chunk", id))
    }

    fn meta_path(&self, id: &ChunkId) -> Path {
        self.dir.child(format!("{}.meta", id))
    }

    fn reads(&self) -> MutexGuard<'_, HashMap<ChunkId, HashMap<String, RemoteRead>>> {
        self.reads.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn blobs(&self) -> MutexGuard<'_, SizedCache<ChunkId, Arc<CachedChunk>>> {
        self.blobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn metadata(&self, id: &ChunkId) -> Result<ChunkMetadata> {
        self.chunks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|m| m.chunk_id == *id)
            .cloned()
            .ok_or_else(|| Error::ChunkNotFound(id.to_string()))
    }

    fn register_read(&self, chunk: ChunkId, cancel_id: &str) -> Result<RemoteReadGuard<'_>> {
        let mut reads = self.reads();
        let chunk_reads = reads.entry(chunk).or_default();
        if chunk_reads.contains_key(cancel_id) {
            return Err(Error::DuplicateRead {
                cancel_id: cancel_id.to_string(),
                chunk: chunk.to_string(),
            });
        }
        let cancel = Signal::new();
        chunk_reads.insert(
            cancel_id.to_string(),
            RemoteRead {
                cancel: cancel.clone(),
                done: Signal::new(),
            },
        );
        Ok(RemoteReadGuard {
            tier: self,
            chunk,
            cancel_id: cancel_id.to_string(),
            cancel,
        })
    }

    async fn fetch(&self, id: &ChunkId) -> Result<Arc<CachedChunk>> {
        if let Some(cached) = self.blobs().get(id).cloned() {
            framehouse_observability::metrics::CACHE_HITS_TOTAL
                .with_label_values(&["blob"])
                .inc();
            return Ok(cached);
        }
        framehouse_observability::metrics::CACHE_MISSES_TOTAL
            .with_label_values(&["blob"])
            .inc();

        let data = self.store.get(&self.blob_path(id)).await?.bytes().await?;
        let (entries, log) = decode_chunk_blob(&data)?;
        let cached = Arc::new(CachedChunk { entries, log });
        self.blobs().insert(*id, cached.clone(), data.len() as u64);
        debug!(tier = %self.name, chunk = %id, bytes = data.len(), "Chunk blob fetched");
        Ok(cached)
    }

    fn decode(id: &ChunkId, chunk: &CachedChunk, entries: &[IndexEntry]) -> Result<Vec<NalRecord>> {
        entries
            .iter()
            .map(|entry| {
                let start = entry.pos as usize;
                let end = entry.end() as usize;
                if end > chunk.log.len() {
                    return Err(Error::Corrupt {
                        path: id.to_string().into(),
                        reason: format!("record at {} runs past the blob", entry.pos),
                    });
                }
                Ok(decode_record(&chunk.log[start..end], entry.pos)?)
            })
            .collect()
    }

    async fn delete_if_exists(&self, path: &Path) -> Result<()> {
        match self.store.delete(path).await {
            Ok(()) => Ok(()),
            Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl StorageTier for ObjectStoreTier {
    fn name(&self) -> &str {
        &self.name
    }

    fn rate(&self) -> u64 {
        self.rate
    }

    fn max_gb(&self, bytes_per_second: f64, _seconds_per_chunk: f64, max_cost: f64) -> f64 {
        let max_gb = max_cost / self.class.cost_per_gb_month();
        let min_days = self.class.min_storage_days();
        if min_days > 0.0 && bytes_per_second > 0.0 {
            let retained_days = max_gb * GB / bytes_per_second / SECONDS_PER_DAY;
            if retained_days < min_days {
                return 0.0;
            }
        }
        max_gb
    }

    fn cost_per_gb_download(&self, bytes: u64) -> f64 {
        let gb = (bytes as f64 / GB).max(f64::MIN_POSITIVE);
        self.class.download_cost_per_gb() + self.class.cost_per_request() / gb
    }

    fn is_fixed_storage_size(&self) -> bool {
        false
    }

    async fn add_chunk(&self, chunk: ExportedChunk) -> Result<()> {
        let id = chunk.metadata.chunk_id;
        if chunk.metadata.is_live {
            return Err(Error::ChunkLive(id.to_string()));
        }
        let mut metadata = chunk.metadata;
        metadata.is_moved = false;

        self.store.put(&self.blob_path(&id), chunk.data.clone()).await?;
        self.store
            .put(&self.meta_path(&id), Bytes::from(serde_json::to_vec(&metadata)?))
            .await?;

        let mut chunks = self.chunks.write().unwrap_or_else(PoisonError::into_inner);
        chunks.retain(|m| m.chunk_id != id);
        let idx = chunks.partition_point(|m| m.chunk_id.start_add_seq_num < id.start_add_seq_num);
        chunks.insert(idx, metadata);
        info!(rate = self.rate, tier = %self.name, chunk = %id, bytes = chunk.data.len(), "Chunk stored");
        Ok(())
    }

    fn chunk_metadatas(&self) -> Vec<ChunkMetadata> {
        self.chunks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn read_nals(
        &self,
        cancel_id: &str,
        chunk: &ChunkId,
        selector: &mut Selector<'_>,
    ) -> Result<ReadOutcome<Vec<NalRecord>>> {
        let metadata = self.metadata(chunk)?;
        if metadata.is_moved {
            return Err(Error::ChunkMoved(chunk.to_string()));
        }
        let guard = self.register_read(*chunk, cancel_id)?;
        let started = Instant::now();

        let work = async {
            let cached = self.fetch(chunk).await?;
            let slots: Vec<IndexSlot> = cached
                .entries
                .iter()
                .map(|entry| {
                    IndexSlot::Fixed(FixedEntry {
                        entry: *entry,
                        written: Signal::resolved(),
                    })
                })
                .collect();
            loop {
                match selector(&slots)? {
                    Selection::Read(entries) => return Self::decode(chunk, &cached, &entries),
                    Selection::Wait(signal) => signal.wait().await,
                    Selection::Skip => return Ok(Vec::new()),
                }
            }
        };

        let outcome = tokio::select! {
            biased;
            _ = guard.cancel.wait() => {
                framehouse_observability::metrics::READS_CANCELLED_TOTAL.inc();
                Ok(ReadOutcome::Cancelled)
            }
            result = work => result.map(ReadOutcome::Ready),
        };
        framehouse_observability::metrics::READ_LATENCY
            .with_label_values(&[&self.name])
            .observe(started.elapsed().as_secs_f64());
        outcome
    }

    fn cancel_read_nals(&self, cancel_id: &str, chunk: &ChunkId) -> bool {
        match self.reads().get(chunk).and_then(|reads| reads.get(cancel_id)) {
            Some(read) => {
                read.cancel.resolve();
                true
            }
            None => false,
        }
    }

    fn mark_moved(&self, chunk: &ChunkId) -> Result<bool> {
        let mut chunks = self.chunks.write().unwrap_or_else(PoisonError::into_inner);
        let metadata = chunks
            .iter_mut()
            .find(|m| m.chunk_id == *chunk)
            .ok_or_else(|| Error::ChunkNotFound(chunk.to_string()))?;
        let was_moved = metadata.is_moved;
        metadata.is_moved = true;
        Ok(!was_moved)
    }

    async fn export_chunk(&self, chunk: &ChunkId) -> Result<ExportedChunk> {
        let mut metadata = self.metadata(chunk)?;
        metadata.is_moved = false;
        let data = self.store.get(&self.blob_path(chunk)).await?.bytes().await?;
        Ok(ExportedChunk { metadata, data })
    }

    async fn remove_chunk(&self, id: &ChunkId) -> Result<()> {
        let mut waits = 0;
        loop {
            let pending: Vec<Signal> = self
                .reads()
                .get(id)
                .map(|reads| reads.values().map(|r| r.done.clone()).collect())
                .unwrap_or_default();
            if pending.is_empty() {
                break;
            }
            if waits >= self.max_read_barrier_waits {
                return Err(Error::ReadBarrier {
                    chunk: id.to_string(),
                    waits,
                });
            }
            futures::future::join_all(pending.iter().map(|done| done.wait())).await;
            waits += 1;
        }

        self.delete_if_exists(&self.blob_path(id)).await?;
        self.delete_if_exists(&self.meta_path(id)).await?;
        self.chunks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|m| m.chunk_id != *id);
        self.blobs().remove(id);
        info!(rate = self.rate, tier = %self.name, chunk = %id, "Chunk removed from object store");
        Ok(())
    }
}

/// Opens an object store tier for each rate
pub struct ObjectStoreTierFactory {
    store: Arc<dyn ObjectStore>,
    prefix: String,
    class: ObjectTierClass,
}

impl ObjectStoreTierFactory {
    pub fn new(store: Arc<dyn ObjectStore>, prefix: impl Into<String>, class: ObjectTierClass) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            class,
        }
    }
}

#[async_trait]
impl TierFactory for ObjectStoreTierFactory {
    fn name(&self) -> &str {
        &self.prefix
    }

    async fn open_rate(&self, rate: u64, config: &StorageConfig) -> Result<Arc<dyn StorageTier>> {
        let tier = ObjectStoreTier::open(self.store.clone(), &self.prefix, self.class, rate, config).await?;
        Ok(Arc::new(tier))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk_log::ChunkLog;
    use framehouse_core::FrameType;
    use object_store::memory::InMemory;
    use std::time::Duration;
    use tempfile::TempDir;

    fn record(time: i64, seq: u64) -> NalRecord {
        NalRecord {
            rate: 1,
            time,
            frame_type: if seq % 5 == 0 {
                FrameType::Keyframe
            } else {
                FrameType::Interframe
            },
            width: 320,
            height: 240,
            sps: Bytes::from_static(&[0x67, 0x01]),
            pps: Bytes::from_static(&[0x68, 0x02]),
            nal: Bytes::from(vec![seq as u8; 64]),
            add_seq_num: seq,
        }
    }

    async fn exported_chunk(dir: &TempDir, start: u64, count: u64) -> ExportedChunk {
        let first = record(start as i64 * 1_000, start);
        let chunk = ChunkLog::create(dir.path(), &first, false).await.unwrap();
        for seq in start..start + count {
            chunk.append(&record(seq as i64 * 1_000, seq)).unwrap();
        }
        chunk.finalize().unwrap();
        chunk.export().await.unwrap()
    }

    async fn tier(store: Arc<dyn ObjectStore>) -> ObjectStoreTier {
        ObjectStoreTier::open(store, "remote", ObjectTierClass::Hot, 1, &StorageConfig::default())
            .await
            .unwrap()
    }

    fn read_all() -> impl FnMut(&[IndexSlot]) -> Result<Selection> + Send {
        |slots: &[IndexSlot]| Ok(Selection::Read(slots.iter().filter_map(|s| s.entry().copied()).collect()))
    }

    #[tokio::test]
    async fn test_add_and_read_chunk() {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let tier = tier(store).await;

        let exported = exported_chunk(&dir, 0, 10).await;
        let size = exported.metadata.size;
        tier.add_chunk(exported).await.unwrap();
        assert_eq!(tier.current_bytes(), size);

        let mut selector = read_all();
        let records = tier
            .read_nals("r1", &ChunkId::new(1, 0), &mut selector)
            .await
            .unwrap()
            .ready()
            .unwrap();
        assert_eq!(records.len(), 10);
        assert_eq!(records[7], record(7_000, 7));
    }

    #[tokio::test]
    async fn test_reopen_lists_stored_chunks() {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        {
            let tier = tier(store.clone()).await;
            tier.add_chunk(exported_chunk(&dir, 10, 5).await).await.unwrap();
            tier.add_chunk(exported_chunk(&dir, 0, 5).await).await.unwrap();
        }

        let tier = tier(store).await;
        let ids: Vec<ChunkId> = tier.chunk_metadatas().iter().map(|m| m.chunk_id).collect();
        assert_eq!(ids, vec![ChunkId::new(1, 0), ChunkId::new(1, 10)]);
        assert_eq!(tier.chunk_metadatas()[1].first_time(), Some(10_000));
    }

    #[tokio::test]
    async fn test_export_round_trips_blob() {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let tier = tier(store).await;
        let exported = exported_chunk(&dir, 0, 3).await;
        let data = exported.data.clone();
        tier.add_chunk(exported).await.unwrap();

        let again = tier.export_chunk(&ChunkId::new(1, 0)).await.unwrap();
        assert_eq!(again.data, data);
        assert!(!again.metadata.is_moved);
    }

    #[tokio::test]
    async fn test_moved_chunk_rejects_reads_and_removal_waits() {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let tier = Arc::new(tier(store).await);
        tier.add_chunk(exported_chunk(&dir, 0, 3).await).await.unwrap();
        let id = ChunkId::new(1, 0);

        // A read that waits forever until cancelled
        let reader = {
            let tier = tier.clone();
            tokio::spawn(async move {
                let never = Signal::new();
                let mut selector =
                    move |_: &[IndexSlot]| -> Result<Selection> { Ok(Selection::Wait(never.clone())) };
                tier.read_nals("r1", &id, &mut selector).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(tier.mark_moved(&id).unwrap());
        assert_eq!(tier.current_bytes(), 0);
        let mut selector = read_all();
        assert!(matches!(
            tier.read_nals("r2", &id, &mut selector).await,
            Err(Error::ChunkMoved(_))
        ));

        let remover = {
            let tier = tier.clone();
            tokio::spawn(async move { tier.remove_chunk(&id).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!remover.is_finished());

        assert!(tier.cancel_read_nals("r1", &id));
        assert!(reader.await.unwrap().unwrap().is_cancelled());
        tokio::time::timeout(Duration::from_secs(1), remover)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(tier.chunk_metadatas().is_empty());
    }

    #[tokio::test]
    async fn test_cost_model() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let tier = tier(store.clone()).await;
        assert!((tier.max_gb(1000.0, 20.0, 0.23) - 10.0).abs() < 1e-9);
        assert!(tier.cost_per_gb_download(1 << 30) > ObjectTierClass::Hot.download_cost_per_gb());
        assert!(tier.cost_per_gb_download(1 << 20) > tier.cost_per_gb_download(1 << 30));
        assert!(!tier.is_fixed_storage_size());
        assert!(!tier.supports_live_append());

        // 1GB at 1MB/s is gone in under 20 minutes, far below the 180 day minimum
        let frozen = ObjectStoreTier::open(store, "archive", ObjectTierClass::Frozen, 1, &StorageConfig::default())
            .await
            .unwrap();
        assert_eq!(frozen.max_gb(1024.0 * 1024.0, 20.0, 0.00099), 0.0);
        assert!(frozen.max_gb(1.0, 20.0, 0.00099) > 0.0);
    }

    #[test]
    fn test_parse_class() {
        assert_eq!("cold".parse::<ObjectTierClass>().unwrap(), ObjectTierClass::Cold);
        assert_eq!("HOT".parse::<ObjectTierClass>().unwrap(), ObjectTierClass::Hot);
        assert!(matches!("tape".parse::<ObjectTierClass>(), Err(Error::Config(_))));
    }
}
