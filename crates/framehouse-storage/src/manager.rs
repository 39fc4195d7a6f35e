//! Storage Manager
//!
//! Top-level entry point: one pipeline per rate, created on first use.
//!
//! ## Architecture
//!
//! ```text
//! StorageManager
//!     │
//!     ├─ rate 1  ──→ ingest task ──→ TierOrchestrator
//!     │                                ├─ disk  (RateStorage, live chunk)
//!     │                                └─ hot   (ObjectStoreTier)
//!     │
//!     └─ rate 4  ──→ ingest task ──→ TierOrchestrator
//!                                      └─ disk
//! ```
//!
//! `add_nal` only queues the record; each rate's ingest task applies records
//! in order and reports rejections through logs and metrics. `flush` waits
//! until everything queued so far is applied and every migration it caused
//! has finished.
//!
//! ## Usage
//!
//! ```ignore
//! use framehouse_storage::{StorageConfig, StorageManager, VideoRequest};
//!
//! let manager = StorageManager::open(StorageConfig::default()).await?;
//! let mut new_rates = manager.subscribe_new_rates();
//!
//! manager.add_nal(record).await?;
//! manager.flush().await?;
//!
//! let ranges = manager.get_ranges(1).await;
//! let video = manager
//!     .get_video(&VideoRequest::new(1, ranges[0].first_time, 30), &Signal::new())
//!     .await?;
//! ```

use crate::config::StorageConfig;
use crate::error::{Error, Result};
use crate::orchestrator::{RangeSubscription, TierOrchestrator};
use crate::rate_storage::{list_chunk_ids, LocalTierFactory};
use crate::signal::Signal;
use crate::tiering::{select_tiers, StorageTier, TierFactory};
use crate::video::{VideoRequest, VideoResult};
use async_trait::async_trait;
use bytes::Bytes;
use framehouse_core::{NalRecord, SizedCache, Span, Timestamp};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const NEW_RATE_CAPACITY: usize = 64;

/// Turns a keyframe-aligned run of records into a playable container
#[async_trait]
pub trait VideoMuxer: Send + Sync {
    async fn mux(
        &self,
        records: &[NalRecord],
        rate: u64,
        next_key_frame_time: Option<Timestamp>,
    ) -> Result<Bytes>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum MuxedVideoResult {
    Muxed {
        data: Bytes,
        next_key_frame_time: Option<Timestamp>,
    },
    ExceedsLiveVideo,
    ExceedsNextTime,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct MuxKey {
    rate: u64,
    start_time: Timestamp,
    min_frames: u64,
    start_exclusive: bool,
}

#[derive(Clone)]
struct MuxedEntry {
    data: Bytes,
    next_key_frame_time: Option<Timestamp>,
}

enum IngestCmd {
    Nal(NalRecord),
    Barrier(oneshot::Sender<()>),
}

struct RatePipeline {
    orchestrator: Arc<TierOrchestrator>,
    ingest: Mutex<Option<mpsc::Sender<IngestCmd>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RatePipeline {
    fn sender(&self) -> Result<mpsc::Sender<IngestCmd>> {
        self.ingest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| Error::WriterClosed(format!("rate {}", self.orchestrator.rate())))
    }
}

fn rejection_reason(error: &Error) -> &'static str {
    match error {
        Error::TimeOrder { .. } => "time_order",
        Error::WrongRate { .. } => "wrong_rate",
        Error::Core(_) => "ranges",
        _ => "storage",
    }
}

async fn run_ingest(orchestrator: Arc<TierOrchestrator>, mut rx: mpsc::Receiver<IngestCmd>) {
    let rate = orchestrator.rate();
    debug!(rate, "Ingest task started");

    while let Some(cmd) = rx.recv().await {
        match cmd {
            IngestCmd::Nal(record) => {
                if let Err(e) = orchestrator.add_nal(&record).await {
                    warn!(
                        rate,
                        time = record.time,
                        seq = record.add_seq_num,
                        error = %e,
                        "NAL rejected"
                    );
                    framehouse_observability::metrics::RECORDS_REJECTED_TOTAL
                        .with_label_values(&[&rate.to_string(), rejection_reason(&e)])
                        .inc();
                }
            }
            IngestCmd::Barrier(done) => {
                let _ = done.send(());
            }
        }
    }

    debug!(rate, "Ingest task stopped");
}

/// Rate registry and routing for every stored rate
pub struct StorageManager {
    config: StorageConfig,
    remote_tiers: Vec<Arc<dyn TierFactory>>,
    pipelines: RwLock<HashMap<u64, Arc<RatePipeline>>>,
    new_rates: broadcast::Sender<u64>,
    muxer: Option<Arc<dyn VideoMuxer>>,
    muxed_cache: Mutex<SizedCache<MuxKey, MuxedEntry>>,
}

impl StorageManager {
    /// Manager with only the local tier. Nothing is recovered until a rate
    /// is first used; see [`StorageManager::open`].
    pub fn new(config: StorageConfig) -> Result<Self> {
        config.validate()?;
        let (new_rates, _) = broadcast::channel(NEW_RATE_CAPACITY);
        let muxed_cache = Mutex::new(SizedCache::new(config.muxed_cache_bytes));
        Ok(Self {
            config,
            remote_tiers: Vec::new(),
            pipelines: RwLock::new(HashMap::new()),
            new_rates,
            muxer: None,
            muxed_cache,
        })
    }

    /// Append a remote tier to every rate's candidate list
    pub fn with_remote_tier(mut self, factory: Arc<dyn TierFactory>) -> Self {
        self.remote_tiers.push(factory);
        self
    }

    pub fn with_muxer(mut self, muxer: Arc<dyn VideoMuxer>) -> Self {
        self.muxer = Some(muxer);
        self
    }

    /// Create the manager and recover every rate found on disk.
    pub async fn open(config: StorageConfig) -> Result<Self> {
        Self::new(config)?.recover().await
    }

    /// Probe rates `1, b, b², ...` until two consecutive rates have no
    /// chunks, opening a pipeline for each one found.
    pub async fn recover(self) -> Result<Self> {
        let base = self.config.base();
        let mut rate = 1u64;
        let mut empty_in_a_row = 0;

        while empty_in_a_row < 2 {
            if list_chunk_ids(&self.config.rate_dir(rate)).await?.is_empty() {
                empty_in_a_row += 1;
            } else {
                empty_in_a_row = 0;
                self.pipeline(rate).await?;
            }
            rate = match rate.checked_mul(base) {
                Some(next) => next,
                None => break,
            };
        }

        info!(
            root_dir = %self.config.root_dir.display(),
            rates = ?self.rates().await,
            next_add_seq_num = self.get_next_add_seq_num().await,
            "Storage recovered"
        );
        Ok(self)
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    async fn existing(&self, rate: u64) -> Option<Arc<RatePipeline>> {
        self.pipelines.read().await.get(&rate).cloned()
    }

    /// Get or create the pipeline for `rate`
    async fn pipeline(&self, rate: u64) -> Result<Arc<RatePipeline>> {
        // Fast path: read lock
        if let Some(pipeline) = self.existing(rate).await {
            return Ok(pipeline);
        }

        // Slow path: write lock
        let mut pipelines = self.pipelines.write().await;

        // Double-check (another task may have created it)
        if let Some(pipeline) = pipelines.get(&rate) {
            return Ok(pipeline.clone());
        }

        let mut candidates: Vec<Arc<dyn StorageTier>> =
            vec![LocalTierFactory.open_rate(rate, &self.config).await?];
        for factory in &self.remote_tiers {
            candidates.push(factory.open_rate(rate, &self.config).await?);
        }
        let plan = select_tiers(rate, candidates, &self.config)?;
        let orchestrator = TierOrchestrator::new(rate, plan, &self.config)?;

        let (tx, rx) = mpsc::channel(self.config.ingest_channel_capacity);
        let task = tokio::spawn(run_ingest(orchestrator.clone(), rx));
        let pipeline = Arc::new(RatePipeline {
            orchestrator,
            ingest: Mutex::new(Some(tx)),
            task: Mutex::new(Some(task)),
        });
        pipelines.insert(rate, pipeline.clone());

        framehouse_observability::metrics::RATES_ACTIVE.set(pipelines.len() as i64);
        info!(rate, "Created rate pipeline");
        // No subscribers is fine
        let _ = self.new_rates.send(rate);

        Ok(pipeline)
    }

    /// Queue a record for its rate's pipeline.
    ///
    /// Ordering and storage errors surface asynchronously as `warn!` logs and
    /// the rejected-records metric.
    ///
    /// # Errors
    /// - `WriterClosed` after [`StorageManager::shutdown`]
    /// - tier setup errors when this is the rate's first record
    pub async fn add_nal(&self, record: NalRecord) -> Result<()> {
        let pipeline = self.pipeline(record.rate).await?;
        pipeline
            .sender()?
            .send(IngestCmd::Nal(record))
            .await
            .map_err(|_| Error::WriterClosed(format!("rate {}", pipeline.orchestrator.rate())))
    }

    /// Wait until every queued record is applied, every migration has
    /// finished, and every tier has flushed.
    pub async fn flush(&self) -> Result<()> {
        let pipelines: Vec<_> = self.pipelines.read().await.values().cloned().collect();
        for pipeline in pipelines {
            if let Ok(sender) = pipeline.sender() {
                let (done_tx, done_rx) = oneshot::channel();
                if sender.send(IngestCmd::Barrier(done_tx)).await.is_ok() {
                    let _ = done_rx.await;
                }
            }
            pipeline.orchestrator.wait_for_migrations().await;
            pipeline.orchestrator.flush().await?;
        }
        Ok(())
    }

    /// Rates that currently have a pipeline, ascending
    pub async fn rates(&self) -> Vec<u64> {
        let mut rates: Vec<u64> = self.pipelines.read().await.keys().copied().collect();
        rates.sort_unstable();
        rates
    }

    pub fn subscribe_new_rates(&self) -> broadcast::Receiver<u64> {
        self.new_rates.subscribe()
    }

    /// Stored spans of `rate`; empty for a rate never seen
    pub async fn get_ranges(&self, rate: u64) -> Vec<Span> {
        match self.existing(rate).await {
            Some(pipeline) => pipeline.orchestrator.get_ranges(),
            None => Vec::new(),
        }
    }

    /// Current spans of `rate` plus a receiver for later changes.
    ///
    /// Creates the rate's pipeline if needed so a subscriber can wait for a
    /// rate before its first record.
    pub async fn subscribe_to_ranges(
        &self,
        rate: u64,
    ) -> Result<(Vec<Span>, RangeSubscription)> {
        let pipeline = self.pipeline(rate).await?;
        let events = pipeline.orchestrator.subscribe();
        Ok((pipeline.orchestrator.get_ranges(), events))
    }

    pub async fn summarize_ranges(&self, rate: u64, range: &Span, max: usize) -> Result<Vec<Span>> {
        match self.existing(rate).await {
            Some(pipeline) => pipeline.orchestrator.summarize_ranges(range, max),
            None => Ok(Vec::new()),
        }
    }

    /// One past the largest `add_seq_num` stored in any rate, 0 when empty
    pub async fn get_next_add_seq_num(&self) -> u64 {
        self.pipelines
            .read()
            .await
            .values()
            .filter_map(|p| p.orchestrator.last_add_seq_num())
            .max()
            .map_or(0, |seq| seq + 1)
    }

    pub async fn get_video(&self, request: &VideoRequest, cancel: &Signal) -> Result<VideoResult> {
        match self.existing(request.rate).await {
            Some(pipeline) => pipeline.orchestrator.get_video(request, cancel).await,
            None => Ok(VideoResult::ExceedsLiveVideo),
        }
    }

    /// [`StorageManager::get_video`] passed through the muxer, cached by
    /// window start.
    ///
    /// # Errors
    /// - `Mux` if no muxer is configured or muxing fails
    pub async fn get_muxed_video(
        &self,
        request: &VideoRequest,
        cancel: &Signal,
    ) -> Result<MuxedVideoResult> {
        let muxer = self
            .muxer
            .clone()
            .ok_or_else(|| Error::Mux("no muxer configured".to_string()))?;
        let key = MuxKey {
            rate: request.rate,
            start_time: request.start_time,
            min_frames: request.min_frames,
            start_exclusive: request.start_exclusive,
        };

        let cached = self
            .muxed_cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .cloned();
        if let Some(entry) = cached {
            framehouse_observability::metrics::CACHE_HITS_TOTAL
                .with_label_values(&["muxed"])
                .inc();
            return Ok(MuxedVideoResult::Muxed {
                data: entry.data,
                next_key_frame_time: entry.next_key_frame_time,
            });
        }
        framehouse_observability::metrics::CACHE_MISSES_TOTAL
            .with_label_values(&["muxed"])
            .inc();

        let mut request = request.clone();
        request.only_times = false;
        let video = match self.get_video(&request, cancel).await? {
            VideoResult::Video(video) => video,
            VideoResult::ExceedsLiveVideo => return Ok(MuxedVideoResult::ExceedsLiveVideo),
            VideoResult::ExceedsNextTime => return Ok(MuxedVideoResult::ExceedsNextTime),
            VideoResult::Cancelled => return Ok(MuxedVideoResult::Cancelled),
        };

        let data = muxer
            .mux(&video.records, video.rate, video.next_key_frame_time)
            .await?;
        {
            let mut cache = self.muxed_cache.lock().unwrap_or_else(PoisonError::into_inner);
            let evicted = cache.insert(
                key,
                MuxedEntry {
                    data: data.clone(),
                    next_key_frame_time: video.next_key_frame_time,
                },
                data.len() as u64,
            );
            framehouse_observability::metrics::MUXED_CACHE_BYTES.set(cache.total_size() as i64);
            if evicted > 0 {
                debug!(evicted, cached = cache.len(), "Muxed cache evicted entries");
            }
        }

        Ok(MuxedVideoResult::Muxed {
            data,
            next_key_frame_time: video.next_key_frame_time,
        })
    }

    /// Stop accepting records, apply what is queued, and flush every tier.
    pub async fn shutdown(&self) -> Result<()> {
        let pipelines: Vec<_> = self.pipelines.read().await.values().cloned().collect();
        for pipeline in &pipelines {
            pipeline
                .ingest
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
        }
        for pipeline in &pipelines {
            let task = pipeline.task.lock().unwrap_or_else(PoisonError::into_inner).take();
            if let Some(task) = task {
                if let Err(e) = task.await {
                    error!(rate = pipeline.orchestrator.rate(), error = %e, "Ingest task panicked");
                }
            }
            pipeline.orchestrator.wait_for_migrations().await;
            pipeline.orchestrator.flush().await?;
        }
        info!(rates = pipelines.len(), "Storage shut down");
        Ok(())
    }
}
