//! Tier Orchestrator
//!
//! Owns one rate's tier chain, its time ranges, and the migrations between
//! tiers.
//!
//! ## Ingest
//!
//! ```text
//! add_nal(record)
//!   ├─→ head tier appends (rotating chunks as needed)
//!   ├─→ RangeSet + RangeSummary updated, Changed event broadcast
//!   └─→ enforce_budget(0)
//!         while tier bytes > max_bytes:
//!           oldest finalized chunk → mark moved → spawn migration
//! ```
//!
//! ## Migration
//!
//! A moved chunk is no longer counted against its tier and accepts no new
//! reads. Its migration task either hands it to the next tier (export, then
//! `add_chunk` with retries, then the next tier's budget is enforced) or, on
//! the last tier, drops its time span from the ranges and broadcasts a
//! `Deleted` event. The local copy is removed last, once every read
//! registered against it has finished.

use crate::chunk::ChunkId;
use crate::config::StorageConfig;
use crate::error::{Error, Result};
use crate::signal::Signal;
use crate::tiering::{StorageTier, TierPlan};
use crate::video::{get_video, VideoRequest, VideoResult};
use framehouse_core::summary::DEFAULT_SUMMARY_FACTOR;
use framehouse_core::{NalRecord, RangeSet, RangeSummary, Span, Timestamp};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const RANGE_EVENT_CAPACITY: usize = 256;

/// Change to a rate's time ranges
#[derive(Debug, Clone, PartialEq)]
pub enum RangeEvent {
    /// These spans were added or grew
    Changed(Vec<Span>),
    /// Everything at or before this time is gone
    Deleted(Timestamp),
    /// Events were missed; these are all of the rate's spans now
    Reset(Vec<Span>),
}

/// A subscriber's stream of one rate's [`RangeEvent`]s.
///
/// Events are buffered per subscriber up to a fixed capacity. A subscriber
/// that falls further behind skips the backlog and receives one
/// `RangeEvent::Reset` carrying the current spans, then live events again.
pub struct RangeSubscription {
    rate: u64,
    events: broadcast::Receiver<RangeEvent>,
    orchestrator: Weak<TierOrchestrator>,
}

impl RangeSubscription {
    /// Next event, or `None` once the rate's pipeline is gone
    pub async fn recv(&mut self) -> Option<RangeEvent> {
        match self.events.recv().await {
            Ok(event) => Some(event),
            Err(RecvError::Lagged(missed)) => self.reset(missed),
            Err(RecvError::Closed) => None,
        }
    }

    /// Next queued event without waiting
    pub fn try_recv(&mut self) -> Option<RangeEvent> {
        match self.events.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Lagged(missed)) => self.reset(missed),
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => None,
        }
    }

    fn reset(&mut self, missed: u64) -> Option<RangeEvent> {
        let orchestrator = self.orchestrator.upgrade()?;
        // Resubscribe before the snapshot so nothing falls between them
        self.events = self.events.resubscribe();
        warn!(rate = self.rate, missed, "Range subscriber lagged, resending ranges");
        Some(RangeEvent::Reset(orchestrator.get_ranges()))
    }
}

struct RangeState {
    ranges: RangeSet,
    summary: RangeSummary,
    /// Latest span as last given to the summary
    summary_tail: Option<Span>,
    last_time: Option<Timestamp>,
}

impl RangeState {
    fn from_spans(rate: u64, spans: impl IntoIterator<Item = Span>) -> Result<Self> {
        let mut ranges = RangeSet::for_rate(rate);
        for span in spans {
            if let Err(e) = ranges.add_or_extend(span) {
                warn!(rate, error = %e, "Chunk ranges overlap, ignoring span");
            }
        }
        let mut state = Self {
            ranges,
            summary: RangeSummary::new(DEFAULT_SUMMARY_FACTOR)?,
            summary_tail: None,
            last_time: None,
        };
        state.rebuild_summary()?;
        state.last_time = state.ranges.last().map(|s| s.last_time);
        Ok(state)
    }

    fn rebuild_summary(&mut self) -> Result<()> {
        let mut summary = RangeSummary::new(DEFAULT_SUMMARY_FACTOR)?;
        for span in self.ranges.spans() {
            summary.add_range(span.clone())?;
        }
        self.summary = summary;
        self.summary_tail = self.ranges.last().cloned();
        Ok(())
    }
}

pub struct TierOrchestrator {
    rate: u64,
    plan: TierPlan,
    export_retries: u32,
    export_retry_backoff: Duration,
    max_live_iterations: u32,
    state: Mutex<RangeState>,
    events: broadcast::Sender<RangeEvent>,
    migrations: Mutex<Vec<JoinHandle<()>>>,
}

impl TierOrchestrator {
    /// Build the orchestrator over an already selected tier plan, folding
    /// every stored chunk's ranges into the rate's ranges.
    pub fn new(rate: u64, plan: TierPlan, config: &StorageConfig) -> Result<Arc<Self>> {
        if plan.write.is_empty() {
            return Err(Error::TierSetup(format!("empty write chain for rate {}", rate)));
        }

        let mut seen = HashSet::new();
        let mut spans = Vec::new();
        for budget in plan.read.iter().chain(plan.write.iter()) {
            for metadata in budget.tier.chunk_metadatas() {
                if seen.insert(metadata.chunk_id) {
                    spans.extend(metadata.ranges);
                }
            }
        }
        spans.sort_by_key(|s| s.first_time);
        let state = RangeState::from_spans(rate, spans)?;

        info!(
            rate,
            tiers = plan.write.len(),
            ranges = state.ranges.len(),
            chunks = seen.len(),
            "Tier orchestrator ready"
        );

        let (events, _) = broadcast::channel(RANGE_EVENT_CAPACITY);
        let orchestrator = Arc::new(Self {
            rate,
            plan,
            export_retries: config.export_retries.max(1),
            export_retry_backoff: config.export_retry_backoff,
            max_live_iterations: config.max_live_iterations,
            state: Mutex::new(state),
            events,
            migrations: Mutex::new(Vec::new()),
        });
        for level in 0..orchestrator.plan.write.len() {
            orchestrator.enforce_budget(level);
        }
        Ok(orchestrator)
    }

    pub fn rate(&self) -> u64 {
        self.rate
    }

    pub fn plan(&self) -> &TierPlan {
        &self.plan
    }

    fn state(&self) -> MutexGuard<'_, RangeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append one record to the head tier and update the rate's ranges.
    ///
    /// # Errors
    /// - `TimeOrder` if the record does not advance past the rate's last time
    /// - any append error from the head tier
    pub async fn add_nal(self: &Arc<Self>, record: &NalRecord) -> Result<()> {
        if let Some(last_time) = self.state().last_time {
            if record.time <= last_time {
                return Err(Error::TimeOrder {
                    rate: self.rate,
                    time: record.time,
                    last_time,
                });
            }
        }

        self.plan.write[0].tier.add_single_nal(record).await?;
        self.record_time(record.time)?;
        self.enforce_budget(0);
        Ok(())
    }

    fn record_time(&self, time: Timestamp) -> Result<()> {
        let mut state = self.state();
        let min_gap = state.ranges.min_gap();
        let span = match state.last_time {
            Some(last) if time > last && time - last < min_gap => Span::new(last, time, 1),
            _ => Span::point(time),
        };
        state.last_time = Some(time);
        let changed = state.ranges.add_or_extend(span)?;

        if let Some(latest) = state.ranges.last().cloned() {
            let result = match state.summary_tail.take() {
                Some(previous) if previous.first_time == latest.first_time => {
                    state.summary.mutate_range(&previous, &latest)
                }
                _ => state.summary.add_range(latest.clone()),
            };
            if let Err(e) = result {
                error!(rate = self.rate, error = %e, "Range summary rejected update");
            }
            state.summary_tail = Some(latest);
        }
        drop(state);

        if !changed.is_empty() {
            // No subscribers is fine
            let _ = self.events.send(RangeEvent::Changed(changed));
        }
        Ok(())
    }

    /// Move chunks out of tier `level` until it fits its budget.
    pub fn enforce_budget(self: &Arc<Self>, level: usize) {
        let Some(budget) = self.plan.write.get(level) else {
            return;
        };
        let tier = &budget.tier;

        while tier.current_bytes() > budget.max_bytes {
            let candidate = tier.chunk_metadatas().into_iter().find(|m| !m.is_moved);
            let Some(candidate) = candidate else {
                break;
            };
            if candidate.is_live {
                // Nothing older than the live chunk is left to move
                break;
            }

            let id = candidate.chunk_id;
            match tier.mark_moved(&id) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    warn!(rate = self.rate, tier = tier.name(), chunk = %id, error = %e, "Cannot move chunk");
                    break;
                }
            }
            debug!(
                rate = self.rate,
                tier = tier.name(),
                chunk = %id,
                bytes = tier.current_bytes(),
                max_bytes = budget.max_bytes,
                "Chunk over budget, migrating"
            );

            let this = self.clone();
            let last_time = candidate.last_time();
            let handle = tokio::spawn(async move { this.migrate(level, id, last_time).await });
            self.migrations
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(handle);
        }

        framehouse_observability::metrics::TIER_BYTES
            .with_label_values(&[&self.rate.to_string(), tier.name()])
            .set(tier.current_bytes() as i64);
    }

    async fn migrate(self: Arc<Self>, level: usize, id: ChunkId, last_time: Option<Timestamp>) {
        let tier = self.plan.write[level].tier.clone();
        let rate = self.rate.to_string();

        match self.plan.write.get(level + 1) {
            Some(next) => {
                if let Err(e) = self.hand_off(tier.as_ref(), next.tier.as_ref(), &id).await {
                    error!(
                        rate = self.rate,
                        from = tier.name(),
                        to = next.tier.name(),
                        chunk = %id,
                        error = %e,
                        "Chunk export failed, leaving it in place"
                    );
                    return;
                }
                info!(rate = self.rate, from = tier.name(), to = next.tier.name(), chunk = %id, "Chunk exported");
                framehouse_observability::metrics::CHUNKS_EXPORTED_TOTAL
                    .with_label_values(&[&rate, tier.name()])
                    .inc();
                self.enforce_budget(level + 1);
            }
            None => {
                if let Some(time) = last_time {
                    self.on_chunk_deleted(time);
                }
                info!(rate = self.rate, tier = tier.name(), chunk = %id, "Chunk deleted from last tier");
                framehouse_observability::metrics::CHUNKS_DELETED_TOTAL
                    .with_label_values(&[&rate, tier.name()])
                    .inc();
            }
        }

        if let Err(e) = tier.remove_chunk(&id).await {
            error!(rate = self.rate, tier = tier.name(), chunk = %id, error = %e, "Chunk removal failed");
        }
        framehouse_observability::metrics::TIER_BYTES
            .with_label_values(&[&rate, tier.name()])
            .set(tier.current_bytes() as i64);
    }

    async fn hand_off(&self, from: &dyn StorageTier, to: &dyn StorageTier, id: &ChunkId) -> Result<()> {
        let exported = self.with_retries(id, || from.export_chunk(id)).await?;
        self.with_retries(id, || to.add_chunk(exported.clone())).await
    }

    async fn with_retries<T, F, Fut>(&self, id: &ChunkId, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut backoff = self.export_retry_backoff;
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.export_retries => {
                    warn!(
                        rate = self.rate,
                        chunk = %id,
                        attempt,
                        error = %e,
                        "Chunk export attempt failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn on_chunk_deleted(&self, time: Timestamp) {
        let mut state = self.state();
        if state.ranges.delete_before(time) {
            if let Err(e) = state.rebuild_summary() {
                error!(rate = self.rate, error = %e, "Range summary rebuild failed");
            }
        }
        drop(state);
        let _ = self.events.send(RangeEvent::Deleted(time));
    }

    /// Wait until every migration spawned so far, and those they spawn, finish.
    pub async fn wait_for_migrations(&self) {
        loop {
            let handles: Vec<JoinHandle<()>> = std::mem::take(
                &mut *self.migrations.lock().unwrap_or_else(PoisonError::into_inner),
            );
            if handles.is_empty() {
                return;
            }
            for result in futures::future::join_all(handles).await {
                if let Err(e) = result {
                    error!(rate = self.rate, error = %e, "Migration task panicked");
                }
            }
        }
    }

    /// Flush buffered writes on every tier.
    pub async fn flush(&self) -> Result<()> {
        for budget in &self.plan.read {
            budget.tier.flush().await?;
        }
        Ok(())
    }

    pub fn get_ranges(&self) -> Vec<Span> {
        self.state().ranges.spans().to_vec()
    }

    pub fn subscribe(self: &Arc<Self>) -> RangeSubscription {
        RangeSubscription {
            rate: self.rate,
            events: self.events.subscribe(),
            orchestrator: Arc::downgrade(self),
        }
    }

    /// At most roughly `max` spans covering `range`, coarser when the rate
    /// has more.
    pub fn summarize_ranges(&self, range: &Span, max: usize) -> Result<Vec<Span>> {
        Ok(self.state().summary.summarize(range, max)?)
    }

    pub fn last_time(&self) -> Option<Timestamp> {
        self.state().last_time
    }

    /// Largest `add_seq_num` stored in any tier of this rate
    pub fn last_add_seq_num(&self) -> Option<u64> {
        self.plan
            .read
            .iter()
            .chain(self.plan.write.iter())
            .flat_map(|budget| budget.tier.chunk_metadatas())
            .filter(|m| !m.ranges.is_empty())
            .map(|m| m.last_add_seq_num)
            .max()
    }

    pub async fn get_video(&self, request: &VideoRequest, cancel: &Signal) -> Result<VideoResult> {
        let tiers: Vec<Arc<dyn StorageTier>> =
            self.plan.read.iter().map(|budget| budget.tier.clone()).collect();
        get_video(&tiers, request, cancel, self.max_live_iterations).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_storage::RateStorage;
    use crate::tiering::TierBudget;
    use bytes::Bytes;
    use framehouse_core::FrameType;
    use tempfile::TempDir;

    fn record(time: Timestamp, seq: u64, keyframe: bool) -> NalRecord {
        NalRecord {
            rate: 1,
            time,
            frame_type: if keyframe {
                FrameType::Keyframe
            } else {
                FrameType::Interframe
            },
            width: 640,
            height: 480,
            sps: Bytes::new(),
            pps: Bytes::new(),
            nal: Bytes::from(vec![0u8; 27]),
            add_seq_num: seq,
        }
    }

    async fn single_tier(dir: &TempDir, max_bytes: u64) -> Arc<TierOrchestrator> {
        let config = StorageConfig {
            root_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let disk: Arc<dyn StorageTier> =
            Arc::new(RateStorage::open(1, &config).await.unwrap().with_chunk_threshold(150));
        let budget = TierBudget { tier: disk, max_bytes };
        let plan = TierPlan {
            read: vec![budget.clone()],
            write: vec![budget],
            chunk_threshold_bytes: 150,
        };
        TierOrchestrator::new(1, plan, &config).unwrap()
    }

    #[tokio::test]
    async fn test_ranges_follow_appends() {
        let dir = TempDir::new().unwrap();
        let orchestrator = single_tier(&dir, u64::MAX).await;
        let mut events = orchestrator.subscribe();

        orchestrator.add_nal(&record(0, 0, true)).await.unwrap();
        orchestrator.add_nal(&record(1_000_000, 1, false)).await.unwrap();
        // 10s gap starts a new span
        orchestrator.add_nal(&record(11_000_000, 2, true)).await.unwrap();

        assert_eq!(
            orchestrator.get_ranges(),
            vec![Span::new(0, 1_000_000, 2), Span::point(11_000_000)]
        );
        assert_eq!(events.recv().await.unwrap(), RangeEvent::Changed(vec![Span::point(0)]));
        assert_eq!(
            events.recv().await.unwrap(),
            RangeEvent::Changed(vec![Span::new(0, 1_000_000, 2)])
        );

        let summary = orchestrator
            .summarize_ranges(&Span::new(0, 20_000_000, 0), 10)
            .unwrap();
        assert!(!summary.is_empty() && summary.len() <= 2);
    }

    #[tokio::test]
    async fn test_rejects_time_order_violation() {
        let dir = TempDir::new().unwrap();
        let orchestrator = single_tier(&dir, u64::MAX).await;
        orchestrator.add_nal(&record(100, 0, true)).await.unwrap();
        orchestrator.add_nal(&record(105, 1, false)).await.unwrap();
        assert!(matches!(
            orchestrator.add_nal(&record(90, 2, false)).await,
            Err(Error::TimeOrder { .. })
        ));
        assert_eq!(orchestrator.get_ranges(), vec![Span::new(100, 105, 2)]);
    }

    #[tokio::test]
    async fn test_last_tier_deletes_and_notifies() {
        let dir = TempDir::new().unwrap();
        // Each record is 100 bytes; two chunks fit
        let orchestrator = single_tier(&dir, 450).await;
        let mut events = orchestrator.subscribe();

        for i in 0..8u64 {
            orchestrator
                .add_nal(&record(i as i64 * 1_000, i, i % 2 == 0))
                .await
                .unwrap();
        }
        orchestrator.wait_for_migrations().await;

        let tier = &orchestrator.plan().write[0].tier;
        assert!(tier.current_bytes() <= 450);
        let first = tier.chunk_metadatas()[0].chunk_id;
        assert!(first.start_add_seq_num > 0);

        // Ranges no longer cover the deleted chunks
        let ranges = orchestrator.get_ranges();
        assert!(ranges[0].first_time > 1_000);

        let mut deleted = None;
        while let Some(event) = events.try_recv() {
            if let RangeEvent::Deleted(time) = event {
                deleted = Some(time);
            }
        }
        assert!(deleted.is_some());
    }

    #[tokio::test]
    async fn test_lagging_subscriber_gets_reset() {
        let dir = TempDir::new().unwrap();
        let orchestrator = single_tier(&dir, u64::MAX).await;
        let mut events = orchestrator.subscribe();

        let appends = RANGE_EVENT_CAPACITY as u64 + 10;
        for i in 0..appends {
            orchestrator
                .add_nal(&record(i as i64 * 1_000, i, true))
                .await
                .unwrap();
        }

        let last = (appends as i64 - 1) * 1_000;
        assert_eq!(
            events.recv().await.unwrap(),
            RangeEvent::Reset(vec![Span::new(0, last, appends)])
        );
        assert!(events.try_recv().is_none());

        // Live events resume after the reset
        orchestrator
            .add_nal(&record(last + 1_000, appends, false))
            .await
            .unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            RangeEvent::Changed(vec![Span::new(0, last + 1_000, appends + 1)])
        );
    }

    #[tokio::test]
    async fn test_next_add_seq_num_source() {
        let dir = TempDir::new().unwrap();
        let orchestrator = single_tier(&dir, u64::MAX).await;
        assert_eq!(orchestrator.last_add_seq_num(), None);
        orchestrator.add_nal(&record(0, 41, true)).await.unwrap();
        orchestrator.add_nal(&record(10, 42, false)).await.unwrap();
        assert_eq!(orchestrator.last_add_seq_num(), Some(42));
    }
}
