//! Video Window Selection
//!
//! Turns "video starting at T with at least N frames" into a keyframe-aligned
//! run of records that a muxer can play on its own:
//!
//! ```text
//! index:   K  i  i  K  i  i  i  K  i  K
//!                ^start (inclusive)
//!          [─────────────────────)          min_frames = 2, grown by the 2 frames walked back
//!          first                  end = next keyframe after first + min_frames
//! ```
//!
//! [`get_video_times`] is the pure selection over one chunk's index.
//! [`get_video`] picks the chunk across the tier chain and runs the selection
//! inside the chunk's read, so a live request can wait on the chunk's pending
//! slot and re-select when more records arrive.

use crate::chunk::{split_slots, ChunkMetadata, IndexSlot, ReadOutcome, Selection};
use crate::error::{Error, Result};
use crate::signal::Signal;
use crate::tiering::StorageTier;
use framehouse_core::{IndexEntry, NalRecord, Timestamp};
use std::sync::Arc;
use tracing::{debug, error};

/// Where a requested window must stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoBoundary {
    /// Stop at the keyframe at this time, if the chunk has one there
    Time(Timestamp),
    /// Follow the live edge, waiting for records that have not arrived yet
    Live,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VideoRequest {
    pub rate: u64,
    pub start_time: Timestamp,
    pub min_frames: u64,
    pub boundary: Option<VideoBoundary>,
    /// Start strictly after `start_time` rather than at the keyframe before it
    pub start_exclusive: bool,
    /// Only select frames, do not read record payloads
    pub only_times: bool,
    /// Accept a window without an end keyframe even on a live chunk
    pub for_preview: bool,
}

impl VideoRequest {
    pub fn new(rate: u64, start_time: Timestamp, min_frames: u64) -> Self {
        Self {
            rate,
            start_time,
            min_frames,
            boundary: None,
            start_exclusive: false,
            only_times: false,
            for_preview: false,
        }
    }

    pub fn live(mut self) -> Self {
        self.boundary = Some(VideoBoundary::Live);
        self
    }

    pub fn until(mut self, time: Timestamp) -> Self {
        self.boundary = Some(VideoBoundary::Time(time));
        self
    }

    pub fn exclusive(mut self) -> Self {
        self.start_exclusive = true;
        self
    }

    fn is_live(&self) -> bool {
        self.boundary == Some(VideoBoundary::Live)
    }

    fn boundary_time(&self) -> Option<Timestamp> {
        match self.boundary {
            Some(VideoBoundary::Time(time)) => Some(time),
            _ => None,
        }
    }
}

/// A keyframe-aligned run of records
#[derive(Debug, Clone, PartialEq)]
pub struct Video {
    pub rate: u64,
    /// Index entries of the selected frames, first is a keyframe
    pub frames: Vec<IndexEntry>,
    /// Records of `frames`; empty for `only_times` requests
    pub records: Vec<NalRecord>,
    /// Time of the keyframe that follows the window, when known
    pub next_key_frame_time: Option<Timestamp>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum VideoResult {
    Video(Video),
    /// The window would start past the newest record
    ExceedsLiveVideo,
    /// The window has no closing keyframe yet
    ExceedsNextTime,
    Cancelled,
}

/// Outcome of selecting a window within one chunk's index
#[derive(Debug, Clone, PartialEq)]
pub enum VideoTimes {
    Window {
        entries: Vec<IndexEntry>,
        next_key_frame_time: Option<Timestamp>,
    },
    ExceedsLiveVideo,
    ExceedsNextTime,
}

/// First keyframe strictly after `index`, or `index.len()`
fn next_keyframe_after(index: &[IndexEntry], after: Option<usize>) -> usize {
    let from = after.map_or(0, |i| i.saturating_add(1));
    (from..index.len())
        .find(|&i| index[i].is_keyframe())
        .unwrap_or(index.len())
}

/// Select a window from one chunk's index.
///
/// `allow_missing_end` accepts a window that runs to the end of the index,
/// which is right for finalized chunks: the next chunk always starts on a
/// keyframe.
pub fn get_video_times(
    index: &[IndexEntry],
    start_time: Timestamp,
    min_frames: u64,
    boundary_time: Option<Timestamp>,
    start_exclusive: bool,
    allow_missing_end: bool,
) -> VideoTimes {
    if index.is_empty() {
        return VideoTimes::ExceedsLiveVideo;
    }
    let mut min_frames = usize::try_from(min_frames).unwrap_or(usize::MAX);
    let after = index.partition_point(|e| e.time <= start_time);

    let first = if start_exclusive {
        if after < index.len() && !index[after].is_keyframe() {
            next_keyframe_after(index, Some(after))
        } else {
            after
        }
    } else {
        let start_idx = after.saturating_sub(1);
        match (0..=start_idx).rev().find(|&i| index[i].is_keyframe()) {
            Some(keyframe) => {
                min_frames = min_frames.saturating_add(start_idx - keyframe);
                keyframe
            }
            None => next_keyframe_after(index, None),
        }
    };

    let mut end = next_keyframe_after(index, Some(first.saturating_add(min_frames)));
    if let Some(boundary) = boundary_time {
        let at = index.partition_point(|e| e.time < boundary);
        if let Some(entry) = index.get(at).filter(|e| e.time == boundary) {
            if entry.is_keyframe() {
                end = end.min(at);
            } else {
                error!(
                    time = boundary,
                    "Record at the next boundary time is not a keyframe, ignoring the boundary"
                );
            }
        }
    }

    if first >= end {
        return VideoTimes::ExceedsLiveVideo;
    }
    if !allow_missing_end && end >= index.len() {
        return VideoTimes::ExceedsNextTime;
    }

    let entries = index[first..end.min(index.len())].to_vec();
    if entries.is_empty() {
        return VideoTimes::ExceedsNextTime;
    }
    VideoTimes::Window {
        entries,
        next_key_frame_time: index.get(end).map(|e| e.time),
    }
}

/// Chunk holding the start of the window: the last one starting at or before
/// `start_time`. An exclusive start past a chunk's last record belongs to the
/// chunk after it.
fn choose_chunk(metadatas: &[ChunkMetadata], start_time: Timestamp, exclusive: bool) -> Option<&ChunkMetadata> {
    let with_data: Vec<&ChunkMetadata> = metadatas
        .iter()
        .filter(|m| m.first_time().is_some())
        .collect();
    let after = with_data.partition_point(|m| m.first_time().map_or(false, |t| t <= start_time));
    let idx = after.checked_sub(1)?;

    let chosen = with_data[idx];
    if exclusive && chosen.last_time().map_or(false, |t| t <= start_time) {
        if let Some(next) = with_data.get(idx + 1) {
            return Some(next);
        }
    }
    Some(chosen)
}

enum ChunkVerdict {
    Window(Vec<IndexEntry>, Option<Timestamp>),
    ExceedsLive { finalized: bool },
    ExceedsNext,
}

/// Find and read the window described by `request`.
///
/// Tiers are consulted cheapest first. A request that asks for live video
/// waits on the live chunk's pending slot until the window exists, up to
/// `max_live_iterations` re-selections.
///
/// # Errors
/// - `LiveIterationLimit` if a live request keeps waiting past the limit
/// - any read error from the owning tier
pub async fn get_video(
    tiers: &[Arc<dyn StorageTier>],
    request: &VideoRequest,
    cancel: &Signal,
    max_live_iterations: u32,
) -> Result<VideoResult> {
    let cancel_id = format!("get_video_{}", uuid::Uuid::new_v4());
    let mut iterations = 0u32;

    'retry: loop {
        for tier in tiers {
            let metadatas = tier.chunk_metadatas();
            let Some(chunk) = choose_chunk(&metadatas, request.start_time, request.start_exclusive) else {
                continue;
            };
            if chunk.is_moved {
                continue;
            }
            let chunk_id = chunk.chunk_id;
            let has_newer = metadatas
                .iter()
                .any(|m| m.chunk_id.start_add_seq_num > chunk_id.start_add_seq_num);

            let mut verdict = None;
            let outcome = {
                let verdict = &mut verdict;
                let iterations = &mut iterations;
                let mut selector = move |slots: &[IndexSlot]| -> Result<Selection> {
                    *iterations += 1;
                    if *iterations > max_live_iterations {
                        return Err(Error::LiveIterationLimit(max_live_iterations));
                    }
                    let (entries, pending) = split_slots(slots);
                    let allow_missing_end = pending.is_none() || request.for_preview;
                    let times = get_video_times(
                        &entries,
                        request.start_time,
                        request.min_frames,
                        request.boundary_time(),
                        request.start_exclusive,
                        allow_missing_end,
                    );
                    match times {
                        VideoTimes::ExceedsLiveVideo => match pending {
                            Some(pending) if request.is_live() => Ok(Selection::Wait(pending)),
                            pending => {
                                *verdict = Some(ChunkVerdict::ExceedsLive {
                                    finalized: pending.is_none(),
                                });
                                Ok(Selection::Skip)
                            }
                        },
                        VideoTimes::ExceedsNextTime => {
                            *verdict = Some(ChunkVerdict::ExceedsNext);
                            Ok(Selection::Skip)
                        }
                        VideoTimes::Window {
                            entries,
                            next_key_frame_time,
                        } => {
                            *verdict = Some(ChunkVerdict::Window(entries.clone(), next_key_frame_time));
                            if request.only_times {
                                Ok(Selection::Skip)
                            } else {
                                Ok(Selection::Read(entries))
                            }
                        }
                    }
                };

                let read = tier.read_nals(&cancel_id, &chunk_id, &mut selector);
                tokio::select! {
                    biased;
                    _ = cancel.wait() => {
                        tier.cancel_read_nals(&cancel_id, &chunk_id);
                        ReadOutcome::Cancelled
                    }
                    result = read => result?,
                }
            };

            let records = match outcome {
                ReadOutcome::Cancelled => return Ok(VideoResult::Cancelled),
                ReadOutcome::Ready(records) => records,
            };

            return match verdict {
                Some(ChunkVerdict::Window(frames, next_key_frame_time)) => {
                    debug!(
                        rate = request.rate,
                        tier = tier.name(),
                        chunk = %chunk_id,
                        frames = frames.len(),
                        "Video window selected"
                    );
                    Ok(VideoResult::Video(Video {
                        rate: request.rate,
                        frames,
                        records,
                        next_key_frame_time,
                    }))
                }
                Some(ChunkVerdict::ExceedsLive { finalized })
                    if finalized && request.is_live() && has_newer =>
                {
                    // The chunk was finalized while we waited; the window
                    // continues in the chunk that replaced it.
                    if iterations >= max_live_iterations {
                        return Err(Error::LiveIterationLimit(max_live_iterations));
                    }
                    continue 'retry;
                }
                Some(ChunkVerdict::ExceedsLive { .. }) | None => Ok(VideoResult::ExceedsLiveVideo),
                Some(ChunkVerdict::ExceedsNext) => Ok(VideoResult::ExceedsNextTime),
            };
        }

        return Ok(VideoResult::ExceedsLiveVideo);
    }
}
