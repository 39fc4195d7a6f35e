//! Synthetic Camera Feed
//!
//! Stands in for a real camera: generates rate-1 frames on a timer and fans
//! them out to every downsampled rate, the way the ingest side of a camera
//! integration does.
//!
//! ```text
//! tick ──→ Downsampler (base b)
//!            ├─ rate 1   every frame
//!            ├─ rate b   every b-th frame
//!            └─ rate b²  every b²-th frame  (appears once b² frames were seen)
//! ```
//!
//! Each rate's stream has its own keyframe cadence, so every rate starts a
//! keyframe every `keyframe_interval` of its own frames. `add_seq_num` is one
//! counter across all rates.

use anyhow::Result;
use bytes::Bytes;
use framehouse_core::{DownsampledSink, Downsampler, FrameType, NalRecord, Timestamp};
use framehouse_storage::StorageManager;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

const SPS: &[u8] = &[0x67, 0x42, 0xc0, 0x1f, 0xda, 0x01, 0x40, 0x16, 0xec, 0x04, 0x40];
const PPS: &[u8] = &[0x68, 0xce, 0x3c, 0x80];

#[derive(Debug, Clone, Copy)]
struct Frame {
    time: Timestamp,
}

/// Collects the frames landing on one rate until the camera drains them
struct FrameSink {
    ready: Vec<Timestamp>,
    emitted: u64,
}

impl DownsampledSink<Frame> for FrameSink {
    fn add_value(&mut self, frame: &Frame) -> framehouse_core::Result<()> {
        self.ready.push(frame.time);
        Ok(())
    }
}

pub struct SyntheticCamera {
    sampler: Downsampler<FrameSink>,
    next_seq: u64,
    last_time: Option<Timestamp>,
    keyframe_interval: u64,
    frame_bytes: usize,
    width: u32,
    height: u32,
}

impl SyntheticCamera {
    /// Camera whose first record gets `next_seq`
    pub fn new(base_rate: f64, next_seq: u64) -> Result<Self> {
        let sampler = Downsampler::new(base_rate, |_rate| FrameSink {
            ready: Vec::new(),
            emitted: 0,
        })?;
        Ok(Self {
            sampler,
            next_seq,
            last_time: None,
            keyframe_interval: 10,
            frame_bytes: 4 * 1024,
            width: 1280,
            height: 720,
        })
    }

    pub fn with_keyframe_interval(mut self, interval: u64) -> Self {
        self.keyframe_interval = interval.max(1);
        self
    }

    pub fn with_frame_bytes(mut self, bytes: usize) -> Self {
        self.frame_bytes = bytes;
        self
    }

    /// Records produced by one rate-1 frame at `time`, finest rate first.
    ///
    /// Times that do not advance are bumped one microsecond past the last.
    pub fn frame(&mut self, time: Timestamp) -> Result<Vec<NalRecord>> {
        let time = match self.last_time {
            Some(last) if time <= last => last + 1,
            _ => time,
        };
        self.last_time = Some(time);
        self.sampler.add_value(&Frame { time })?;

        let mut records = Vec::new();
        for (rate, sink) in self.sampler.instances_mut() {
            for time in sink.ready.drain(..) {
                let keyframe = sink.emitted % self.keyframe_interval == 0;
                sink.emitted += 1;
                // Keyframes are much larger than the frames between them
                let payload = if keyframe {
                    self.frame_bytes * 8
                } else {
                    self.frame_bytes
                };
                records.push(NalRecord {
                    rate,
                    time,
                    frame_type: if keyframe {
                        FrameType::Keyframe
                    } else {
                        FrameType::Interframe
                    },
                    width: self.width,
                    height: self.height,
                    sps: Bytes::from_static(SPS),
                    pps: Bytes::from_static(PPS),
                    nal: Bytes::from(vec![0x41; payload]),
                    add_seq_num: self.next_seq,
                });
                self.next_seq += 1;
            }
        }
        Ok(records)
    }

    /// Feed `manager` at `fps` frames per second until `shutdown` flips to true.
    pub async fn run(
        mut self,
        manager: Arc<StorageManager>,
        fps: f64,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let period = Duration::from_secs_f64(1.0 / fps.max(0.001));
        let mut ticker = tokio::time::interval(period);
        info!(fps, next_seq = self.next_seq, "Synthetic camera started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = chrono::Utc::now().timestamp_micros();
                    for record in self.frame(now)? {
                        debug!(rate = record.rate, time = record.time, seq = record.add_seq_num, "Synthetic frame");
                        manager.add_nal(record).await?;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(next_seq = self.next_seq, "Synthetic camera stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rates_fan_out() {
        let mut camera = SyntheticCamera::new(4.0, 100).unwrap();
        let mut per_rate = std::collections::BTreeMap::new();
        for i in 0..16 {
            for record in camera.frame(i * 1_000).unwrap() {
                per_rate.entry(record.rate).or_insert_with(Vec::new).push(record);
            }
        }

        assert_eq!(per_rate.keys().copied().collect::<Vec<_>>(), vec![1, 4, 16]);
        assert_eq!(per_rate[&1].len(), 16);
        assert_eq!(per_rate[&4].len(), 4);
        assert_eq!(per_rate[&16].len(), 1);
        // Every 4th frame lands on rate 4
        assert_eq!(per_rate[&4][0].time, 3_000);
        assert_eq!(per_rate[&16][0].time, 15_000);
    }

    #[test]
    fn test_sequence_numbers_span_rates() {
        let mut camera = SyntheticCamera::new(4.0, 7).unwrap();
        let mut seqs = Vec::new();
        for i in 0..8 {
            seqs.extend(camera.frame(i).unwrap().iter().map(|r| r.add_seq_num));
        }
        // 8 rate-1 frames and 2 rate-4 frames
        assert_eq!(seqs, (7..17).collect::<Vec<_>>());
    }

    #[test]
    fn test_keyframe_cadence_per_rate() {
        let mut camera = SyntheticCamera::new(2.0, 0)
            .unwrap()
            .with_keyframe_interval(3)
            .with_frame_bytes(16);
        let mut rate_one = Vec::new();
        for i in 0..7 {
            rate_one.extend(camera.frame(i * 10).unwrap().into_iter().filter(|r| r.rate == 1));
        }
        let keyframes: Vec<bool> = rate_one.iter().map(|r| r.is_keyframe()).collect();
        assert_eq!(keyframes, vec![true, false, false, true, false, false, true]);
        assert_eq!(rate_one[0].nal.len(), 128);
        assert_eq!(rate_one[1].nal.len(), 16);
    }

    #[test]
    fn test_time_never_goes_backwards() {
        let mut camera = SyntheticCamera::new(4.0, 0).unwrap();
        let first = camera.frame(500).unwrap();
        let second = camera.frame(400).unwrap();
        assert_eq!(first[0].time, 500);
        assert_eq!(second[0].time, 501);
    }
}
