//! Feeds a synthetic camera stream through a `Downsampler` whose sinks keep a
//! `RangeSet` per rate, the way the storage engine derives its rate tiers.

use framehouse_core::{min_gap_for_rate, DownsampledSink, Downsampler, RangeSet, Span, Timestamp};

struct RateRanges {
    ranges: RangeSet,
    last_time: Option<Timestamp>,
    frames: u64,
}

impl RateRanges {
    fn new(rate: u64) -> Self {
        Self {
            ranges: RangeSet::for_rate(rate),
            last_time: None,
            frames: 0,
        }
    }
}

impl DownsampledSink<Timestamp> for RateRanges {
    fn add_value(&mut self, time: &Timestamp) -> framehouse_core::Result<()> {
        let first = match self.last_time {
            Some(last) if *time - last < self.ranges.min_gap() => last,
            _ => *time,
        };
        let span = if first == *time {
            Span::point(*time)
        } else {
            Span::new(first, *time, 1)
        };
        self.ranges.add_or_extend(span)?;
        self.last_time = Some(*time);
        self.frames += 1;
        Ok(())
    }
}

fn camera_times() -> Vec<Timestamp> {
    let mut times = Vec::new();
    let mut t: Timestamp = 1_700_000_000_000_000;
    for i in 0..5_000 {
        t += 100_000; // 10 fps
        if i == 2_500 {
            t += 120_000_000; // two minute outage
        }
        times.push(t);
    }
    times
}

#[test]
fn test_every_rate_sees_its_share_and_stays_disjoint() {
    let mut sampler = Downsampler::new(4.0, RateRanges::new).unwrap();
    let times = camera_times();
    for t in &times {
        sampler.add_value(t).unwrap();
    }

    for rate in sampler.rates() {
        let sink = sampler.instance_for_rate(rate).unwrap();
        assert_eq!(sink.frames, times.len() as u64 / rate, "rate {}", rate);

        let counted: u64 = sink.ranges.spans().iter().map(|s| s.frame_count).sum();
        assert_eq!(counted, sink.frames, "rate {}", rate);

        for pair in sink.ranges.spans().windows(2) {
            assert!(pair[1].first_time - pair[0].last_time >= min_gap_for_rate(rate));
        }
    }

    // the outage splits the full-rate stream in two
    assert_eq!(sampler.instance_for_rate(1).unwrap().ranges.len(), 2);
}

#[test]
fn test_deleting_history_keeps_recent_spans() {
    let mut sampler = Downsampler::new(4.0, RateRanges::new).unwrap();
    let times = camera_times();
    for t in &times {
        sampler.add_value(t).unwrap();
    }

    let cutoff = times[3_000];
    let full = sampler.instance_for_rate_mut(1).unwrap();
    assert!(full.ranges.delete_before(cutoff));
    assert_eq!(full.ranges.len(), 1);
    assert_eq!(full.ranges.first().unwrap().first_time, cutoff + 1);
    assert_eq!(full.ranges.last().unwrap().last_time, *times.last().unwrap());
}
