//! Disjoint Time Ranges
//!
//! A `RangeSet` answers "which spans of time have video" without touching any
//! frame data. It holds a sorted list of disjoint `[first_time, last_time]`
//! spans; adding a span either lands on its own or absorbs the neighbors that
//! lie within the rate's minimum gap.
//!
//! ## Merging
//!
//! ```text
//! min_gap = 2
//!
//! before:  [0────3]           [9──11]
//! add:              [4─4]
//! after:   [0──────────4]     [9──11]     (gap 4-3 = 1 < 2, merged)
//! ```
//!
//! Frame counts are summed when spans merge. Spans that truly overlap (rather
//! than touch or sit within the gap) would double-count frames, so that case is
//! an error and leaves the set untouched.
//!
//! ## Fill Rate
//!
//! Summary tiers (see [`crate::summary`]) keep one span where several were
//! dropped by downsampling. Those spans carry `fill_rate`, the fraction of the
//! span's duration actually covered by source spans, updated through
//! `insert_filled`, `dropped_value`, and `mutate_range`. A fill above 1 means
//! a span was counted twice and is reported as `FillOverflow`.

use crate::error::{Error, Result};
use crate::record::Timestamp;
use serde::{Deserialize, Serialize};

/// Ten seconds without frames always splits a span.
const MIN_GAP_FLOOR_US: i64 = 10_000_000;

/// Rate-`r` tiers keep one frame in `r`, so their gap grows with the rate.
const MIN_GAP_PER_RATE_US: i64 = 3_000_000;

/// Relative slack when comparing accumulated fills against span sizes.
const FILL_EPSILON: f64 = 1e-9;

/// Minimum gap between two spans of a rate before they are kept apart.
pub fn min_gap_for_rate(rate: u64) -> i64 {
    MIN_GAP_FLOOR_US.max(MIN_GAP_PER_RATE_US.saturating_mul(rate as i64))
}

/// One contiguous run of retained frames
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Span {
    pub first_time: Timestamp,
    pub last_time: Timestamp,
    pub frame_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fill_rate: Option<f64>,
}

impl Span {
    pub fn new(first_time: Timestamp, last_time: Timestamp, frame_count: u64) -> Self {
        Self {
            first_time,
            last_time,
            frame_count,
            fill_rate: None,
        }
    }

    /// A single frame at `time`
    pub fn point(time: Timestamp) -> Self {
        Self::new(time, time, 1)
    }

    pub fn duration(&self) -> i64 {
        self.last_time - self.first_time
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        !(self.last_time < other.first_time || self.first_time > other.last_time)
    }

    pub fn contains(&self, other: &Span) -> bool {
        self.first_time <= other.first_time && other.last_time <= self.last_time
    }

    fn validate(&self) -> Result<()> {
        if self.last_time < self.first_time {
            return Err(Error::InvalidSpan {
                first_time: self.first_time,
                last_time: self.last_time,
            });
        }
        Ok(())
    }

    /// Covered duration, treating a missing fill rate as full
    fn filled(&self) -> f64 {
        self.duration() as f64 * self.fill_rate.unwrap_or(1.0)
    }
}

/// Sorted, pairwise-disjoint spans for one rate
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RangeSet {
    spans: Vec<Span>,
    min_gap: i64,
}

impl RangeSet {
    pub fn new(min_gap: i64) -> Self {
        Self {
            spans: Vec::new(),
            min_gap,
        }
    }

    pub fn for_rate(rate: u64) -> Self {
        Self::new(min_gap_for_rate(rate))
    }

    pub fn spans(&self) -> &[Span] {
        &self.spans
    }

    pub fn len(&self) -> usize {
        self.spans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    pub fn min_gap(&self) -> i64 {
        self.min_gap
    }

    pub fn first(&self) -> Option<&Span> {
        self.spans.first()
    }

    pub fn last(&self) -> Option<&Span> {
        self.spans.last()
    }

    /// `right` starts at or after `left` and is close enough to be merged
    fn within_gap(&self, left: &Span, right: &Span) -> bool {
        let gap = right.first_time - left.last_time;
        gap <= 0 || gap < self.min_gap
    }

    /// Insert `span`, absorbing neighbors within the minimum gap.
    ///
    /// Returns the spans that changed (the stored, possibly extended span), or
    /// an empty list when `span` was already covered.
    ///
    /// # Errors
    /// - `InvalidSpan` if `span` ends before it starts
    /// - `OverlappingRanges` if `span` overlaps a neighbor it would be counted into
    pub fn add_or_extend(&mut self, span: Span) -> Result<Vec<Span>> {
        span.validate()?;

        let idx = self
            .spans
            .partition_point(|s| s.first_time <= span.first_time);

        if idx > 0 && self.spans[idx - 1].contains(&span) {
            return Ok(Vec::new());
        }

        let mut merged = span;
        let mut start = idx;
        let mut end = idx;

        if idx > 0 && self.within_gap(&self.spans[idx - 1], &merged) {
            merged = Self::merge_counted(&self.spans[idx - 1], &merged)?;
            start = idx - 1;
        }
        while end < self.spans.len() && self.within_gap(&merged, &self.spans[end]) {
            merged = Self::merge_counted(&merged, &self.spans[end])?;
            end += 1;
        }

        self.spans.splice(start..end, std::iter::once(merged.clone()));
        Ok(vec![merged])
    }

    /// Union of two spans with summed frame counts. `left` starts first.
    fn merge_counted(left: &Span, right: &Span) -> Result<Span> {
        if right.first_time < left.last_time {
            tracing::error!(
                left_first = left.first_time,
                left_last = left.last_time,
                right_first = right.first_time,
                right_last = right.last_time,
                "Overlapping ranges while counting frames"
            );
            return Err(Error::OverlappingRanges(format!(
                "[{}, {}] overlaps [{}, {}]",
                left.first_time, left.last_time, right.first_time, right.last_time
            )));
        }
        Ok(Span {
            first_time: left.first_time,
            last_time: left.last_time.max(right.last_time),
            frame_count: left.frame_count + right.frame_count,
            fill_rate: None,
        })
    }

    /// Drop everything at or before `time`.
    ///
    /// Spans ending before `time` are removed. A span containing `time` is
    /// truncated to start one microsecond after it, since the frame at `time`
    /// is gone but the next frame's time is unknown. Returns whether anything
    /// changed.
    pub fn delete_before(&mut self, time: Timestamp) -> bool {
        let idx = self.spans.partition_point(|s| s.first_time <= time);
        if idx == 0 {
            return false;
        }
        let i = idx - 1;
        if self.spans[i].last_time < time {
            self.spans.drain(..=i);
            return true;
        }

        self.spans.drain(..i);
        let head = &mut self.spans[0];
        match time.checked_add(1) {
            Some(next) if next <= head.last_time => head.first_time = next,
            _ => {
                self.spans.remove(0);
            }
        }
        true
    }

    /// Index of the span nearest to `span` (overlapping spans have negative distance)
    fn closest_index(&self, span: &Span) -> Option<usize> {
        if self.spans.is_empty() {
            return None;
        }
        let idx = self
            .spans
            .partition_point(|s| s.first_time < span.first_time);

        let before = idx
            .checked_sub(1)
            .map(|i| (span.first_time - self.spans[i].last_time, i));
        let after = self
            .spans
            .get(idx)
            .map(|s| (s.first_time - span.last_time, idx));

        match (before, after) {
            (Some(b), Some(a)) => Some(if a.0 < b.0 { a.1 } else { b.1 }),
            (Some(b), None) => Some(b.1),
            (None, Some(a)) => Some(a.1),
            (None, None) => None,
        }
    }

    /// Fill-rate insert used by summary tiers.
    ///
    /// The value is inserted as its own span unless it overlaps the nearest
    /// span, in which case it is folded in as a dropped value.
    pub fn insert_filled(&mut self, span: &Span) -> Result<()> {
        span.validate()?;
        let mut value = span.clone();
        value.fill_rate = Some(value.fill_rate.unwrap_or(1.0));

        if let Some(i) = self.closest_index(&value) {
            if self.spans[i].overlaps(&value) {
                return self.dropped_value(&value);
            }
        }
        let idx = self
            .spans
            .partition_point(|s| s.first_time < value.first_time);
        self.spans.insert(idx, value);
        Ok(())
    }

    /// Fold a value skipped by downsampling into its nearest span.
    ///
    /// The span grows to cover the value and its fill rate becomes the
    /// combined covered duration over the new size.
    pub fn dropped_value(&mut self, span: &Span) -> Result<()> {
        span.validate()?;
        let Some(i) = self.closest_index(span) else {
            return Err(Error::RangeNotFound(format!(
                "no span to absorb dropped value [{}, {}]",
                span.first_time, span.last_time
            )));
        };

        let close = &self.spans[i];
        let new_first = close.first_time.min(span.first_time);
        let new_last = close.last_time.max(span.last_time);
        let new_size = (new_last - new_first) as f64;
        let new_filled = close.filled() + span.filled();

        if new_filled > new_size * (1.0 + FILL_EPSILON) + FILL_EPSILON {
            tracing::error!(
                first_time = span.first_time,
                last_time = span.last_time,
                new_filled,
                new_size,
                "Dropped value overlaps an already counted span"
            );
            return Err(Error::FillOverflow(format!(
                "combining [{}, {}] into [{}, {}] fills {} of {}",
                span.first_time, span.last_time, close.first_time, close.last_time, new_filled, new_size
            )));
        }

        let close = &mut self.spans[i];
        close.first_time = new_first;
        close.last_time = new_last;
        close.frame_count += span.frame_count;
        close.fill_rate = Some(fill_ratio(new_filled, new_size));
        Ok(())
    }

    /// Replace a previously inserted raw span with its grown version.
    ///
    /// The span nearest `old` grows to cover `new`, and its covered duration
    /// grows by `new`'s size minus `old`'s size.
    ///
    /// # Errors
    /// - `OverlappingRanges` if `new` would collide with a different span
    /// - `FillOverflow` if the covered duration would exceed the span size,
    ///   which happens when `old` was never added
    /// - `RangeNotFound` if the set is empty
    pub fn mutate_range(&mut self, old: &Span, new: &Span) -> Result<()> {
        old.validate()?;
        new.validate()?;
        let Some(index) = self.closest_index(old) else {
            return Err(Error::RangeNotFound(format!(
                "mutate of [{}, {}] on an empty set",
                old.first_time, old.last_time
            )));
        };

        for (i, existing) in self.spans.iter().enumerate() {
            if i != index && existing.overlaps(new) {
                return Err(Error::OverlappingRanges(format!(
                    "mutating to [{}, {}] collides with [{}, {}]",
                    new.first_time, new.last_time, existing.first_time, existing.last_time
                )));
            }
        }

        let range = &self.spans[index];
        let prev_filled = range.filled();
        let first = range.first_time.min(new.first_time);
        let last = range.last_time.max(new.last_time);
        let base = (last - first) as f64;
        let new_filled = prev_filled + (new.duration() - old.duration()) as f64;

        if new_filled > base * (1.0 + FILL_EPSILON) + FILL_EPSILON {
            tracing::error!(
                old_first = old.first_time,
                old_last = old.last_time,
                new_first = new.first_time,
                new_last = new.last_time,
                "MutateRange increased fill rate past 1"
            );
            return Err(Error::FillOverflow(format!(
                "mutating [{}, {}] to [{}, {}] fills {} of {}; was the range ever added?",
                old.first_time, old.last_time, new.first_time, new.last_time, new_filled, base
            )));
        }

        let range = &mut self.spans[index];
        range.first_time = first;
        range.last_time = last;
        range.fill_rate = Some(fill_ratio(new_filled, base));
        Ok(())
    }
}

fn fill_ratio(filled: f64, size: f64) -> f64 {
    if size == 0.0 {
        1.0
    } else {
        (filled / size).min(1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_disjoint(set: &RangeSet) {
        for pair in set.spans().windows(2) {
            assert!(pair[0].first_time <= pair[0].last_time);
            assert!(
                pair[1].first_time - pair[0].last_time >= set.min_gap().max(1),
                "spans too close: {:?}",
                pair
            );
        }
    }

    #[test]
    fn test_min_gap_for_rate() {
        assert_eq!(min_gap_for_rate(1), 10_000_000);
        assert_eq!(min_gap_for_rate(4), 12_000_000);
        assert_eq!(min_gap_for_rate(16), 48_000_000);
    }

    #[test]
    fn test_adjacent_spans_within_gap_merge() {
        let mut set = RangeSet::new(2);
        set.add_or_extend(Span::new(0, 3, 4)).unwrap();
        let changed = set.add_or_extend(Span::new(4, 4, 1)).unwrap();

        assert_eq!(set.spans(), &[Span::new(0, 4, 5)]);
        assert_eq!(changed, vec![Span::new(0, 4, 5)]);
    }

    #[test]
    fn test_spans_past_gap_stay_apart() {
        let mut set = RangeSet::new(2);
        set.add_or_extend(Span::new(0, 3, 4)).unwrap();
        set.add_or_extend(Span::new(10, 12, 3)).unwrap();
        set.add_or_extend(Span::new(5, 5, 1)).unwrap();

        assert_eq!(set.len(), 3);
        assert_disjoint(&set);
    }

    #[test]
    fn test_span_bridging_two_neighbors() {
        let mut set = RangeSet::new(5);
        set.add_or_extend(Span::new(0, 3, 4)).unwrap();
        set.add_or_extend(Span::new(20, 22, 3)).unwrap();
        set.add_or_extend(Span::new(6, 12, 3)).unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set.spans()[0], Span::new(0, 12, 7));

        set.add_or_extend(Span::new(15, 16, 2)).unwrap();
        assert_eq!(set.spans(), &[Span::new(0, 22, 12)]);
    }

    #[test]
    fn test_contained_span_is_noop() {
        let mut set = RangeSet::new(0);
        set.add_or_extend(Span::new(0, 10, 11)).unwrap();
        let changed = set.add_or_extend(Span::new(2, 5, 4)).unwrap();
        assert!(changed.is_empty());
        assert_eq!(set.spans(), &[Span::new(0, 10, 11)]);
    }

    #[test]
    fn test_touching_spans_count_frames() {
        let mut set = RangeSet::new(0);
        set.add_or_extend(Span::point(100)).unwrap();
        for (prev, t) in [(100, 200), (200, 300), (300, 400)] {
            set.add_or_extend(Span::new(prev, t, 1)).unwrap();
        }
        assert_eq!(set.spans(), &[Span::new(100, 400, 4)]);
    }

    #[test]
    fn test_overlap_while_counting_is_rejected_without_mutation() {
        let mut set = RangeSet::new(0);
        set.add_or_extend(Span::new(0, 10, 5)).unwrap();
        let before = set.clone();

        assert!(matches!(
            set.add_or_extend(Span::new(5, 20, 3)),
            Err(Error::OverlappingRanges(_))
        ));
        assert!(matches!(
            set.add_or_extend(Span::new(-5, 3, 3)),
            Err(Error::OverlappingRanges(_))
        ));
        assert_eq!(set, before);
    }

    #[test]
    fn test_invalid_span_rejected() {
        let mut set = RangeSet::new(0);
        assert!(matches!(
            set.add_or_extend(Span::new(5, 4, 1)),
            Err(Error::InvalidSpan { .. })
        ));
    }

    #[test]
    fn test_out_of_order_inserts_stay_sorted() {
        let mut set = RangeSet::new(3);
        for first in [100, 0, 50, 25, 75] {
            set.add_or_extend(Span::new(first, first + 5, 2)).unwrap();
        }
        assert_eq!(set.len(), 5);
        assert_disjoint(&set);
        let firsts: Vec<_> = set.spans().iter().map(|s| s.first_time).collect();
        assert_eq!(firsts, vec![0, 25, 50, 75, 100]);
    }

    #[test]
    fn test_delete_before_drops_whole_spans() {
        let mut set = RangeSet::new(1);
        set.add_or_extend(Span::new(0, 10, 1)).unwrap();
        set.add_or_extend(Span::new(20, 30, 1)).unwrap();
        set.add_or_extend(Span::new(40, 50, 1)).unwrap();

        assert!(set.delete_before(35));
        assert_eq!(set.spans(), &[Span::new(40, 50, 1)]);
        assert!(!set.delete_before(-1));
    }

    #[test]
    fn test_delete_before_truncates_containing_span() {
        let mut set = RangeSet::new(1);
        set.add_or_extend(Span::new(0, 10, 1)).unwrap();
        set.add_or_extend(Span::new(20, 30, 1)).unwrap();

        assert!(set.delete_before(25));
        assert_eq!(set.spans().len(), 1);
        assert_eq!(set.spans()[0].first_time, 26);
        assert_eq!(set.spans()[0].last_time, 30);

        assert!(set.delete_before(30));
        assert!(set.is_empty());
    }

    #[test]
    fn test_delete_before_end_of_time() {
        let mut set = RangeSet::new(1);
        set.add_or_extend(Span::new(0, 10, 1)).unwrap();
        set.add_or_extend(Span::new(Timestamp::MAX - 5, Timestamp::MAX, 2)).unwrap();
        assert_eq!(set.len(), 2);

        assert!(set.delete_before(Timestamp::MAX));
        assert!(set.is_empty());
    }

    #[test]
    fn test_dropped_value_sets_fill_rate() {
        let mut set = RangeSet::new(0);
        set.insert_filled(&Span::new(0, 10, 1)).unwrap();
        set.dropped_value(&Span::new(30, 40, 1)).unwrap();

        let span = &set.spans()[0];
        assert_eq!((span.first_time, span.last_time), (0, 40));
        assert_eq!(span.fill_rate, Some(0.5));
        assert_eq!(span.frame_count, 2);
    }

    #[test]
    fn test_dropped_value_twice_overflows() {
        let mut set = RangeSet::new(0);
        set.insert_filled(&Span::new(0, 10, 1)).unwrap();
        assert!(matches!(
            set.dropped_value(&Span::new(0, 10, 1)),
            Err(Error::FillOverflow(_))
        ));
    }

    #[test]
    fn test_insert_filled_keeps_disjoint_values() {
        let mut set = RangeSet::new(0);
        set.insert_filled(&Span::new(0, 1, 1)).unwrap();
        set.insert_filled(&Span::new(5, 6, 1)).unwrap();
        set.insert_filled(&Span::new(3, 4, 1)).unwrap();
        assert_eq!(set.len(), 3);
        assert!(set.spans().iter().all(|s| s.fill_rate == Some(1.0)));
    }

    #[test]
    fn test_mutate_range_grows_span() {
        let mut set = RangeSet::new(0);
        set.insert_filled(&Span::new(0, 3, 1)).unwrap();
        set.insert_filled(&Span::new(4, 4, 1)).unwrap();

        set.mutate_range(&Span::new(4, 4, 1), &Span::new(4, 4, 1)).unwrap();
        set.mutate_range(&Span::new(4, 4, 1), &Span::new(4, 5, 1)).unwrap();

        let last = set.last().unwrap();
        assert_eq!((last.first_time, last.last_time), (4, 5));
        assert_eq!(last.fill_rate, Some(1.0));
    }

    #[test]
    fn test_mutate_range_into_neighbor_fails() {
        let mut set = RangeSet::new(0);
        set.insert_filled(&Span::new(0, 3, 1)).unwrap();
        set.insert_filled(&Span::new(4, 4, 1)).unwrap();

        assert!(matches!(
            set.mutate_range(&Span::new(4, 4, 1), &Span::new(2, 4, 1)),
            Err(Error::OverlappingRanges(_))
        ));
        assert!(matches!(
            set.mutate_range(&Span::new(0, 3, 1), &Span::new(2, 4, 1)),
            Err(Error::OverlappingRanges(_))
        ));
    }

    #[test]
    fn test_mutate_never_added_range_overflows() {
        let mut set = RangeSet::new(0);
        set.insert_filled(&Span::new(0, 10, 1)).unwrap();
        assert!(matches!(
            set.mutate_range(&Span::new(0, 0, 1), &Span::new(0, 10, 1)),
            Err(Error::FillOverflow(_))
        ));
        assert!(matches!(
            RangeSet::new(0).mutate_range(&Span::point(0), &Span::point(0)),
            Err(Error::RangeNotFound(_))
        ));
    }
}
