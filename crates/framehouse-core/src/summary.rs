//! Range Summaries
//!
//! A timeline covering months of video holds far more spans than a client can
//! draw. `RangeSummary` keeps the spans of one rate at several resolutions,
//! using a [`Downsampler`] over [`RangeSet`] tiers: the rate-`r` tier keeps every
//! `r`-th span and folds the others into their nearest neighbor, so its spans
//! carry a `fill_rate` below 1 where they paper over gaps.
//!
//! `summarize` picks the finest tier that still fits the requested count, so
//! answers are never more than `factor` times smaller than asked for.
//!
//! ## Usage
//!
//! ```ignore
//! let mut summary = RangeSummary::new(4.0)?;
//! summary.add_range(Span::new(0, 10_000, 300))?;
//! summary.mutate_range(&Span::new(0, 10_000, 300), &Span::new(0, 12_000, 360))?;
//!
//! let spans = summary.summarize(&Span::new(0, i64::MAX, 0), 200)?;
//! ```

use crate::downsample::{DownsampledSink, Downsampler};
use crate::error::{Error, Result};
use crate::ranges::{RangeSet, Span};

/// Default ratio between adjacent summary resolutions
pub const DEFAULT_SUMMARY_FACTOR: f64 = 4.0;

/// One resolution of a `RangeSummary`
pub struct SummaryTier {
    rate: u64,
    ranges: RangeSet,
}

impl SummaryTier {
    fn new(rate: u64) -> Self {
        Self {
            rate,
            ranges: RangeSet::new(0),
        }
    }

    pub fn rate(&self) -> u64 {
        self.rate
    }

    pub fn spans(&self) -> &[Span] {
        self.ranges.spans()
    }
}

impl DownsampledSink<Span> for SummaryTier {
    fn add_value(&mut self, value: &Span) -> Result<()> {
        self.ranges.insert_filled(value)
    }

    fn dropped_value(&mut self, value: &Span) -> Result<()> {
        if self.ranges.is_empty() {
            return self.ranges.insert_filled(value);
        }
        self.ranges.dropped_value(value)
    }

    fn init_from_finer(&mut self, finer: &Self) -> Result<()> {
        let mut spans = finer.spans().iter();
        if let Some(first) = spans.next() {
            self.ranges.insert_filled(first)?;
        }
        for span in spans {
            self.ranges.dropped_value(span)?;
        }
        Ok(())
    }
}

/// Multi-resolution view over the spans of one rate
pub struct RangeSummary {
    sampler: Downsampler<SummaryTier>,
    factor: u64,
}

impl RangeSummary {
    /// # Errors
    /// `InvalidBaseRate` if `factor` is below 2 or fractional.
    pub fn new(factor: f64) -> Result<Self> {
        let sampler = Downsampler::new(factor, SummaryTier::new)?;
        let factor = sampler.base_rate();
        Ok(Self { sampler, factor })
    }

    /// Number of raw spans added
    pub fn count(&self) -> u64 {
        self.sampler.count()
    }

    /// Add a new raw span. Spans may arrive out of order but never overlap.
    pub fn add_range(&mut self, span: Span) -> Result<()> {
        if span.last_time < span.first_time {
            return Err(Error::InvalidSpan {
                first_time: span.first_time,
                last_time: span.last_time,
            });
        }
        if let Some(finest) = self.sampler.instance_for_rate(1) {
            if let Some(existing) = finest.spans().iter().find(|s| s.overlaps(&span)) {
                return Err(Error::OverlappingRanges(format!(
                    "[{}, {}] overlaps [{}, {}]",
                    span.first_time, span.last_time, existing.first_time, existing.last_time
                )));
            }
        }

        let mut span = span;
        span.fill_rate = Some(1.0);
        self.sampler.add_value(&span)
    }

    /// Grow a raw span previously passed to `add_range` (or a prior mutation).
    pub fn mutate_range(&mut self, old: &Span, new: &Span) -> Result<()> {
        let mut old = old.clone();
        let mut new = new.clone();
        old.fill_rate = Some(1.0);
        new.fill_rate = Some(1.0);

        for (_, tier) in self.sampler.instances_mut() {
            tier.ranges.mutate_range(&old, &new)?;
        }
        Ok(())
    }

    /// Spans intersecting `range`, at most roughly `max` of them.
    ///
    /// Starts from the tier sized for `max` and moves to finer tiers while
    /// they still fit.
    pub fn summarize(&self, range: &Span, max: usize) -> Result<Vec<Span>> {
        if range.last_time < range.first_time {
            return Err(Error::InvalidSpan {
                first_time: range.first_time,
                last_time: range.last_time,
            });
        }
        if max == 0 || self.count() == 0 {
            return Ok(Vec::new());
        }

        let within = |budget: u64| -> Vec<Span> {
            self.sampler
                .get_instance(budget)
                .map(|tier| {
                    tier.spans()
                        .iter()
                        .filter(|s| s.overlaps(range))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        };

        let mut budget = max as u64;
        let mut best = within(budget);
        loop {
            let next = budget.saturating_mul(self.factor);
            if next > self.count() {
                break;
            }
            let spans = within(next);
            if spans.len() > max {
                break;
            }
            best = spans;
            budget = next;
        }
        Ok(best)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn everything() -> Span {
        Span::new(i64::MIN / 2, i64::MAX / 2, 0)
    }

    #[test]
    fn test_rejects_bad_factor() {
        assert!(RangeSummary::new(1.0).is_err());
        assert!(RangeSummary::new(5.5).is_err());
    }

    #[test]
    fn test_rejects_invalid_and_overlapping_ranges() {
        let mut summary = RangeSummary::new(2.0).unwrap();
        assert!(summary.add_range(Span::new(0, -1, 1)).is_err());

        summary.add_range(Span::new(0, 3, 1)).unwrap();
        assert!(matches!(
            summary.add_range(Span::new(2, 4, 1)),
            Err(Error::OverlappingRanges(_))
        ));
        assert!(matches!(
            summary.add_range(Span::new(-1, 4, 1)),
            Err(Error::OverlappingRanges(_))
        ));
        assert!(summary.summarize(&Span::new(0, -1, 0), 0).is_err());
    }

    #[test]
    fn test_full_budget_returns_every_span() {
        let mut summary = RangeSummary::new(2.0).unwrap();
        for i in 0..10 {
            summary.add_range(Span::new(i * 10, i * 10 + 1, 1)).unwrap();
        }
        let all = summary.summarize(&everything(), usize::MAX / 4).unwrap();
        assert_eq!(all.len(), 10);
        assert!(all.iter().all(|s| s.fill_rate == Some(1.0)));
    }

    #[test]
    fn test_small_budget_summarizes_with_partial_fill() {
        let mut summary = RangeSummary::new(2.0).unwrap();
        for i in 0..10 {
            summary.add_range(Span::new(i * 5, i * 5, 1)).unwrap();
        }
        for i in 0..10 {
            let old = Span::new(i * 5, i * 5, 1);
            let new = Span::new(i * 5, i * 5 + 2, 1);
            summary.mutate_range(&old, &new).unwrap();
        }

        let spans = summary.summarize(&Span::new(0, 5, 0), 1).unwrap();
        assert!(!spans.is_empty());
        assert_eq!(spans[0].first_time, 0);
        assert!(spans.iter().any(|s| s.last_time >= 5));

        let fill = spans[0].fill_rate.unwrap();
        assert!(fill > 0.0 && fill < 1.0, "fill rate {}", fill);
    }

    #[test]
    fn test_summaries_stay_inside_requested_range() {
        let mut summary = RangeSummary::new(2.0).unwrap();
        for i in 0..32 {
            summary.add_range(Span::new(i * 100, i * 100 + 50, 1)).unwrap();
        }
        let window = Span::new(1_000, 2_000, 0);
        for max in 1..40 {
            let spans = summary.summarize(&window, max).unwrap();
            for span in &spans {
                assert!(span.overlaps(&window), "{:?} outside window", span);
            }
        }
        let exact = summary.summarize(&window, 40).unwrap();
        assert_eq!(exact.len(), 11);
    }

    #[test]
    fn test_mutate_extends_every_tier() {
        let mut summary = RangeSummary::new(2.0).unwrap();
        summary.add_range(Span::new(0, 10, 1)).unwrap();
        summary.add_range(Span::new(100, 110, 1)).unwrap();
        summary
            .mutate_range(&Span::new(100, 110, 1), &Span::new(100, 150, 1))
            .unwrap();

        let spans = summary.summarize(&everything(), 100).unwrap();
        assert_eq!(spans.last().unwrap().last_time, 150);
    }
}
