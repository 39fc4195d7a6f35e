//! Hierarchical Downsampling
//!
//! A `Downsampler` fans one stream of values out to a family of sinks, one per
//! rate. Rates are powers of a base (1, b, b², ...). The rate-`r` sink receives
//! every `r`-th value; the values it skips are reported to its `dropped_value`
//! hook so it can account for them (e.g. widen a span's fill rate).
//!
//! ```text
//! base = 4
//!
//! value #:   1  2  3  4  5  6  7  8 ... 16
//! rate 1:    ●  ●  ●  ●  ●  ●  ●  ●      ●
//! rate 4:             ●           ●      ●
//! rate 16:                               ●   (created when the count reaches 16)
//! ```
//!
//! Sinks are created lazily: the rate-`r` sink appears when the count first
//! reaches `r`, and is seeded from the next finer sink through
//! `DownsampledSink::init_from_finer` so it covers the history it missed.
//!
//! With `n` values there are `O(log_b n)` sinks and each value costs `O(1)`
//! amortized work per sink.

use crate::error::{Error, Result};
use std::collections::BTreeMap;

/// One rate level of a `Downsampler`
pub trait DownsampledSink<T> {
    /// The value landed on this sink's rate
    fn add_value(&mut self, value: &T) -> Result<()>;

    /// The value was skipped at this sink's rate
    fn dropped_value(&mut self, _value: &T) -> Result<()> {
        Ok(())
    }

    /// Seed a freshly created sink from the next finer rate's current state
    fn init_from_finer(&mut self, _finer: &Self) -> Result<()>
    where
        Self: Sized,
    {
        Ok(())
    }
}

/// Check a configured downsampling base: an integer of at least 2.
pub fn validate_base_rate(base_rate: f64) -> Result<u64> {
    if !(base_rate >= 2.0) || base_rate.fract() != 0.0 || !base_rate.is_finite() {
        return Err(Error::InvalidBaseRate(base_rate));
    }
    Ok(base_rate as u64)
}

type SinkFactory<S> = Box<dyn Fn(u64) -> S + Send + Sync>;

/// Routes values to per-rate sinks
pub struct Downsampler<S> {
    base_rate: u64,
    count: u64,
    instances: BTreeMap<u64, S>,
    factory: SinkFactory<S>,
}

impl<S> Downsampler<S> {
    /// Create a downsampler with no values yet.
    ///
    /// # Errors
    /// `InvalidBaseRate` if `base_rate` is below 2 or not an integer.
    pub fn new<F>(base_rate: f64, factory: F) -> Result<Self>
    where
        F: Fn(u64) -> S + Send + Sync + 'static,
    {
        Self::with_count(base_rate, 0, factory)
    }

    /// Create a downsampler that resumes after `count` values.
    ///
    /// Sinks for every rate below the rate implied by `count` are created
    /// empty; the next `add_value` creates the top one.
    pub fn with_count<F>(base_rate: f64, count: u64, factory: F) -> Result<Self>
    where
        F: Fn(u64) -> S + Send + Sync + 'static,
    {
        let base_rate = validate_base_rate(base_rate)?;
        let mut sampler = Self {
            base_rate,
            count,
            instances: BTreeMap::new(),
            factory: Box::new(factory),
        };

        let max_rate = sampler.rate_for_count(count);
        let mut rate = 1;
        while rate < max_rate {
            sampler.instances.insert(rate, (sampler.factory)(rate));
            rate *= base_rate;
        }
        Ok(sampler)
    }

    pub fn base_rate(&self) -> u64 {
        self.base_rate
    }

    /// Number of values added so far
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Largest power of the base not above `count` (0 when nothing was added)
    pub fn rate_for_count(&self, count: u64) -> u64 {
        if count == 0 {
            return 0;
        }
        let mut rate = 1u64;
        while let Some(next) = rate.checked_mul(self.base_rate) {
            if next > count {
                break;
            }
            rate = next;
        }
        rate
    }

    /// Route one value to every sink.
    pub fn add_value<T>(&mut self, value: &T) -> Result<()>
    where
        S: DownsampledSink<T>,
    {
        self.count += 1;
        let count = self.count;
        let max_rate = self.rate_for_count(count);

        if !self.instances.contains_key(&max_rate) {
            let mut instance = (self.factory)(max_rate);
            if max_rate > 1 {
                if let Some(finer) = self.instances.get(&(max_rate / self.base_rate)) {
                    instance.init_from_finer(finer)?;
                }
            }
            self.instances.insert(max_rate, instance);
        }

        for (rate, instance) in self.instances.iter_mut() {
            if count % rate == 0 {
                instance.add_value(value)?;
            } else {
                instance.dropped_value(value)?;
            }
        }
        Ok(())
    }

    /// Rate of the coarsest sink whose item count stays within `max_count`,
    /// rounded up to a power of the base.
    pub fn instance_rate(&self, max_count: u64) -> Option<u64> {
        if self.count == 0 || max_count == 0 {
            return None;
        }
        let wanted = self.count.div_ceil(max_count);
        let capped = wanted.min(self.rate_for_count(self.count));

        let mut rate = 1u64;
        while rate < capped {
            rate *= self.base_rate;
        }
        Some(rate)
    }

    /// Sink chosen for a budget of `max_count` items
    pub fn get_instance(&self, max_count: u64) -> Option<&S> {
        self.instance_rate(max_count)
            .and_then(|rate| self.instances.get(&rate))
    }

    pub fn instance_for_rate(&self, rate: u64) -> Option<&S> {
        self.instances.get(&rate)
    }

    pub fn instance_for_rate_mut(&mut self, rate: u64) -> Option<&mut S> {
        self.instances.get_mut(&rate)
    }

    /// Active rates, finest first
    pub fn rates(&self) -> Vec<u64> {
        self.instances.keys().copied().collect()
    }

    pub fn instances_mut(&mut self) -> impl Iterator<Item = (u64, &mut S)> {
        self.instances.iter_mut().map(|(rate, sink)| (*rate, sink))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Counter {
        rate: u64,
        added: Vec<u64>,
        dropped: u64,
        seeded_from: Option<usize>,
    }

    impl DownsampledSink<u64> for Counter {
        fn add_value(&mut self, value: &u64) -> Result<()> {
            self.added.push(*value);
            Ok(())
        }

        fn dropped_value(&mut self, _value: &u64) -> Result<()> {
            self.dropped += 1;
            Ok(())
        }

        fn init_from_finer(&mut self, finer: &Self) -> Result<()> {
            self.seeded_from = Some(finer.added.len());
            Ok(())
        }
    }

    fn counter(rate: u64) -> Counter {
        Counter {
            rate,
            ..Default::default()
        }
    }

    #[test]
    fn test_rejects_bad_base() {
        assert!(matches!(
            Downsampler::new(1.0, counter),
            Err(Error::InvalidBaseRate(_))
        ));
        assert!(matches!(
            Downsampler::new(5.5, counter),
            Err(Error::InvalidBaseRate(_))
        ));
        assert!(matches!(
            Downsampler::new(f64::NAN, counter),
            Err(Error::InvalidBaseRate(_))
        ));
        assert!(Downsampler::new(2.0, counter).is_ok());
    }

    #[test]
    fn test_each_rate_receives_floor_n_over_r() {
        for base in [2u64, 3, 4] {
            let mut sampler = Downsampler::new(base as f64, counter).unwrap();
            let n = 200u64;
            for v in 1..=n {
                sampler.add_value(&v).unwrap();
            }

            let max_rate = sampler.rate_for_count(n);
            let mut rate = 1;
            while rate <= max_rate {
                let sink = sampler.instance_for_rate(rate).unwrap();
                assert_eq!(sink.rate, rate);
                assert_eq!(sink.added.len() as u64, n / rate, "base {} rate {}", base, rate);
                assert!(sink.added.iter().all(|v| v % rate == 0));
                rate *= base;
            }
            assert!(sampler.instance_for_rate(max_rate * base).is_none());
        }
    }

    #[test]
    fn test_dropped_values_are_reported() {
        let mut sampler = Downsampler::new(4.0, counter).unwrap();
        for v in 1..=20u64 {
            sampler.add_value(&v).unwrap();
        }
        let rate4 = sampler.instance_for_rate(4).unwrap();
        // created at value 4, so it saw values 4..=20
        assert_eq!(rate4.added.len(), 5);
        assert_eq!(rate4.dropped, 12);
    }

    #[test]
    fn test_new_rate_is_seeded_from_finer() {
        let mut sampler = Downsampler::new(2.0, counter).unwrap();
        for v in 1..=4u64 {
            sampler.add_value(&v).unwrap();
        }
        // rate 2 appeared at value 2, when rate 1 held one value
        assert_eq!(sampler.instance_for_rate(2).unwrap().seeded_from, Some(1));
        // rate 4 appeared at value 4, when rate 2 held one value
        assert_eq!(sampler.instance_for_rate(4).unwrap().seeded_from, Some(1));
        assert_eq!(sampler.instance_for_rate(1).unwrap().seeded_from, None);
    }

    #[test]
    fn test_get_instance_picks_coarsest_within_budget() {
        let mut sampler = Downsampler::new(4.0, counter).unwrap();
        for v in 1..=100u64 {
            sampler.add_value(&v).unwrap();
        }
        assert_eq!(sampler.rates(), vec![1, 4, 16, 64]);

        assert_eq!(sampler.instance_rate(1000), Some(1));
        assert_eq!(sampler.instance_rate(100), Some(1));
        assert_eq!(sampler.instance_rate(50), Some(4));
        assert_eq!(sampler.instance_rate(25), Some(4));
        assert_eq!(sampler.instance_rate(10), Some(16));
        // capped at the coarsest rate
        assert_eq!(sampler.instance_rate(1), Some(64));
        assert_eq!(sampler.get_instance(10).unwrap().rate, 16);
        assert!(sampler.get_instance(0).is_none());
    }

    #[test]
    fn test_with_count_resumes() {
        let sampler = Downsampler::with_count(2.0, 9, counter).unwrap();
        assert_eq!(sampler.count(), 9);
        assert_eq!(sampler.rates(), vec![1, 2, 4]);
    }

    #[test]
    fn test_empty_sampler_has_no_instance() {
        let sampler = Downsampler::new(2.0, counter).unwrap();
        assert!(sampler.get_instance(10).is_none());
        assert_eq!(sampler.rate_for_count(0), 0);
    }
}
