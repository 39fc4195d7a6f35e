//! Size-Bounded FIFO Cache
//!
//! `SizedCache` bounds memory by a caller-supplied size estimate rather than
//! by entry count. When the total estimate exceeds the maximum, entries are
//! evicted in insertion order, oldest first.
//!
//! Entries live in an unbounded `LruCache`. Lookups go through `peek`, so
//! they never refresh an entry's position and the least recently used entry
//! is always the oldest insertion. Playback walks video roughly in time
//! order, so the oldest insertion is almost always the least useful one.
//!
//! ```text
//! max = 100
//!
//! insert A (40)   [A]        total 40
//! insert B (40)   [A, B]     total 80
//! insert C (40)   [A, B, C]  total 120 > 100 → evict A
//!                 [B, C]     total 80
//! ```

use lru::LruCache;
use std::borrow::Borrow;
use std::hash::Hash;

/// Bounded key/value cache with insertion-order eviction
pub struct SizedCache<K, V> {
    max_size: u64,
    total_size: u64,
    /// Unbounded by count; only `push` and `pop_lru` touch the order
    entries: LruCache<K, (V, u64)>,
}

impl<K, V> SizedCache<K, V>
where
    K: Eq + Hash,
{
    pub fn new(max_size: u64) -> Self {
        Self {
            max_size,
            total_size: 0,
            entries: LruCache::unbounded(),
        }
    }

    /// Insert `value` with an estimated `size`, replacing any entry for `key`,
    /// then evict the oldest entries until the total fits.
    ///
    /// Returns the number of evicted entries. An entry larger than the whole
    /// cache is evicted immediately.
    pub fn insert(&mut self, key: K, value: V, size: u64) -> usize {
        // Replacing a key makes it the newest entry
        if let Some((_, (_, old_size))) = self.entries.push(key, (value, size)) {
            self.total_size -= old_size;
        }
        self.total_size += size;

        let mut evicted = 0;
        while self.total_size > self.max_size {
            let Some((_, (_, oldest_size))) = self.entries.pop_lru() else {
                break;
            };
            self.total_size -= oldest_size;
            evicted += 1;
        }
        evicted
    }

    /// Look up without refreshing the entry's position
    pub fn get<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.peek(key).map(|(value, _)| value)
    }

    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.contains(key)
    }

    pub fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let (value, size) = self.entries.pop(key)?;
        self.total_size -= size;
        Some(value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of the size estimates of all cached entries
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }
}
