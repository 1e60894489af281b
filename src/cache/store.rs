//! Count and byte bounded LRU store shared by both caches
//!
//! Not synchronised on its own: each cache wraps one store in a single
//! mutex so the hash index, recency list and byte total move together.

use std::hash::Hash;

use lru::LruCache;
use serde::{Deserialize, Serialize};

use super::CacheError;

/// Capacity knobs for one cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheLimits {
    /// Maximum number of entries
    pub max_entries: usize,
    /// Maximum total payload bytes (or estimated bytes)
    pub max_bytes: usize,
}

impl CacheLimits {
    #[must_use]
    pub const fn new(max_entries: usize, max_bytes: usize) -> Self {
        Self {
            max_entries,
            max_bytes,
        }
    }

    /// Reject non-positive limits.
    pub fn validate(self) -> Result<Self, CacheError> {
        if self.max_entries == 0 || self.max_bytes == 0 {
            return Err(CacheError::InvalidLimits {
                max_entries: self.max_entries,
                max_bytes: self.max_bytes,
            });
        }
        Ok(self)
    }
}

/// Point-in-time occupancy of a cache.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheUsage {
    pub entries: usize,
    pub bytes: usize,
}

/// Running counters for a cache.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

impl CacheStats {
    /// Hit ratio in `0.0..=1.0`, or 0 before the first lookup.
    #[must_use]
    pub fn hit_ratio(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}

pub(crate) struct LruStore<K: Hash + Eq, V> {
    entries: LruCache<K, (V, usize)>,
    total_bytes: usize,
    limits: CacheLimits,
    stats: CacheStats,
}

impl<K: Hash + Eq + Clone, V: Clone> LruStore<K, V> {
    pub(crate) fn new(limits: CacheLimits) -> Self {
        Self {
            entries: LruCache::unbounded(),
            total_bytes: 0,
            limits,
            stats: CacheStats::default(),
        }
    }

    /// Insert or replace, refresh recency, then evict from the tail.
    ///
    /// Returns the number of entries evicted to get back under the limits.
    pub(crate) fn insert(&mut self, key: K, value: V, cost: usize) -> usize {
        if let Some((_, old_cost)) = self.entries.put(key, (value, cost)) {
            self.total_bytes -= old_cost;
        }
        self.total_bytes += cost;
        self.evict_to_limits()
    }

    pub(crate) fn get(&mut self, key: &K) -> Option<V> {
        match self.entries.get(key) {
            Some((value, _)) => {
                self.stats.hits += 1;
                Some(value.clone())
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    pub(crate) fn contains(&self, key: &K) -> bool {
        self.entries.contains(key)
    }

    pub(crate) fn remove(&mut self, key: &K) -> bool {
        match self.entries.pop(key) {
            Some((_, cost)) => {
                self.total_bytes -= cost;
                true
            }
            None => false,
        }
    }

    /// Remove every entry whose key matches `pred`.
    pub(crate) fn remove_where(&mut self, mut pred: impl FnMut(&K) -> bool) -> usize {
        let doomed: Vec<K> = self
            .entries
            .iter()
            .filter(|(k, _)| pred(k))
            .map(|(k, _)| k.clone())
            .collect();

        for key in &doomed {
            self.remove(key);
        }
        doomed.len()
    }

    pub(crate) fn keys_where(&self, mut pred: impl FnMut(&K) -> bool) -> Vec<K> {
        self.entries
            .iter()
            .filter(|(k, _)| pred(k))
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub(crate) fn set_limits(&mut self, limits: CacheLimits) -> usize {
        self.limits = limits;
        self.evict_to_limits()
    }

    pub(crate) fn limits(&self) -> CacheLimits {
        self.limits
    }

    pub(crate) fn usage(&self) -> CacheUsage {
        CacheUsage {
            entries: self.entries.len(),
            bytes: self.total_bytes,
        }
    }

    pub(crate) fn stats(&self) -> CacheStats {
        self.stats
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
        self.total_bytes = 0;
    }

    fn evict_to_limits(&mut self) -> usize {
        let mut evicted = 0;
        while self.entries.len() > self.limits.max_entries
            || self.total_bytes > self.limits.max_bytes
        {
            let Some((_, (_, cost))) = self.entries.pop_lru() else {
                break;
            };
            self.total_bytes -= cost;
            evicted += 1;
        }
        self.stats.evictions += evicted as u64;
        evicted
    }
}
