//! Per-region cache statistics.

use std::sync::atomic::{AtomicU64, Ordering};

/// Region counters. All counters are atomic and monotonically increasing.
#[derive(Debug, Default)]
pub struct CacheStatistics {
    hits: AtomicU64,
    misses: AtomicU64,
    puts: AtomicU64,
    rejected_puts: AtomicU64,
    evictions: AtomicU64,
}

impl CacheStatistics {
    pub(crate) fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_put(&self) {
        self.puts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rejected_put(&self) {
        self.rejected_puts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the number of hits.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Returns the number of misses.
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Returns the number of successful puts.
    pub fn puts(&self) -> u64 {
        self.puts.load(Ordering::Relaxed)
    }

    /// Returns the number of puts refused by the validator or a version check.
    pub fn rejected_puts(&self) -> u64 {
        self.rejected_puts.load(Ordering::Relaxed)
    }

    /// Returns the number of evictions and invalidating removals.
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Returns a snapshot of all counters.
    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.hits(),
            misses: self.misses(),
            puts: self.puts(),
            rejected_puts: self.rejected_puts(),
            evictions: self.evictions(),
        }
    }
}

/// A point-in-time copy of [`CacheStatistics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStatsSnapshot {
    /// Hits.
    pub hits: u64,
    /// Misses.
    pub misses: u64,
    /// Successful puts.
    pub puts: u64,
    /// Refused puts.
    pub rejected_puts: u64,
    /// Evictions.
    pub evictions: u64,
}
