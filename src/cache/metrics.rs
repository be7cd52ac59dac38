//! Cache counters: one atomic per counter, with a cheap `snapshot()` for
//! callers that want a consistent point-in-time read for diagnostics.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct CacheMetrics {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub try_again: AtomicU64,
    pub clock_evictions: AtomicU64,
    pub partial_evictions: AtomicU64,
    pub checkpoint_writes: AtomicU64,
    pub cleaner_sweeps: AtomicU64,
}

impl CacheMetrics {
    #[must_use]
    pub fn snapshot(&self) -> CacheMetricsSnapshot {
        CacheMetricsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            try_again: self.try_again.load(Ordering::Relaxed),
            clock_evictions: self.clock_evictions.load(Ordering::Relaxed),
            partial_evictions: self.partial_evictions.load(Ordering::Relaxed),
            checkpoint_writes: self.checkpoint_writes.load(Ordering::Relaxed),
            cleaner_sweeps: self.cleaner_sweeps.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CacheMetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub try_again: u64,
    pub clock_evictions: u64,
    pub partial_evictions: u64,
    pub checkpoint_writes: u64,
    pub cleaner_sweeps: u64,
}
