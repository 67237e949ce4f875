//! Cache metrics.
//!
//! Counters are atomic because the engine is shared across threads; reading
//! them never takes a lock. [`CacheMetrics::metrics`] exports a
//! `BTreeMap<String, f64>` snapshot — a sorted map so the output is
//! deterministic, which matters for logs and test comparisons far more than
//! the lookup cost of a dozen keys.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters describing cache behavior since construction.
#[derive(Debug, Default)]
pub struct CacheMetrics {
    region_hits: AtomicU64,
    region_misses: AtomicU64,
    evictions: AtomicU64,
    forced_evictions: AtomicU64,
    allocation_failures: AtomicU64,
    decay_runs: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
}

impl CacheMetrics {
    pub(crate) fn record_hit(&self) {
        self.region_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_miss(&self) {
        self.region_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_forced_eviction(&self) {
        self.forced_evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_allocation_failure(&self) {
        self.allocation_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_decay_run(&self) {
        self.decay_runs.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_bytes_read(&self, bytes: u64) {
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_bytes_written(&self, bytes: u64) {
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Number of lookups that found an already-assigned region.
    pub fn region_hits(&self) -> u64 {
        self.region_hits.load(Ordering::Relaxed)
    }

    /// Number of lookups that created and assigned a new region.
    pub fn region_misses(&self) -> u64 {
        self.region_misses.load(Ordering::Relaxed)
    }

    /// Number of regions evicted to satisfy allocations.
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Number of regions evicted by explicit invalidation.
    pub fn forced_evictions(&self) -> u64 {
        self.forced_evictions.load(Ordering::Relaxed)
    }

    /// Number of lookups that failed because no slot was free or evictable.
    pub fn allocation_failures(&self) -> u64 {
        self.allocation_failures.load(Ordering::Relaxed)
    }

    /// Number of completed decay sweeps.
    pub fn decay_runs(&self) -> u64 {
        self.decay_runs.load(Ordering::Relaxed)
    }

    /// Total bytes copied out of the cache by readers.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    /// Total bytes committed into the cache by gap writers.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    /// Fraction of lookups served by an already-assigned region, or 0.0
    /// before any lookup.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.region_hits();
        let total = hits + self.region_misses();
        if total > 0 {
            hits as f64 / total as f64
        } else {
            0.0
        }
    }

    /// Snapshot of all counters, keyed by stable metric names.
    pub fn metrics(&self) -> BTreeMap<String, f64> {
        let mut out = BTreeMap::new();
        out.insert("region_hits".to_string(), self.region_hits() as f64);
        out.insert("region_misses".to_string(), self.region_misses() as f64);
        out.insert("evictions".to_string(), self.evictions() as f64);
        out.insert(
            "forced_evictions".to_string(),
            self.forced_evictions() as f64,
        );
        out.insert(
            "allocation_failures".to_string(),
            self.allocation_failures() as f64,
        );
        out.insert("decay_runs".to_string(), self.decay_runs() as f64);
        out.insert("bytes_read".to_string(), self.bytes_read() as f64);
        out.insert("bytes_written".to_string(), self.bytes_written() as f64);
        out.insert("hit_rate".to_string(), self.hit_rate());
        out
    }
}
