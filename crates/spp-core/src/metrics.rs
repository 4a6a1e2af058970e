//! Global atomic counters for SPP runs.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (e.g. at the end of a run).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters; no allocations, no locking.
pub struct Metrics {
    requests_dispatched: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    minibatches: AtomicU64,
    rows_failed: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            requests_dispatched: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            minibatches: AtomicU64::new(0),
            rows_failed: AtomicU64::new(0),
        }
    }

    /// A request left the scheduler for the backend stack.
    pub fn inc_requests(&self) {
        self.requests_dispatched.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "requests_dispatched", "counter incremented");
    }

    pub fn inc_cache_hits(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "cache_hits", "counter incremented");
    }

    pub fn inc_cache_misses(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "cache_misses", "counter incremented");
    }

    /// A request carried more than one lane.
    pub fn inc_minibatches(&self) {
        self.minibatches.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "minibatches", "counter incremented");
    }

    pub fn add_rows_failed(&self, n: u64) {
        self.rows_failed.fetch_add(n, Ordering::Relaxed);
        tracing::trace!(metric = "rows_failed", n, "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            requests_dispatched = self.requests_dispatched(),
            cache_hits = self.cache_hits(),
            cache_misses = self.cache_misses(),
            minibatches = self.minibatches(),
            rows_failed = self.rows_failed(),
        );
    }

    pub fn requests_dispatched(&self) -> u64 {
        self.requests_dispatched.load(Ordering::Relaxed)
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    pub fn cache_misses(&self) -> u64 {
        self.cache_misses.load(Ordering::Relaxed)
    }

    pub fn minibatches(&self) -> u64 {
        self.minibatches.load(Ordering::Relaxed)
    }

    pub fn rows_failed(&self) -> u64 {
        self.rows_failed.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.requests_dispatched.store(0, Ordering::Relaxed);
        self.cache_hits.store(0, Ordering::Relaxed);
        self.cache_misses.store(0, Ordering::Relaxed);
        self.minibatches.store(0, Ordering::Relaxed);
        self.rows_failed.store(0, Ordering::Relaxed);
    }
}
