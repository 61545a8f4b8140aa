
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide counters for inference, cache and retrieval activity.
///
/// Updates are lock-free atomic increments so no request ever blocks on
/// telemetry delivery. Per-event detail (latency, outcome, attempt) is
/// emitted through `tracing` at the call sites.
#[derive(Debug, Default)]
pub struct Telemetry {
    inference_attempts: AtomicU64,
    inference_retries: AtomicU64,
    inference_failures: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    searches: AtomicU64,
    fallback_scans: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    pub inference_attempts: u64,
    pub inference_retries: u64,
    pub inference_failures: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub searches: u64,
    pub fallback_scans: u64,
}

impl Telemetry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_inference_attempt(&self) {
        self.inference_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_inference_retry(&self) {
        self.inference_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_inference_failure(&self) {
        self.inference_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_search(&self) {
        self.searches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fallback_scan(&self) {
        self.fallback_scans.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            inference_attempts: self.inference_attempts.load(Ordering::Relaxed),
            inference_retries: self.inference_retries.load(Ordering::Relaxed),
            inference_failures: self.inference_failures.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            searches: self.searches.load(Ordering::Relaxed),
            fallback_scans: self.fallback_scans.load(Ordering::Relaxed),
        }
    }
}
