//! Link Metrics
//!
//! Lock-free counters for frame traffic plus a sampled round-trip latency
//! tracker for calls.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Point-in-time view of a link's counters
#[derive(Debug, Clone, Default)]
pub struct LinkMetrics {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub errors: u64,
    pub connects: u64,
    pub disconnects: u64,
    /// Tells accepted for delivery that never reached an actor
    pub dropped_tells: u64,
    pub avg_call_latency_ns: u64,
    pub p99_call_latency_ns: u64,
    pub last_activity: Option<Instant>,
}

/// Metrics tracker for one link or listener connection
#[derive(Clone)]
pub struct MetricsTracker {
    frames_sent: Arc<AtomicU64>,
    frames_received: Arc<AtomicU64>,
    bytes_sent: Arc<AtomicU64>,
    bytes_received: Arc<AtomicU64>,
    errors: Arc<AtomicU64>,
    connects: Arc<AtomicU64>,
    disconnects: Arc<AtomicU64>,
    dropped_tells: Arc<AtomicU64>,

    /// Error counts by `TransportError::category`
    error_types: Arc<RwLock<HashMap<&'static str, u64>>>,

    latency_tracker: Arc<RwLock<LatencyTracker>>,
    last_activity: Arc<RwLock<Option<Instant>>>,
}

impl MetricsTracker {
    pub fn new() -> Self {
        Self {
            frames_sent: Arc::new(AtomicU64::new(0)),
            frames_received: Arc::new(AtomicU64::new(0)),
            bytes_sent: Arc::new(AtomicU64::new(0)),
            bytes_received: Arc::new(AtomicU64::new(0)),
            errors: Arc::new(AtomicU64::new(0)),
            connects: Arc::new(AtomicU64::new(0)),
            disconnects: Arc::new(AtomicU64::new(0)),
            dropped_tells: Arc::new(AtomicU64::new(0)),
            error_types: Arc::new(RwLock::new(HashMap::new())),
            latency_tracker: Arc::new(RwLock::new(LatencyTracker::new())),
            last_activity: Arc::new(RwLock::new(None)),
        }
    }

    #[inline]
    pub fn record_send(&self, bytes: usize) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        *self.last_activity.write() = Some(Instant::now());
    }

    #[inline]
    pub fn record_receive(&self, bytes: usize) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        *self.last_activity.write() = Some(Instant::now());
    }

    /// Record a call round trip
    #[inline]
    pub fn record_call_latency(&self, latency_ns: u64) {
        if let Some(mut tracker) = self.latency_tracker.try_write() {
            tracker.record(latency_ns);
        }
    }

    pub fn record_error(&self, category: &'static str) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        *self.error_types.write().entry(category).or_insert(0) += 1;
    }

    pub fn record_connect(&self) {
        self.connects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped_tells(&self, count: u64) {
        self.dropped_tells.fetch_add(count, Ordering::Relaxed);
    }

    pub fn error_count(&self, category: &str) -> u64 {
        self.error_types.read().get(category).copied().unwrap_or(0)
    }

    pub fn snapshot(&self) -> LinkMetrics {
        let latency = self.latency_tracker.read();
        LinkMetrics {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            connects: self.connects.load(Ordering::Relaxed),
            disconnects: self.disconnects.load(Ordering::Relaxed),
            dropped_tells: self.dropped_tells.load(Ordering::Relaxed),
            avg_call_latency_ns: latency.average(),
            p99_call_latency_ns: latency.percentile(99),
            last_activity: *self.last_activity.read(),
        }
    }
}

impl Default for MetricsTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Ring buffer of recent latency samples
struct LatencyTracker {
    samples: Vec<u64>,
    position: usize,
    total_samples: u64,
    sum: u64,
}

impl LatencyTracker {
    const SAMPLE_SIZE: usize = 1000;

    fn new() -> Self {
        Self {
            samples: Vec::with_capacity(Self::SAMPLE_SIZE),
            position: 0,
            total_samples: 0,
            sum: 0,
        }
    }

    fn record(&mut self, latency_ns: u64) {
        self.sum = self.sum.saturating_add(latency_ns);
        self.total_samples += 1;

        if self.samples.len() < Self::SAMPLE_SIZE {
            self.samples.push(latency_ns);
        } else {
            self.samples[self.position] = latency_ns;
            self.position = (self.position + 1) % Self::SAMPLE_SIZE;
        }
    }

    fn average(&self) -> u64 {
        if self.total_samples > 0 {
            self.sum / self.total_samples
        } else {
            0
        }
    }

    fn percentile(&self, p: usize) -> u64 {
        if self.samples.is_empty() {
            return 0;
        }
        let mut sorted = self.samples.clone();
        sorted.sort_unstable();
        sorted[((sorted.len() - 1) * p) / 100]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = MetricsTracker::new();
        metrics.record_send(100);
        metrics.record_send(20);
        metrics.record_receive(7);
        metrics.record_error("link_broken");
        metrics.record_error("link_broken");
        metrics.record_dropped_tells(3);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.frames_sent, 2);
        assert_eq!(snapshot.bytes_sent, 120);
        assert_eq!(snapshot.frames_received, 1);
        assert_eq!(snapshot.errors, 2);
        assert_eq!(metrics.error_count("link_broken"), 2);
        assert_eq!(snapshot.dropped_tells, 3);
        assert!(snapshot.last_activity.is_some());
    }

    #[test]
    fn test_latency_percentiles() {
        let metrics = MetricsTracker::new();
        for ns in 1..=100 {
            metrics.record_call_latency(ns);
        }
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.avg_call_latency_ns, 50);
        assert_eq!(snapshot.p99_call_latency_ns, 99);
    }
}
