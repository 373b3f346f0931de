//! Internal metrics collection.
//!
//! Collects metrics in-memory; the HTTP layer renders a snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// A counter metric.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_by(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// A gauge metric (can go up or down).
#[derive(Debug, Default)]
pub struct Gauge(AtomicU64);

impl Gauge {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn set(&self, val: u64) {
        self.0.store(val, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Saturates at zero.
    pub fn dec(&self) {
        let _ = self
            .0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            });
    }
}

/// Histogram for latency tracking.
#[derive(Debug)]
pub struct Histogram {
    /// Buckets: 1ms, 5ms, 10ms, 50ms, 100ms, 500ms, 1s, 7.5s, 60s
    buckets: [AtomicU64; 9],
    sum: AtomicU64,
    count: AtomicU64,
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

impl Histogram {
    const BUCKET_BOUNDS: [u64; 9] = [1, 5, 10, 50, 100, 500, 1000, 7500, 60000];

    pub fn new() -> Self {
        Self {
            buckets: Default::default(),
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Records a value in milliseconds.
    pub fn observe(&self, ms: u64) {
        self.sum.fetch_add(ms, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);

        let index = Self::BUCKET_BOUNDS
            .iter()
            .position(|&bound| ms <= bound)
            .unwrap_or(Self::BUCKET_BOUNDS.len() - 1);
        self.buckets[index].fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum(&self) -> u64 {
        self.sum.load(Ordering::Relaxed)
    }

    pub fn mean(&self) -> f64 {
        let count = self.count();
        if count == 0 {
            0.0
        } else {
            self.sum() as f64 / count as f64
        }
    }

    /// Returns bucket counts.
    pub fn buckets(&self) -> Vec<(u64, u64)> {
        Self::BUCKET_BOUNDS
            .iter()
            .zip(self.buckets.iter())
            .map(|(&bound, count)| (bound, count.load(Ordering::Relaxed)))
            .collect()
    }
}

/// Collected metrics for the NATS engine.
#[derive(Debug, Default)]
pub struct Metrics {
    // Connection
    pub connection_attempts: Counter,
    pub connection_failures: Counter,
    pub reconnects: Counter,

    // Consumption
    pub messages_received: Counter,
    pub messages_acked: Counter,
    pub messages_requeued: Counter,
    pub broken_messages_skipped: Counter,

    // Streaming into views
    pub streaming_passes: Counter,
    pub streaming_errors: Counter,
    pub blocks_streamed: Counter,
    pub rows_streamed: Counter,
    pub direct_reads: Counter,

    // Production
    pub messages_published: Counter,
    pub publish_errors: Counter,

    // Latency histograms
    pub stream_pass_latency_ms: Histogram,
    pub publish_latency_ms: Histogram,

    // Gauges
    pub active_connections: Gauge,
    pub active_readers: Gauge,
    pub leased_buffers: Gauge,
    pub backoff_ms: Gauge,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }
}

/// A snapshot of metrics at a point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub connection_attempts: u64,
    pub connection_failures: u64,
    pub reconnects: u64,
    pub messages_received: u64,
    pub messages_acked: u64,
    pub messages_requeued: u64,
    pub broken_messages_skipped: u64,
    pub streaming_passes: u64,
    pub streaming_errors: u64,
    pub blocks_streamed: u64,
    pub rows_streamed: u64,
    pub direct_reads: u64,
    pub messages_published: u64,
    pub publish_errors: u64,
    pub stream_pass_latency_mean_ms: f64,
    pub publish_latency_mean_ms: f64,
    pub active_connections: u64,
    pub active_readers: u64,
    pub leased_buffers: u64,
    pub backoff_ms: u64,
}

impl Metrics {
    /// Takes a snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            timestamp: Utc::now(),
            connection_attempts: self.connection_attempts.get(),
            connection_failures: self.connection_failures.get(),
            reconnects: self.reconnects.get(),
            messages_received: self.messages_received.get(),
            messages_acked: self.messages_acked.get(),
            messages_requeued: self.messages_requeued.get(),
            broken_messages_skipped: self.broken_messages_skipped.get(),
            streaming_passes: self.streaming_passes.get(),
            streaming_errors: self.streaming_errors.get(),
            blocks_streamed: self.blocks_streamed.get(),
            rows_streamed: self.rows_streamed.get(),
            direct_reads: self.direct_reads.get(),
            messages_published: self.messages_published.get(),
            publish_errors: self.publish_errors.get(),
            stream_pass_latency_mean_ms: self.stream_pass_latency_ms.mean(),
            publish_latency_mean_ms: self.publish_latency_ms.mean(),
            active_connections: self.active_connections.get(),
            active_readers: self.active_readers.get(),
            leased_buffers: self.leased_buffers.get(),
            backoff_ms: self.backoff_ms.get(),
        }
    }
}

/// Global metrics registry.
pub static METRICS: std::sync::LazyLock<Metrics> = std::sync::LazyLock::new(Metrics::new);

/// Get the global metrics instance.
pub fn metrics() -> &'static Metrics {
    &METRICS
}
