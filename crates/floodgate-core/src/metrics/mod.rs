//! Metrics collection and Prometheus text export.

mod prometheus;

use crate::cache::CacheStats;
use crate::circuit_breaker::CircuitBreakerStats;
use crate::rate_limit::RateLimiterStats;
use crate::writer::BatchWriterMetrics;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Upper bounds of the commit duration buckets, in seconds.
pub const FLUSH_DURATION_BUCKETS: [f64; 10] =
    [0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 10.0];

/// Cumulative histogram of commit durations.
pub struct FlushHistogram {
    sum_micros: AtomicU64,
    count: AtomicU64,
    buckets: [AtomicU64; FLUSH_DURATION_BUCKETS.len()],
}

impl FlushHistogram {
    /// Create an empty histogram.
    pub fn new() -> Self {
        Self {
            sum_micros: AtomicU64::new(0),
            count: AtomicU64::new(0),
            buckets: Default::default(),
        }
    }

    /// Record one observation.
    pub fn observe(&self, duration: Duration) {
        let seconds = duration.as_secs_f64();
        self.sum_micros
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);

        for (bucket, le) in self.buckets.iter().zip(FLUSH_DURATION_BUCKETS) {
            if seconds <= le {
                bucket.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Read the current counts.
    pub fn snapshot(&self) -> FlushDurationHistogram {
        FlushDurationHistogram {
            sum_seconds: self.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0,
            count: self.count.load(Ordering::Relaxed),
            buckets: FLUSH_DURATION_BUCKETS
                .iter()
                .zip(&self.buckets)
                .map(|(le, n)| (*le, n.load(Ordering::Relaxed)))
                .collect(),
        }
    }
}

impl Default for FlushHistogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Histogram data for export. Bucket counts are cumulative; `count` is +Inf.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlushDurationHistogram {
    /// Sum of observations in seconds
    pub sum_seconds: f64,
    /// Number of observations
    pub count: u64,
    /// (upper bound in seconds, cumulative count)
    pub buckets: Vec<(f64, u64)>,
}

/// Everything the layer exposes at one instant.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    /// Hot cache
    pub cache: CacheStats,
    /// One entry per rate limiter
    pub limiters: Vec<RateLimiterStats>,
    /// Batch writer
    pub writer: BatchWriterMetrics,
    /// Commit durations
    pub flush_duration: FlushDurationHistogram,
    /// Store circuit breaker
    pub circuit_breaker: CircuitBreakerStats,
}
