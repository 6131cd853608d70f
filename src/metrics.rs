//! Request metrics.
//!
//! Counters accumulate until [`MetricsCollector::reset`]. Latency statistics
//! are computed from a window of the most recent samples.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

const DEFAULT_SAMPLE_WINDOW: usize = 1000;

/// Point-in-time view of the collected metrics. Times are in milliseconds,
/// rates in percent.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PerformanceMetrics {
    pub total_requests: u64,
    pub failed_requests: u64,
    pub circuit_breaker_trips: u64,
    pub retry_attempts: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub average_response_time: f64,
    pub p95_response_time: f64,
    pub p99_response_time: f64,
    pub cache_hit_rate: f64,
}

#[derive(Default)]
struct Counters {
    total_requests: u64,
    failed_requests: u64,
    circuit_breaker_trips: u64,
    retry_attempts: u64,
    cache_hits: u64,
    cache_misses: u64,
    samples: VecDeque<f64>,
}

pub struct MetricsCollector {
    enabled: bool,
    window: usize,
    counters: Mutex<Counters>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::with_window(DEFAULT_SAMPLE_WINDOW)
    }

    /// Keeps at most `window` latency samples.
    pub fn with_window(window: usize) -> Self {
        Self {
            enabled: true,
            window: window.max(1),
            counters: Mutex::new(Counters::default()),
        }
    }

    /// A collector that ignores every recording.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::new()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn record_request(&self, duration: Duration, success: bool) {
        if !self.enabled {
            return;
        }
        let mut c = self.lock();
        c.total_requests += 1;
        if !success {
            c.failed_requests += 1;
        }
        if c.samples.len() == self.window {
            c.samples.pop_front();
        }
        c.samples.push_back(duration.as_secs_f64() * 1000.0);
    }

    pub fn record_cache_hit(&self) {
        if self.enabled {
            self.lock().cache_hits += 1;
        }
    }

    pub fn record_cache_miss(&self) {
        if self.enabled {
            self.lock().cache_misses += 1;
        }
    }

    pub fn record_circuit_breaker_trip(&self) {
        if self.enabled {
            self.lock().circuit_breaker_trips += 1;
        }
    }

    pub fn record_retry_attempt(&self) {
        if self.enabled {
            self.lock().retry_attempts += 1;
        }
    }

    pub fn metrics(&self) -> PerformanceMetrics {
        let c = self.lock();
        let mut sorted: Vec<f64> = c.samples.iter().copied().collect();
        sorted.sort_by(f64::total_cmp);

        let average_response_time = if sorted.is_empty() {
            0.0
        } else {
            sorted.iter().sum::<f64>() / sorted.len() as f64
        };
        let lookups = c.cache_hits + c.cache_misses;
        let cache_hit_rate = if lookups == 0 {
            0.0
        } else {
            c.cache_hits as f64 / lookups as f64 * 100.0
        };

        PerformanceMetrics {
            total_requests: c.total_requests,
            failed_requests: c.failed_requests,
            circuit_breaker_trips: c.circuit_breaker_trips,
            retry_attempts: c.retry_attempts,
            cache_hits: c.cache_hits,
            cache_misses: c.cache_misses,
            average_response_time,
            p95_response_time: percentile(&sorted, 95.0),
            p99_response_time: percentile(&sorted, 99.0),
            cache_hit_rate,
        }
    }

    /// Percentage of recorded requests that succeeded; 100 before any request.
    pub fn success_rate(&self) -> f64 {
        let c = self.lock();
        if c.total_requests == 0 {
            return 100.0;
        }
        (c.total_requests - c.failed_requests) as f64 / c.total_requests as f64 * 100.0
    }

    pub fn reset(&self) {
        *self.lock() = Counters::default();
    }

    fn lock(&self) -> MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Nearest-rank percentile of an ascending slice.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (p / 100.0 * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}
