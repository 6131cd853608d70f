//! Per-endpoint circuit breaker.
//!
//! # States
//! - Closed: calls pass through, failures are counted
//! - Open: calls fail fast without touching the network
//! - Half-Open: one probe per recovery window is let through
//!
//! # Transitions
//! ```text
//! Closed    -> Open      failure_count reaches failure_threshold
//! Open      -> Half-Open recovery_timeout elapsed (checked on the next call)
//! Half-Open -> Closed    probe succeeds
//! Half-Open -> Open      probe fails
//! ```
//!
//! No timer drives the transitions: [`CircuitBreaker::can_execute`] derives
//! the state from the instants recorded on failure.

use crate::config::CircuitBreakerConfig;
use dashmap::DashMap;
use http::Method;
use std::collections::HashMap;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

/// Breaker bookkeeping for one endpoint.
#[derive(Debug, Clone, Default)]
pub struct CircuitBreakerState {
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_failure_time: Option<Instant>,
    /// When an open breaker admits its next probe.
    pub next_retry_time: Option<Instant>,
}

impl CircuitBreakerState {
    /// A serializable view of this state as of `now`.
    pub fn snapshot(&self, now: Instant) -> CircuitSnapshot {
        CircuitSnapshot {
            state: self.state,
            failure_count: self.failure_count,
            retry_in_ms: self
                .next_retry_time
                .filter(|_| self.state != CircuitState::Closed)
                .map(|at| at.saturating_duration_since(now).as_millis() as u64),
        }
    }
}

/// Breaker state as reported in health snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    /// Milliseconds until an open breaker admits its next probe.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_in_ms: Option<u64>,
}

/// The outcome of asking a breaker for permission to dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitPermit {
    /// The breaker is closed (or disabled).
    Closed,
    /// This call is the half-open probe; its outcome decides the breaker.
    Probe,
    Refused,
}

pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    endpoints: DashMap<String, CircuitBreakerState>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            endpoints: DashMap::new(),
        }
    }

    /// The breaker key of a request: `"METHOD URL"`.
    pub fn endpoint_key(method: &Method, url: &str) -> String {
        format!("{method} {url}")
    }

    /// Whether a call to `endpoint` may proceed right now.
    ///
    /// An open breaker whose recovery time has passed moves to half-open and
    /// admits this call as the probe; further calls are refused until the
    /// probe reports back or another recovery window passes.
    pub fn can_execute(&self, endpoint: &str) -> bool {
        self.acquire(endpoint) != CircuitPermit::Refused
    }

    /// Like [`can_execute`](Self::can_execute), but tells the caller whether
    /// it holds the probe slot.
    pub fn acquire(&self, endpoint: &str) -> CircuitPermit {
        if !self.config.enabled {
            return CircuitPermit::Closed;
        }
        let Some(mut entry) = self.endpoints.get_mut(endpoint) else {
            return CircuitPermit::Closed;
        };
        if entry.state == CircuitState::Closed {
            return CircuitPermit::Closed;
        }

        let now = Instant::now();
        match entry.next_retry_time {
            Some(retry_at) if now >= retry_at => {
                entry.state = CircuitState::HalfOpen;
                entry.next_retry_time = Some(now + self.config.recovery_timeout);
                tracing::info!(endpoint = %endpoint, "Circuit half-open, admitting probe");
                CircuitPermit::Probe
            }
            _ => CircuitPermit::Refused,
        }
    }

    /// Hands back a probe slot that was never used to dispatch. The breaker
    /// returns to open with its next probe due immediately.
    pub fn release_probe(&self, endpoint: &str) {
        if let Some(mut entry) = self.endpoints.get_mut(endpoint) {
            if entry.state == CircuitState::HalfOpen {
                entry.state = CircuitState::Open;
                entry.next_retry_time = Some(Instant::now());
                tracing::debug!(endpoint = %endpoint, "Probe slot released unused");
            }
        }
    }

    /// Records a successful call. Closes a half-open breaker.
    pub fn on_success(&self, endpoint: &str) {
        if let Some(mut entry) = self.endpoints.get_mut(endpoint) {
            if entry.state != CircuitState::Closed {
                tracing::info!(endpoint = %endpoint, "Circuit closed");
            }
            *entry = CircuitBreakerState::default();
        }
    }

    /// Records a failed call; returns `true` if this failure opened the breaker.
    pub fn on_failure(&self, endpoint: &str) -> bool {
        if !self.config.enabled {
            return false;
        }
        let now = Instant::now();
        let mut entry = self.endpoints.entry(endpoint.to_string()).or_default();

        match entry.state {
            CircuitState::HalfOpen => {
                entry.failure_count += 1;
                self.open(&mut entry, now);
                tracing::warn!(endpoint = %endpoint, "Probe failed, circuit re-opened");
                true
            }
            CircuitState::Open => {
                // A call admitted before the breaker opened has failed late.
                entry.failure_count += 1;
                entry.last_failure_time = Some(now);
                false
            }
            CircuitState::Closed => {
                let stale = entry
                    .last_failure_time
                    .is_some_and(|last| now.duration_since(last) > self.config.monitoring_period);
                if stale {
                    entry.failure_count = 0;
                }
                entry.failure_count += 1;
                entry.last_failure_time = Some(now);

                if entry.failure_count >= self.config.failure_threshold {
                    self.open(&mut entry, now);
                    tracing::warn!(
                        endpoint = %endpoint,
                        failures = entry.failure_count,
                        recovery_ms = self.config.recovery_timeout.as_millis(),
                        "Circuit opened"
                    );
                    true
                } else {
                    false
                }
            }
        }
    }

    fn open(&self, entry: &mut CircuitBreakerState, now: Instant) {
        entry.state = CircuitState::Open;
        entry.last_failure_time = Some(now);
        entry.next_retry_time = Some(now + self.config.recovery_timeout);
    }

    /// The bookkeeping of one endpoint (closed and zeroed if never seen).
    pub fn state(&self, endpoint: &str) -> CircuitBreakerState {
        self.endpoints
            .get(endpoint)
            .map(|entry| entry.clone())
            .unwrap_or_default()
    }

    /// Snapshot of every tracked endpoint.
    pub fn stats(&self) -> HashMap<String, CircuitBreakerState> {
        self.endpoints
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Returns every endpoint to closed.
    pub fn reset(&self) {
        self.endpoints.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const EP: &str = "GET /api/users";

    fn breaker(threshold: u32, recovery_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            enabled: true,
            failure_threshold: threshold,
            recovery_timeout: Duration::from_millis(recovery_ms),
            monitoring_period: Duration::from_secs(60),
        })
    }

    #[test]
    fn test_opens_at_threshold() {
        let cb = breaker(3, 60_000);
        assert!(!cb.on_failure(EP));
        assert!(!cb.on_failure(EP));
        assert!(cb.can_execute(EP));
        assert!(cb.on_failure(EP));
        assert!(!cb.can_execute(EP));
        assert_eq!(cb.state(EP).state, CircuitState::Open);
    }

    #[test]
    fn test_half_open_probe_then_close() {
        let cb = breaker(3, 30);
        for _ in 0..3 {
            cb.on_failure(EP);
        }
        assert!(!cb.can_execute(EP));

        std::thread::sleep(Duration::from_millis(40));
        assert!(cb.can_execute(EP));
        assert_eq!(cb.state(EP).state, CircuitState::HalfOpen);
        // Only one probe per window.
        assert!(!cb.can_execute(EP));

        cb.on_success(EP);
        let state = cb.state(EP);
        assert_eq!(state.state, CircuitState::Closed);
        assert_eq!(state.failure_count, 0);
        assert!(cb.can_execute(EP));
    }

    #[test]
    fn test_failed_probe_reopens() {
        let cb = breaker(1, 30);
        assert!(cb.on_failure(EP));
        std::thread::sleep(Duration::from_millis(40));
        assert!(cb.can_execute(EP));
        assert!(cb.on_failure(EP));
        assert!(!cb.can_execute(EP));
        assert_eq!(cb.state(EP).state, CircuitState::Open);
    }

    #[test]
    fn test_unused_half_open_slot_is_released() {
        let cb = breaker(1, 30);
        cb.on_failure(EP);
        assert_eq!(cb.acquire(EP), CircuitPermit::Refused);

        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(cb.acquire(EP), CircuitPermit::Probe);
        assert_eq!(cb.acquire(EP), CircuitPermit::Refused);

        cb.release_probe(EP);
        assert_eq!(cb.state(EP).state, CircuitState::Open);
        assert_eq!(cb.acquire(EP), CircuitPermit::Probe);

        // Releasing a closed breaker changes nothing.
        cb.on_success(EP);
        cb.release_probe(EP);
        assert_eq!(cb.acquire(EP), CircuitPermit::Closed);
    }

    #[test]
    fn test_snapshot_reports_retry_deadline() {
        let cb = breaker(2, 60_000);
        cb.on_failure(EP);
        let closed = cb.state(EP).snapshot(Instant::now());
        assert_eq!(closed.state, CircuitState::Closed);
        assert_eq!(closed.failure_count, 1);
        assert_eq!(closed.retry_in_ms, None);

        cb.on_failure(EP);
        let open = cb.state(EP).snapshot(Instant::now());
        assert_eq!(open.state, CircuitState::Open);
        assert_eq!(open.failure_count, 2);
        assert!(open.retry_in_ms.is_some_and(|ms| ms > 59_000 && ms <= 60_000));

        let json = serde_json::to_value(open).unwrap();
        assert_eq!(json["state"], "OPEN");
        assert_eq!(json["failure_count"], 2);
    }

    #[test]
    fn test_endpoints_are_independent() {
        let cb = breaker(1, 60_000);
        cb.on_failure(EP);
        assert!(!cb.can_execute(EP));
        assert!(cb.can_execute("POST /api/users"));
        assert_eq!(cb.stats().len(), 1);
    }

    #[test]
    fn test_stale_failures_restart_count() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig {
            enabled: true,
            failure_threshold: 2,
            recovery_timeout: Duration::from_secs(60),
            monitoring_period: Duration::from_millis(20),
        });
        cb.on_failure(EP);
        std::thread::sleep(Duration::from_millis(30));
        assert!(!cb.on_failure(EP));
        assert_eq!(cb.state(EP).failure_count, 1);
    }

    #[test]
    fn test_reset_and_disabled() {
        let cb = breaker(1, 60_000);
        cb.on_failure(EP);
        cb.reset();
        assert!(cb.can_execute(EP));
        assert!(cb.stats().is_empty());

        let disabled = CircuitBreaker::new(CircuitBreakerConfig {
            enabled: false,
            ..CircuitBreakerConfig::default()
        });
        for _ in 0..10 {
            assert!(!disabled.on_failure(EP));
        }
        assert!(disabled.can_execute(EP));
    }
}
