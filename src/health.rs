//! Synthetic health checks.
//!
//! # Responsibilities
//! - Periodically probe `<endpoint>/health` for every configured endpoint
//! - Aggregate the results into one [`HealthState`]
//! - Attach current metrics and circuit breaker states to each snapshot

use crate::circuit_breaker::{CircuitBreaker, CircuitSnapshot};
use crate::config::HealthConfig;
use crate::metrics::{MetricsCollector, PerformanceMetrics};
use crate::signer::unix_millis;
use crate::task::ScheduledTask;
use crate::Result;
use futures_util::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointStatus {
    Up,
    Down,
}

#[derive(Debug, Clone, Serialize)]
pub struct EndpointHealth {
    pub endpoint: String,
    pub status: EndpointStatus,
    /// Probe round trip in milliseconds.
    pub response_time: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub status: HealthState,
    pub endpoints: Vec<EndpointHealth>,
    /// Milliseconds since the Unix epoch.
    pub checked_at: u64,
    pub metrics: PerformanceMetrics,
    pub circuit_breakers: HashMap<String, CircuitSnapshot>,
}

pub type HealthCallback = Arc<dyn Fn(&HealthStatus) + Send + Sync>;

/// Aggregates probe results.
///
/// ```
/// use palisade::health::{overall_status, HealthState};
///
/// assert_eq!(overall_status(4, 5, 80.0, 50.0), HealthState::Healthy);
/// assert_eq!(overall_status(3, 5, 80.0, 50.0), HealthState::Degraded);
/// assert_eq!(overall_status(2, 5, 80.0, 50.0), HealthState::Unhealthy);
/// assert_eq!(overall_status(0, 0, 80.0, 50.0), HealthState::Healthy);
/// ```
pub fn overall_status(up: usize, total: usize, healthy: f64, unhealthy: f64) -> HealthState {
    if total == 0 {
        return HealthState::Healthy;
    }
    let percent = up as f64 / total as f64 * 100.0;
    if percent >= healthy {
        HealthState::Healthy
    } else if percent >= unhealthy {
        HealthState::Degraded
    } else {
        HealthState::Unhealthy
    }
}

pub struct HealthChecker {
    config: HealthConfig,
    targets: Vec<(String, Url)>,
    client: reqwest::Client,
    metrics: Arc<MetricsCollector>,
    breaker: Arc<CircuitBreaker>,
    last: RwLock<Option<HealthStatus>>,
    callbacks: Mutex<Vec<HealthCallback>>,
    shutdown: CancellationToken,
    task: Mutex<Option<ScheduledTask>>,
}

impl HealthChecker {
    /// Creates the checker and, when enabled, starts checking immediately and
    /// then every `interval`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidUrl`] if an endpoint is not a valid URL.
    pub fn spawn(
        config: HealthConfig,
        client: reqwest::Client,
        metrics: Arc<MetricsCollector>,
        breaker: Arc<CircuitBreaker>,
    ) -> Result<Arc<Self>> {
        let targets = config
            .endpoints
            .iter()
            .map(|endpoint| -> Result<(String, Url)> {
                let url = Url::parse(&format!("{}/health", endpoint.trim_end_matches('/')))?;
                Ok((endpoint.clone(), url))
            })
            .collect::<Result<Vec<_>>>()?;

        let checker = Arc::new(Self {
            config,
            targets,
            client,
            metrics,
            breaker,
            last: RwLock::new(None),
            callbacks: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
            task: Mutex::new(None),
        });

        if checker.config.enabled {
            let weak = Arc::downgrade(&checker);
            let interval = checker.config.interval;
            let task = ScheduledTask::spawn(
                "health-check",
                checker.shutdown.child_token(),
                move |token| run(weak, interval, token),
            );
            *checker.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
            tracing::info!(
                endpoints = checker.targets.len(),
                interval_ms = interval.as_millis() as u64,
                "Health checker started"
            );
        }
        Ok(checker)
    }

    /// Probes every endpoint now and publishes the result.
    pub async fn force_health_check(&self) -> HealthStatus {
        let probes = self
            .targets
            .iter()
            .map(|(name, url)| self.probe(name, url));
        let endpoints = join_all(probes).await;

        let up = endpoints
            .iter()
            .filter(|e| e.status == EndpointStatus::Up)
            .count();
        let status = HealthStatus {
            status: overall_status(
                up,
                endpoints.len(),
                self.config.healthy_threshold,
                self.config.unhealthy_threshold,
            ),
            endpoints,
            checked_at: unix_millis(),
            metrics: self.metrics.metrics(),
            circuit_breakers: self
                .breaker
                .stats()
                .into_iter()
                .map(|(endpoint, state)| (endpoint, state.snapshot(Instant::now())))
                .collect(),
        };

        tracing::debug!(status = ?status.status, up, total = status.endpoints.len(), "Health check complete");
        *self.last.write().unwrap_or_else(PoisonError::into_inner) = Some(status.clone());
        self.notify(&status);
        status
    }

    async fn probe(&self, name: &str, url: &Url) -> EndpointHealth {
        let token = self.shutdown.child_token();
        let timer = {
            let token = token.clone();
            let timeout = self.config.timeout;
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                token.cancel();
            })
        };

        let started = Instant::now();
        let outcome = tokio::select! {
            _ = token.cancelled() => Err(if self.shutdown.is_cancelled() {
                "cancelled".to_string()
            } else {
                format!("timed out after {}ms", self.config.timeout.as_millis())
            }),
            response = self.client.get(url.clone()).send() => match response {
                Ok(response) if response.status().is_success() => Ok(()),
                Ok(response) => Err(format!("status {}", response.status())),
                Err(e) => Err(e.to_string()),
            },
        };
        timer.abort();

        let response_time = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(()) => EndpointHealth {
                endpoint: name.to_string(),
                status: EndpointStatus::Up,
                response_time,
                error: None,
            },
            Err(error) => {
                tracing::warn!(endpoint = %name, error = %error, "Health probe failed");
                EndpointHealth {
                    endpoint: name.to_string(),
                    status: EndpointStatus::Down,
                    response_time,
                    error: Some(error),
                }
            }
        }
    }

    fn notify(&self, status: &HealthStatus) {
        let callbacks = self
            .callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(status))).is_err() {
                tracing::error!("Health check callback panicked");
            }
        }
    }

    /// The latest snapshot, if a check has completed.
    pub fn status(&self) -> Option<HealthStatus> {
        self.last
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Registers a callback run after every check.
    pub fn on_check(&self, callback: impl Fn(&HealthStatus) + Send + Sync + 'static) {
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(callback));
    }

    /// Stops periodic checks, cancels probes in flight and drops callbacks.
    pub fn destroy(&self) {
        self.shutdown.cancel();
        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        drop(task);
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

async fn run(checker: Weak<HealthChecker>, interval: Duration, token: CancellationToken) {
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some(checker) = checker.upgrade() else {
            break;
        };
        checker.force_health_check().await;
    }
    tracing::info!("Health checker stopped");
}
