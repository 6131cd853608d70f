//! Shared pipeline state.
//!
//! One [`PipelineContext`] is built per [`crate::Client`] and owns every
//! component the interceptors consult, together with the background tasks
//! that keep logs shipped and security events recorded.

use crate::cache::RequestCache;
use crate::circuit_breaker::CircuitBreaker;
use crate::config::PipelineConfig;
use crate::csrf::CsrfProtection;
use crate::dedup::RequestDeduplication;
use crate::error_handler::{ErrorHandler, Notifier, TracingNotifier};
use crate::health::HealthChecker;
use crate::logging::{HttpLogShipper, LogBuffer, LogLevel, LogShipper, Logger};
use crate::metrics::MetricsCollector;
use crate::response::RawResponse;
use crate::retry::{RetryManager, RetryPredicate};
use crate::sanitizer::DataSanitizer;
use crate::security::{SecurityEventSink, SecurityLogger};
use crate::signer::RequestSigner;
use crate::task::ScheduledTask;
use crate::Result;
use std::sync::{Arc, Mutex, PoisonError};

/// Optional collaborators supplied by the builder.
#[derive(Default)]
pub(crate) struct ContextParts {
    pub retry_predicate: Option<Box<dyn RetryPredicate>>,
    pub notifier: Option<Arc<dyn Notifier>>,
    pub log_shipper: Option<Arc<dyn LogShipper>>,
}

pub struct PipelineContext {
    pub config: PipelineConfig,
    pub cache: RequestCache<RawResponse>,
    pub dedup: RequestDeduplication<Result<RawResponse>>,
    pub circuit_breaker: Arc<CircuitBreaker>,
    pub retry: RetryManager,
    pub metrics: Arc<MetricsCollector>,
    pub sanitizer: DataSanitizer,
    pub signer: Option<RequestSigner>,
    pub csrf: Option<CsrfProtection>,
    pub error_handler: ErrorHandler,
    pub logger: Arc<Logger>,
    pub security: Arc<SecurityLogger>,
    pub events: SecurityEventSink,
    pub health: Arc<HealthChecker>,
    tasks: Mutex<Vec<ScheduledTask>>,
}

impl PipelineContext {
    /// Builds every component and starts the background tasks.
    ///
    /// Must be called within a Tokio runtime.
    pub(crate) fn new(
        config: PipelineConfig,
        http: reqwest::Client,
        parts: ContextParts,
    ) -> Result<Self> {
        let security_config = &config.security;
        let monitoring = &config.monitoring;

        let signer = if security_config.enable_request_signing {
            let secret = security_config.signing_secret.as_deref().unwrap_or_default();
            Some(
                RequestSigner::new(secret, security_config.signature_algorithm)?
                    .with_tolerance(security_config.signature_tolerance),
            )
        } else {
            None
        };
        let csrf = security_config
            .enable_csrf
            .then(|| CsrfProtection::new(security_config.csrf_endpoint.clone()));

        let shipper = match (parts.log_shipper, &monitoring.log_endpoint) {
            (Some(shipper), _) => Some(shipper),
            (None, Some(endpoint)) => {
                Some(Arc::new(HttpLogShipper::new(http.clone(), endpoint)?) as Arc<dyn LogShipper>)
            }
            (None, None) => None,
        };
        let buffer = Arc::new(LogBuffer::new(monitoring.log_batch_size, shipper));
        let logger = Arc::new(Logger::new(
            monitoring.log_level,
            monitoring.enable_logging,
            Arc::clone(&buffer),
        ));

        let (security, events, security_task) =
            SecurityLogger::spawn(monitoring, Arc::clone(&buffer));

        let metrics = Arc::new(if monitoring.enable_metrics {
            MetricsCollector::new()
        } else {
            MetricsCollector::disabled()
        });
        let circuit_breaker = Arc::new(CircuitBreaker::new(config.circuit_breaker.clone()));
        let health = HealthChecker::spawn(
            config.health.clone(),
            http,
            Arc::clone(&metrics),
            Arc::clone(&circuit_breaker),
        )?;

        let retry = match parts.retry_predicate {
            Some(predicate) => RetryManager::with_predicate(config.retries.clone(), predicate),
            None => RetryManager::new(config.retries.clone()),
        };
        let notifier = parts
            .notifier
            .unwrap_or_else(|| Arc::new(TracingNotifier) as Arc<dyn Notifier>);

        let mut tasks = vec![security_task];
        if monitoring.enable_metrics && monitoring.enable_logging {
            let metrics = Arc::clone(&metrics);
            let logger = Arc::clone(&logger);
            tasks.push(ScheduledTask::every(
                "metrics-report",
                monitoring.metrics_interval,
                move || {
                    let snapshot = metrics.metrics();
                    let logger = Arc::clone(&logger);
                    async move {
                        if snapshot.total_requests > 0 {
                            logger.log(
                                LogLevel::Info,
                                "Performance metrics",
                                None,
                                serde_json::to_value(&snapshot).ok(),
                            );
                        }
                    }
                },
            ));
        }
        tasks.push(buffer.spawn_flusher(monitoring.log_flush_interval));

        Ok(Self {
            cache: RequestCache::new(config.cache.max_size),
            dedup: RequestDeduplication::new(),
            circuit_breaker,
            retry,
            metrics,
            sanitizer: DataSanitizer::from_config(&config.security),
            signer,
            csrf,
            error_handler: ErrorHandler::new(notifier, events.clone(), Arc::clone(&logger)),
            logger,
            security,
            events,
            health,
            tasks: Mutex::new(tasks),
            config,
        })
    }

    /// Stops health checks, drains queued security events and ships the
    /// remaining logs.
    pub async fn shutdown(&self) {
        self.health.destroy();
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            task.shutdown().await;
        }
        tracing::info!("Pipeline shut down");
    }
}

impl Drop for PipelineContext {
    fn drop(&mut self) {
        self.health.destroy();
    }
}
