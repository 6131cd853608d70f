//! Pipeline configuration.
//!
//! Every section can be toggled on its own. Durations are expressed in
//! milliseconds when deserialized.
//!
//! ```
//! use palisade::config::PipelineConfig;
//!
//! let config = PipelineConfig::from_json(r#"{
//!     "base_url": "https://api.example.com",
//!     "retries": { "max_attempts": 5, "base_delay": 200 },
//!     "cache": { "enabled": false }
//! }"#).unwrap();
//!
//! assert_eq!(config.retries.max_attempts, 5);
//! assert!(!config.cache.enabled);
//! assert!(config.circuit_breaker.enabled);
//! ```

use crate::logging::LogLevel;
use crate::signer::SignatureAlgorithm;
use crate::{Error, Result};
use serde::Deserialize;
use std::time::Duration;

/// Top-level configuration of the request pipeline.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Base URL every request path is resolved against.
    pub base_url: Option<String>,
    /// Per-attempt request timeout.
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
    pub retries: RetryConfig,
    pub cache: CacheConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub security: SecurityConfig,
    pub monitoring: MonitoringConfig,
    pub health: HealthConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout: Duration::from_secs(30),
            retries: RetryConfig::default(),
            cache: CacheConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            security: SecurityConfig::default(),
            monitoring: MonitoringConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Parses a JSON document; missing keys keep their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::ConfigurationError(format!("Invalid pipeline config: {}", e)))
    }

    /// Checks cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigurationError`] describing the first violation.
    pub fn validate(&self) -> Result<()> {
        if self.cache.enabled && self.cache.max_size == 0 {
            return Err(config_error("cache.max_size must be at least 1"));
        }
        if self.circuit_breaker.enabled && self.circuit_breaker.failure_threshold == 0 {
            return Err(config_error("circuit_breaker.failure_threshold must be at least 1"));
        }
        let factor = self.retries.backoff_factor;
        if factor.is_nan() || factor < 1.0 {
            return Err(config_error("retries.backoff_factor must be >= 1.0"));
        }
        if self.retries.base_delay > self.retries.max_delay {
            return Err(config_error("retries.base_delay must not exceed retries.max_delay"));
        }
        if self.security.enable_request_signing
            && self.security.signing_secret.as_deref().map_or(true, str::is_empty)
        {
            return Err(config_error(
                "security.signing_secret is required when request signing is enabled",
            ));
        }
        let health = &self.health;
        if !(0.0..=100.0).contains(&health.healthy_threshold)
            || !(0.0..=100.0).contains(&health.unhealthy_threshold)
            || health.unhealthy_threshold > health.healthy_threshold
        {
            return Err(config_error(
                "health thresholds must be percentages with unhealthy <= healthy",
            ));
        }
        Ok(())
    }
}

fn config_error(message: &str) -> Error {
    Error::ConfigurationError(message.to_string())
}

/// Retry behaviour for retryable failures.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub enabled: bool,
    /// Number of retries after the first attempt.
    pub max_attempts: u32,
    #[serde(with = "duration_ms")]
    pub base_delay: Duration,
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,
    pub backoff_factor: f64,
    /// Randomize delays so concurrent clients do not retry in lockstep.
    pub jitter: bool,
    /// Prefer the server's `Retry-After` hint when one is present.
    pub respect_retry_after: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            jitter: true,
            respect_retry_after: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    #[serde(with = "duration_ms")]
    pub default_ttl: Duration,
    pub max_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_ttl: Duration::from_secs(300),
            max_size: 100,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub enabled: bool,
    /// Consecutive failures (within `monitoring_period`) that open the circuit.
    pub failure_threshold: u32,
    /// How long an open circuit rejects calls before admitting a probe.
    #[serde(with = "duration_ms")]
    pub recovery_timeout: Duration,
    /// Failures further apart than this restart the count.
    #[serde(with = "duration_ms")]
    pub monitoring_period: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            monitoring_period: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub enable_request_signing: bool,
    pub enable_csrf: bool,
    pub enable_sanitization: bool,
    pub signature_algorithm: SignatureAlgorithm,
    /// Shared HMAC secret. Required when signing is enabled.
    pub signing_secret: Option<String>,
    /// Accepted clock skew when verifying signatures.
    #[serde(with = "duration_ms")]
    pub signature_tolerance: Duration,
    /// Path of the endpoint that issues CSRF tokens.
    pub csrf_endpoint: String,
    /// Largest serialized request body, in bytes.
    pub max_request_size: usize,
    /// Deepest nesting the sanitizer walks before truncating.
    pub max_sanitize_depth: usize,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            enable_request_signing: false,
            enable_csrf: false,
            enable_sanitization: true,
            signature_algorithm: SignatureAlgorithm::default(),
            signing_secret: None,
            signature_tolerance: Duration::from_secs(300),
            csrf_endpoint: "/api/csrf-token".to_string(),
            max_request_size: 10 * 1024 * 1024,
            max_sanitize_depth: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub enable_metrics: bool,
    pub enable_logging: bool,
    pub log_level: LogLevel,
    /// How often a metrics summary is logged.
    #[serde(with = "duration_ms")]
    pub metrics_interval: Duration,
    /// Remote collector receiving batched log and security records.
    pub log_endpoint: Option<String>,
    pub log_batch_size: usize,
    #[serde(with = "duration_ms")]
    pub log_flush_interval: Duration,
    /// High-severity security events within `alert_window` that raise an alert.
    pub alert_threshold: usize,
    #[serde(with = "duration_ms")]
    pub alert_window: Duration,
    /// Security events retained for [`crate::Client::security_events`].
    pub security_event_capacity: usize,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enable_metrics: true,
            enable_logging: true,
            log_level: LogLevel::Info,
            metrics_interval: Duration::from_secs(60),
            log_endpoint: None,
            log_batch_size: 50,
            log_flush_interval: Duration::from_secs(5),
            alert_threshold: 5,
            alert_window: Duration::from_secs(300),
            security_event_capacity: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub enabled: bool,
    /// Base URLs; each is probed at `<endpoint>/health`.
    pub endpoints: Vec<String>,
    #[serde(with = "duration_ms")]
    pub interval: Duration,
    /// Per-probe timeout.
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
    /// Percentage of endpoints up at or above which the system is healthy.
    pub healthy_threshold: f64,
    /// Percentage at or above which the system is degraded rather than unhealthy.
    pub unhealthy_threshold: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoints: Vec::new(),
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
            healthy_threshold: 80.0,
            unhealthy_threshold: 50.0,
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
