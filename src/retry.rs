//! Retry classification and backoff.
//!
//! [`RetryManager`] answers two questions for the response path: should this
//! failure be retried, and how long to wait first. Classification goes
//! through a [`RetryPredicate`] so callers can narrow or widen it; the default
//! retries exactly the failures [`crate::ApiError::is_retryable`] accepts.

use crate::config::RetryConfig;
use crate::Error;
use rand::Rng;
use std::time::Duration;

/// Trait for determining whether a failed request should be retried.
///
/// # Examples
///
/// ```
/// use palisade::{Error, RetryPredicate};
///
/// struct RetryOnlyUnavailable;
///
/// impl RetryPredicate for RetryOnlyUnavailable {
///     fn should_retry(&self, error: &Error, _attempt: u32) -> bool {
///         error.status().is_some_and(|s| s.as_u16() == 503)
///     }
/// }
/// ```
pub trait RetryPredicate: Send + Sync {
    /// `attempt` is the number of retries already made (0 after the first failure).
    fn should_retry(&self, error: &Error, attempt: u32) -> bool;
}

/// Retry all errors that are marked as retryable: no response, 5xx, 408, 429.
#[derive(Debug, Clone, Copy)]
pub struct RetryOnRetryable;

impl RetryPredicate for RetryOnRetryable {
    fn should_retry(&self, error: &Error, _attempt: u32) -> bool {
        error.is_retryable()
    }
}

/// Combine multiple retry predicates with OR logic.
pub struct OrPredicate {
    predicates: Vec<Box<dyn RetryPredicate>>,
}

impl OrPredicate {
    pub fn new(predicates: Vec<Box<dyn RetryPredicate>>) -> Self {
        Self { predicates }
    }
}

impl RetryPredicate for OrPredicate {
    fn should_retry(&self, error: &Error, attempt: u32) -> bool {
        self.predicates
            .iter()
            .any(|p| p.should_retry(error, attempt))
    }
}

/// Decides retry eligibility and computes backoff delays.
pub struct RetryManager {
    config: RetryConfig,
    predicate: Box<dyn RetryPredicate>,
}

impl RetryManager {
    pub fn new(config: RetryConfig) -> Self {
        Self::with_predicate(config, Box::new(RetryOnRetryable))
    }

    pub fn with_predicate(config: RetryConfig, predicate: Box<dyn RetryPredicate>) -> Self {
        Self { config, predicate }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Whether `error` should be retried after `attempt` retries.
    ///
    /// Always `false` once `attempt >= max_attempts`, and for errors the
    /// predicate rejects.
    pub fn should_retry(&self, error: &Error, attempt: u32) -> bool {
        self.config.enabled
            && attempt < self.config.max_attempts
            && self.predicate.should_retry(error, attempt)
    }

    /// `min(base_delay * backoff_factor^attempt, max_delay)`.
    ///
    /// With `use_jitter` the result is drawn uniformly from half to one and a
    /// half times that value.
    ///
    /// ```
    /// use palisade::config::RetryConfig;
    /// use palisade::retry::RetryManager;
    /// use std::time::Duration;
    ///
    /// let retry = RetryManager::new(RetryConfig {
    ///     base_delay: Duration::from_millis(100),
    ///     max_delay: Duration::from_millis(1000),
    ///     backoff_factor: 2.0,
    ///     ..RetryConfig::default()
    /// });
    ///
    /// assert_eq!(retry.calculate_delay(0, false), Duration::from_millis(100));
    /// assert_eq!(retry.calculate_delay(2, false), Duration::from_millis(400));
    /// assert_eq!(retry.calculate_delay(10, false), Duration::from_millis(1000));
    /// ```
    pub fn calculate_delay(&self, attempt: u32, use_jitter: bool) -> Duration {
        let base_ms = self.config.base_delay.as_millis() as f64;
        let max_ms = self.config.max_delay.as_millis() as f64;
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let delay_ms = (base_ms * self.config.backoff_factor.powi(exponent)).min(max_ms);

        let delay_ms = if use_jitter {
            delay_ms * rand::thread_rng().gen_range(0.5..=1.5)
        } else {
            delay_ms
        };
        Duration::from_millis(delay_ms.round() as u64)
    }

    /// Delay before retrying `error`: the server's rate limit hint when one is
    /// present and honoured (capped at `max_delay`), the backoff schedule
    /// otherwise.
    pub fn delay_for(&self, error: &Error, attempt: u32) -> Duration {
        if self.config.respect_retry_after {
            if let Some(delay) = error
                .rate_limit_info()
                .and_then(|info| info.delay(self.config.max_delay))
            {
                return delay;
            }
        }
        self.calculate_delay(attempt, self.config.jitter)
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }
}
