//! Terminal failure handling.
//!
//! Once the response path has decided a failure will not be retried, the
//! [`ErrorHandler`] turns it into exactly one [`ApiError`], logs it, tells the
//! configured [`Notifier`] and records a security event where the failure
//! has security relevance. It never retries anything itself.

use crate::error::{ApiError, ErrorKind};
use crate::logging::{LogLevel, Logger};
use crate::rate_limit::RateLimitInfo;
use crate::security::{SecurityEvent, SecurityEventKind, SecurityEventSink, Severity};
use http::{HeaderMap, StatusCode};
use serde_json::json;
use std::sync::Arc;

/// A failure as observed on the wire, before classification.
#[derive(Debug, Clone)]
pub enum TransportFailure {
    /// No response arrived.
    NoResponse { message: String, timed_out: bool },
    /// A non-2xx response arrived.
    Status {
        status: StatusCode,
        body: String,
        headers: HeaderMap,
    },
}

impl TransportFailure {
    pub fn from_reqwest(error: &reqwest::Error) -> Self {
        TransportFailure::NoResponse {
            message: error.to_string(),
            timed_out: error.is_timeout(),
        }
    }

    pub fn status(&self) -> Option<StatusCode> {
        match self {
            TransportFailure::Status { status, .. } => Some(*status),
            TransportFailure::NoResponse { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationLevel {
    Error,
    Warning,
}

/// A user-facing message about a failed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub level: NotificationLevel,
    pub title: String,
    pub description: String,
    pub correlation_id: Option<String>,
}

/// Surfaces notifications to whoever is watching.
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: &Notification);
}

/// Writes notifications to the `tracing` output.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, notification: &Notification) {
        let correlation_id = notification.correlation_id.as_deref().unwrap_or("-");
        match notification.level {
            NotificationLevel::Error => tracing::error!(
                correlation_id,
                title = %notification.title,
                "{}",
                notification.description
            ),
            NotificationLevel::Warning => tracing::warn!(
                correlation_id,
                title = %notification.title,
                "{}",
                notification.description
            ),
        }
    }
}

pub struct ErrorHandler {
    notifier: Arc<dyn Notifier>,
    sink: SecurityEventSink,
    logger: Arc<Logger>,
}

impl ErrorHandler {
    pub fn new(notifier: Arc<dyn Notifier>, sink: SecurityEventSink, logger: Arc<Logger>) -> Self {
        Self {
            notifier,
            sink,
            logger,
        }
    }

    /// Classifies a failure without side effects.
    ///
    /// ```
    /// use palisade::error_handler::{ErrorHandler, TransportFailure};
    /// use palisade::ErrorKind;
    /// use http::{HeaderMap, StatusCode};
    ///
    /// let failure = TransportFailure::Status {
    ///     status: StatusCode::FORBIDDEN,
    ///     body: String::new(),
    ///     headers: HeaderMap::new(),
    /// };
    /// let error = ErrorHandler::classify(&failure, Some("abc"));
    /// assert_eq!(error.kind, ErrorKind::Authorization);
    /// assert_eq!(error.correlation_id.as_deref(), Some("abc"));
    /// ```
    pub fn classify(failure: &TransportFailure, correlation_id: Option<&str>) -> ApiError {
        let error = match failure {
            TransportFailure::NoResponse { message, timed_out } => {
                let kind = if *timed_out {
                    ErrorKind::Timeout
                } else {
                    ErrorKind::Network
                };
                ApiError::new(kind, message.clone())
            }
            TransportFailure::Status {
                status,
                body,
                headers,
            } => {
                let error = ApiError::from_status(*status, body.clone());
                if *status == StatusCode::TOO_MANY_REQUESTS {
                    error.with_rate_limit(RateLimitInfo::from_response_headers(headers))
                } else {
                    error
                }
            }
        };
        match correlation_id {
            Some(id) => error.with_correlation_id(id),
            None => error,
        }
    }

    /// Classifies `failure` and reports it.
    pub fn handle(
        &self,
        failure: &TransportFailure,
        endpoint: &str,
        correlation_id: Option<&str>,
    ) -> ApiError {
        self.report(Self::classify(failure, correlation_id), endpoint)
    }

    /// Logs through the application logger (so the entry is shipped with
    /// its correlation id), notifies and records security relevance of an already
    /// classified error, then hands it back.
    pub fn report(&self, error: ApiError, endpoint: &str) -> ApiError {
        let status = error.status.map(|s| s.as_u16());
        let level = match error.kind {
            ErrorKind::Network | ErrorKind::Server => LogLevel::Error,
            ErrorKind::Http if status.is_some_and(|s| s >= 500) => LogLevel::Error,
            _ => LogLevel::Warn,
        };
        self.logger.log(
            level,
            &error.message,
            error.correlation_id.as_deref(),
            Some(json!({
                "endpoint": endpoint,
                "status": status,
                "code": error.code,
            })),
        );

        self.notifier.notify(&Self::notification_for(&error));
        if let Some(event) = Self::security_event_for(&error, endpoint) {
            self.sink.emit(event);
        }
        error
    }

    pub fn notification_for(error: &ApiError) -> Notification {
        let (level, title, description) = match error.kind {
            ErrorKind::Network => (
                NotificationLevel::Error,
                "Connection problem",
                "The server could not be reached. Check your connection and try again.",
            ),
            ErrorKind::Timeout => (
                NotificationLevel::Warning,
                "Request timed out",
                "The server took too long to respond.",
            ),
            ErrorKind::RateLimit => (
                NotificationLevel::Warning,
                "Too many requests",
                "Please wait a moment before trying again.",
            ),
            ErrorKind::Authentication => (
                NotificationLevel::Error,
                "Authentication required",
                "Your session has expired. Please sign in again.",
            ),
            ErrorKind::Authorization => (
                NotificationLevel::Error,
                "Access denied",
                "You do not have permission to perform this action.",
            ),
            ErrorKind::Validation => (
                NotificationLevel::Warning,
                "Invalid request",
                error.message.as_str(),
            ),
            ErrorKind::Server => (
                NotificationLevel::Error,
                "Server error",
                "Something went wrong on our side. Please try again later.",
            ),
            ErrorKind::CircuitOpen => (
                NotificationLevel::Warning,
                "Service temporarily unavailable",
                "Requests to this service are paused after repeated failures.",
            ),
            ErrorKind::Http => (
                NotificationLevel::Warning,
                "Request failed",
                error.message.as_str(),
            ),
        };
        Notification {
            level,
            title: title.to_string(),
            description: description.to_string(),
            correlation_id: error.correlation_id.clone(),
        }
    }

    /// 401/403 are high severity, 429 and 5xx medium, no response low.
    /// Other failures carry no security relevance.
    pub fn security_event_for(error: &ApiError, endpoint: &str) -> Option<SecurityEvent> {
        let status = error.status.map(|s| s.as_u16());
        let (kind, severity) = match (error.kind, status) {
            (ErrorKind::Authentication, Some(status)) => {
                (SecurityEventKind::AuthenticationFailure { status }, Severity::High)
            }
            (ErrorKind::Authorization, Some(status)) => {
                (SecurityEventKind::AuthorizationFailure { status }, Severity::High)
            }
            (ErrorKind::RateLimit, _) => (
                SecurityEventKind::RateLimited {
                    retry_after_ms: error
                        .rate_limit
                        .as_ref()
                        .and_then(|info| info.retry_after)
                        .map(|d| d.as_millis() as u64),
                },
                Severity::Medium,
            ),
            (_, Some(status)) if status >= 500 => {
                (SecurityEventKind::ServerError { status }, Severity::Medium)
            }
            (ErrorKind::Network | ErrorKind::Timeout, None) => (
                SecurityEventKind::NetworkFailure {
                    message: error.message.clone(),
                },
                Severity::Low,
            ),
            _ => return None,
        };

        let event = SecurityEvent::new(kind, severity).with_endpoint(endpoint);
        Some(match &error.correlation_id {
            Some(id) => event.with_correlation_id(id.clone()),
            None => event,
        })
    }
}
