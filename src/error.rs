//! Error types for pipeline calls.
//!
//! Failures observed on the wire are classified into an [`ErrorKind`] and
//! carried as an [`ApiError`], which keeps the status, the raw response body,
//! the correlation id of the request and the moment the error was produced.
//! Failures raised locally (bad configuration, unserializable bodies, payloads
//! rejected before dispatch) are separate [`Error`] variants.

use crate::rate_limit::RateLimitInfo;
use http::StatusCode;
use std::fmt;
use std::time::SystemTime;

/// Status-derived classification of a failed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// No response was received (connection refused, DNS failure, reset).
    Network,
    /// `408 Request Timeout`, or the client-side timeout elapsed.
    Timeout,
    /// `429 Too Many Requests`.
    RateLimit,
    /// `401 Unauthorized`.
    Authentication,
    /// `403 Forbidden`.
    Authorization,
    /// `422 Unprocessable Entity`.
    Validation,
    /// `500`, `502`, `503` or `504`.
    Server,
    /// Raised locally because the endpoint's circuit breaker is open.
    CircuitOpen,
    /// Any other non-2xx status.
    Http,
}

impl ErrorKind {
    /// Classifies an HTTP status code.
    ///
    /// ```
    /// use palisade::ErrorKind;
    /// use http::StatusCode;
    ///
    /// assert_eq!(ErrorKind::from_status(StatusCode::TOO_MANY_REQUESTS), ErrorKind::RateLimit);
    /// assert_eq!(ErrorKind::from_status(StatusCode::BAD_GATEWAY), ErrorKind::Server);
    /// assert_eq!(ErrorKind::from_status(StatusCode::NOT_FOUND), ErrorKind::Http);
    /// ```
    pub fn from_status(status: StatusCode) -> Self {
        match status.as_u16() {
            401 => ErrorKind::Authentication,
            403 => ErrorKind::Authorization,
            408 => ErrorKind::Timeout,
            422 => ErrorKind::Validation,
            429 => ErrorKind::RateLimit,
            500 | 502 | 503 | 504 => ErrorKind::Server,
            _ => ErrorKind::Http,
        }
    }

    /// Stable machine-readable code for this kind.
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::Network => "NETWORK_ERROR",
            ErrorKind::Timeout => "TIMEOUT_ERROR",
            ErrorKind::RateLimit => "RATE_LIMIT_ERROR",
            ErrorKind::Authentication => "AUTHENTICATION_ERROR",
            ErrorKind::Authorization => "AUTHORIZATION_ERROR",
            ErrorKind::Validation => "VALIDATION_ERROR",
            ErrorKind::Server => "SERVER_ERROR",
            ErrorKind::CircuitOpen => "CIRCUIT_BREAKER_OPEN",
            ErrorKind::Http => "HTTP_ERROR",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Network => "Network error",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::RateLimit => "Rate limited",
            ErrorKind::Authentication => "Authentication failed",
            ErrorKind::Authorization => "Authorization failed",
            ErrorKind::Validation => "Validation failed",
            ErrorKind::Server => "Server error",
            ErrorKind::CircuitOpen => "Circuit breaker open",
            ErrorKind::Http => "HTTP error",
        };
        f.write_str(name)
    }
}

/// A classified failure of a dispatched (or refused) request.
#[derive(thiserror::Error, Debug, Clone)]
#[error("{kind} [{code}]: {message}")]
pub struct ApiError {
    /// The classification of the failure.
    pub kind: ErrorKind,
    /// Human-readable description.
    pub message: String,
    /// The HTTP status, when a response was received.
    pub status: Option<StatusCode>,
    /// Machine-readable code, see [`ErrorKind::code`].
    pub code: &'static str,
    /// The raw response body, when one was received.
    pub details: Option<String>,
    /// The `X-Correlation-ID` of the request that failed.
    pub correlation_id: Option<String>,
    /// When the error was produced.
    pub timestamp: SystemTime,
    /// Rate limit hints parsed from a 429 response.
    pub rate_limit: Option<RateLimitInfo>,
}

impl ApiError {
    /// Creates an error of the given kind with no status.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
            code: kind.code(),
            details: None,
            correlation_id: None,
            timestamp: SystemTime::now(),
            rate_limit: None,
        }
    }

    /// Creates an error from a non-2xx status and its body.
    ///
    /// When the body is a JSON object with a string `message` or `error`
    /// field, that becomes the message; otherwise the status reason phrase
    /// is used.
    pub fn from_status(status: StatusCode, body: impl Into<String>) -> Self {
        let body = body.into();
        let message = message_from_body(&body).unwrap_or_else(|| {
            format!(
                "{} {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("Unknown Status")
            )
        });
        let mut error = Self::new(ErrorKind::from_status(status), message);
        error.status = Some(status);
        if !body.is_empty() {
            error.details = Some(body);
        }
        error
    }

    /// Creates the local error raised when a circuit breaker refuses a call.
    pub fn circuit_open(endpoint: &str) -> Self {
        Self::new(
            ErrorKind::CircuitOpen,
            format!("Circuit breaker is open for {endpoint}"),
        )
    }

    /// Attaches the correlation id of the failed request.
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Attaches rate limit hints.
    pub fn with_rate_limit(mut self, info: Option<RateLimitInfo>) -> Self {
        self.rate_limit = info;
        self
    }

    /// Returns `true` for failures worth retrying: no response, client-side
    /// timeouts, any 5xx, 408 and 429.
    pub fn is_retryable(&self) -> bool {
        match self.kind {
            ErrorKind::Network | ErrorKind::Timeout | ErrorKind::RateLimit | ErrorKind::Server => {
                true
            }
            ErrorKind::Http => self.status.is_some_and(|s| s.is_server_error()),
            ErrorKind::CircuitOpen
            | ErrorKind::Authentication
            | ErrorKind::Authorization
            | ErrorKind::Validation => false,
        }
    }
}

fn message_from_body(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    ["message", "error"]
        .iter()
        .find_map(|field| value.get(field)?.as_str().map(str::to_owned))
}

/// The main error type of the crate.
///
/// # Examples
///
/// ```no_run
/// use palisade::{Client, Error, ErrorKind};
///
/// # async fn example() -> Result<(), Error> {
/// let client = Client::builder()
///     .base_url("https://api.example.com")?
///     .build()?;
///
/// match client.get::<serde_json::Value>("/api/users").await {
///     Ok(response) => println!("Success: {:?}", response.data),
///     Err(Error::Api(err)) if err.kind == ErrorKind::CircuitOpen => {
///         eprintln!("Backend is being given a rest: {}", err.message);
///     }
///     Err(e) => eprintln!("Request failed: {}", e),
/// }
/// # Ok(())
/// # }
/// ```
#[derive(thiserror::Error, Debug, Clone)]
pub enum Error {
    /// The request failed on the wire or was refused by the circuit breaker.
    #[error(transparent)]
    Api(Box<ApiError>),

    /// The response body could not be decoded into the expected type.
    #[error("Failed to deserialize response (status {status}): {serde_error}")]
    DeserializationFailed {
        /// The raw response body that failed to deserialize
        raw_response: String,
        /// The serde error message
        serde_error: String,
        /// The HTTP status code
        status: StatusCode,
    },

    /// Invalid configuration was provided.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// The request body could not be serialized to JSON.
    #[error("Failed to serialize request: {0}")]
    SerializationFailed(String),

    /// An invalid URL was provided.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// The outbound payload exceeded the configured size ceiling and was not sent.
    #[error("Request payload of {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge {
        /// Serialized size of the payload
        size: usize,
        /// Configured ceiling
        limit: usize,
    },

    /// Computing or decoding a request signature failed.
    #[error("Request signing failed: {0}")]
    Signing(String),
}

impl From<ApiError> for Error {
    fn from(error: ApiError) -> Self {
        Error::Api(Box::new(error))
    }
}

impl Error {
    /// Returns `true` if this error is potentially retryable.
    ///
    /// Only [`Error::Api`] errors can be; see [`ApiError::is_retryable`].
    ///
    /// ```
    /// use palisade::{ApiError, Error};
    /// use http::StatusCode;
    ///
    /// let err: Error = ApiError::from_status(StatusCode::SERVICE_UNAVAILABLE, "").into();
    /// assert!(err.is_retryable());
    ///
    /// let err: Error = ApiError::from_status(StatusCode::BAD_REQUEST, "").into();
    /// assert!(!err.is_retryable());
    /// ```
    pub fn is_retryable(&self) -> bool {
        self.api_error().is_some_and(ApiError::is_retryable)
    }

    /// Returns the classified error, if this is one.
    pub fn api_error(&self) -> Option<&ApiError> {
        match self {
            Error::Api(error) => Some(error),
            _ => None,
        }
    }

    /// Returns the classification, if this is a classified error.
    pub fn kind(&self) -> Option<ErrorKind> {
        self.api_error().map(|e| e.kind)
    }

    /// Returns the HTTP status code if this error has one.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Error::Api(error) => error.status,
            Error::DeserializationFailed { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Returns the raw response body if this error has one.
    pub fn raw_response(&self) -> Option<&str> {
        match self {
            Error::Api(error) => error.details.as_deref(),
            Error::DeserializationFailed { raw_response, .. } => Some(raw_response),
            _ => None,
        }
    }

    /// Returns the correlation id of the failed request, when known.
    pub fn correlation_id(&self) -> Option<&str> {
        self.api_error()?.correlation_id.as_deref()
    }

    /// Returns rate limit information if available.
    pub fn rate_limit_info(&self) -> Option<&RateLimitInfo> {
        self.api_error()?.rate_limit.as_ref()
    }
}

/// A specialized `Result` type for pipeline calls.
pub type Result<T> = std::result::Result<T, Error>;
