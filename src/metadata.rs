//! Per-request options and pipeline bookkeeping.

use crate::cache::RequestCache;
use crate::dedup::RequestDeduplication;
use crate::{Error, Result};
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Everything the caller specifies about one request.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    /// The HTTP method (GET, POST, etc.).
    pub method: Method,

    /// The request path, relative to the base URL.
    pub path: String,

    /// Additional headers for this request.
    pub headers: HeaderMap,

    /// Query parameters; kept sorted so equal requests key identically.
    pub query_params: BTreeMap<String, String>,

    /// JSON body for state-changing requests.
    pub body: Option<Value>,

    /// Overrides the configured cache TTL for this request.
    pub cache_ttl: Option<Duration>,

    /// Bypass the response cache entirely.
    pub skip_cache: bool,

    /// Never coalesce this request with identical in-flight ones.
    pub skip_dedup: bool,
}

impl RequestOptions {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: HeaderMap::new(),
            query_params: BTreeMap::new(),
            body: None,
            cache_ttl: None,
            skip_cache: false,
            skip_dedup: false,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    /// Adds a header to the request.
    ///
    /// # Errors
    ///
    /// Returns an error if the header name or value is invalid.
    pub fn with_header(mut self, name: impl AsRef<str>, value: impl AsRef<str>) -> Result<Self> {
        let name = HeaderName::try_from(name.as_ref())
            .map_err(|e| Error::ConfigurationError(format!("Invalid header name: {}", e)))?;
        let value = HeaderValue::try_from(value.as_ref())
            .map_err(|e| Error::ConfigurationError(format!("Invalid header value: {}", e)))?;
        self.headers.insert(name, value);
        Ok(self)
    }

    pub fn with_query_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query_params.insert(key.into(), value.into());
        self
    }

    pub fn with_query_params(mut self, params: impl IntoIterator<Item = (String, String)>) -> Self {
        self.query_params.extend(params);
        self
    }

    /// Serializes `body` as the JSON payload.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SerializationFailed`] if `body` cannot be represented
    /// as JSON.
    pub fn with_json<B: Serialize + ?Sized>(mut self, body: &B) -> Result<Self> {
        let value =
            serde_json::to_value(body).map_err(|e| Error::SerializationFailed(e.to_string()))?;
        self.body = Some(value);
        Ok(self)
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    pub fn without_cache(mut self) -> Self {
        self.skip_cache = true;
        self
    }

    pub fn without_deduplication(mut self) -> Self {
        self.skip_dedup = true;
        self
    }

    /// GET, HEAD and OPTIONS.
    pub fn is_idempotent(&self) -> bool {
        matches!(self.method, Method::GET | Method::HEAD | Method::OPTIONS)
    }

    /// POST, PUT, PATCH and DELETE.
    pub fn is_state_changing(&self) -> bool {
        matches!(
            self.method,
            Method::POST | Method::PUT | Method::PATCH | Method::DELETE
        )
    }

    /// The query parameters as a JSON object, `None` when there are none.
    pub fn params_value(&self) -> Option<Value> {
        if self.query_params.is_empty() {
            return None;
        }
        let map: Map<String, Value> = self
            .query_params
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        Some(Value::Object(map))
    }

    /// What identifies the request for deduplication: the body when there
    /// is one, the query parameters otherwise.
    pub(crate) fn payload_value(&self) -> Option<Value> {
        self.body.clone().or_else(|| self.params_value())
    }
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self::get("")
    }
}

/// Bookkeeping attached to a request as it moves through the pipeline.
#[derive(Debug, Clone)]
pub struct RequestMetadata {
    pub start_time: Instant,
    /// Sent as `X-Correlation-ID`.
    pub correlation_id: String,
    /// Retries made so far; 0 on the first attempt.
    pub retry_count: u32,
    /// Deduplication key.
    pub fingerprint: String,
    /// Cache key, for requests eligible for caching.
    pub cache_key: Option<String>,
}

impl RequestMetadata {
    pub fn for_request(options: &RequestOptions, cacheable: bool) -> Self {
        let payload = options.payload_value();
        let params = options.params_value();
        Self {
            start_time: Instant::now(),
            correlation_id: Uuid::new_v4().to_string(),
            retry_count: 0,
            fingerprint: RequestDeduplication::<()>::generate_key(
                &options.method,
                &options.path,
                payload.as_ref(),
            ),
            cache_key: cacheable.then(|| {
                RequestCache::<()>::generate_key(&options.method, &options.path, params.as_ref())
            }),
        }
    }

    /// Total time since the request entered the pipeline.
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }
}
