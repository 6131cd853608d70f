//! Response types.
//!
//! The pipeline works with [`RawResponse`]: the undecoded body plus transport
//! details, which is what the cache stores and what coalesced callers share.
//! Each caller then decodes it into its own [`Response<T>`].

use crate::{Error, Result};
use http::{HeaderMap, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;

/// A successful response before decoding.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: String,
    /// Time from entering the pipeline to the final response.
    pub latency: Duration,
    /// Number of dispatches made, 1 when no retry was needed.
    pub attempts: usize,
    pub correlation_id: String,
    /// Whether the response was served from the cache.
    pub from_cache: bool,
}

impl RawResponse {
    /// Decodes the body as JSON. An empty body decodes as `null`, so `()`
    /// and `Option<T>` accept `204 No Content`.
    pub fn decode<T: DeserializeOwned>(self) -> Result<Response<T>> {
        let text = if self.body.trim().is_empty() {
            "null"
        } else {
            self.body.as_str()
        };
        let data = serde_json::from_str(text).map_err(|e| Error::DeserializationFailed {
            raw_response: self.body.clone(),
            serde_error: e.to_string(),
            status: self.status,
        })?;

        Ok(Response {
            data,
            raw_body: self.body,
            status: self.status,
            headers: self.headers,
            latency: self.latency,
            attempts: self.attempts,
            correlation_id: self.correlation_id,
            from_cache: self.from_cache,
        })
    }
}

/// A decoded successful response with the details of how it was obtained.
///
/// # Examples
///
/// ```no_run
/// use palisade::Client;
/// use serde::Deserialize;
///
/// #[derive(Deserialize)]
/// struct User {
///     id: u64,
///     name: String,
/// }
///
/// # async fn example() -> Result<(), palisade::Error> {
/// let client = Client::builder()
///     .base_url("https://api.example.com")?
///     .build()?;
///
/// let response = client.get::<User>("/users/123").await?;
///
/// println!("User: {}", response.data.name);
/// println!("Took {:?} over {} attempt(s)", response.latency, response.attempts);
/// if response.from_cache {
///     println!("Served from cache");
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Response<T> {
    pub data: T,

    /// The raw body, for debugging and logging.
    pub raw_body: String,

    pub status: StatusCode,

    pub headers: HeaderMap,

    /// Total latency including every retry and backoff wait.
    pub latency: Duration,

    /// `1` when the first dispatch succeeded.
    pub attempts: usize,

    /// The `X-Correlation-ID` sent with the request.
    pub correlation_id: String,

    pub from_cache: bool,
}

impl<T> Response<T> {
    /// Maps the response data to a different type, keeping the metadata.
    ///
    /// ```
    /// # use palisade::RawResponse;
    /// # use http::{HeaderMap, StatusCode};
    /// # use std::time::Duration;
    /// let raw = RawResponse {
    ///     status: StatusCode::OK,
    ///     headers: HeaderMap::new(),
    ///     body: "42".to_string(),
    ///     latency: Duration::from_millis(100),
    ///     attempts: 1,
    ///     correlation_id: "abc".to_string(),
    ///     from_cache: false,
    /// };
    ///
    /// let response = raw.decode::<u32>().unwrap().map(|n| n.to_string());
    /// assert_eq!(response.data, "42");
    /// ```
    pub fn map<U, F>(self, f: F) -> Response<U>
    where
        F: FnOnce(T) -> U,
    {
        Response {
            data: f(self.data),
            raw_body: self.raw_body,
            status: self.status,
            headers: self.headers,
            latency: self.latency,
            attempts: self.attempts,
            correlation_id: self.correlation_id,
            from_cache: self.from_cache,
        }
    }

    pub fn was_retried(&self) -> bool {
        self.attempts > 1
    }

    /// Returns a header value by name, if present and valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)?.to_str().ok()
    }
}

impl<T> AsRef<T> for Response<T> {
    fn as_ref(&self) -> &T {
        &self.data
    }
}

impl<T> std::ops::Deref for Response<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    fn raw(body: &str) -> RawResponse {
        RawResponse {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: body.to_string(),
            latency: Duration::from_millis(5),
            attempts: 2,
            correlation_id: "cid".to_string(),
            from_cache: false,
        }
    }

    #[test]
    fn test_decode() {
        #[derive(Deserialize)]
        struct User {
            name: String,
        }
        let response = raw(r#"{"name":"Ada"}"#).decode::<User>().unwrap();
        assert_eq!(response.name, "Ada");
        assert!(response.was_retried());
        assert_eq!(response.correlation_id, "cid");
    }

    #[test]
    fn test_empty_body_decodes_as_unit() {
        raw("").decode::<()>().unwrap();
        assert_eq!(raw("  ").decode::<Option<u8>>().unwrap().data, None);
    }

    #[test]
    fn test_decode_failure_keeps_raw_body() {
        let err = raw("not json").decode::<u32>().unwrap_err();
        assert_eq!(err.raw_response(), Some("not json"));
        assert_eq!(err.status(), Some(StatusCode::OK));
    }
}
