//! CSRF token holder.
//!
//! The token is fetched lazily from a configured endpoint the first time a
//! state-changing request needs it, attached as `X-CSRF-Token`, and replaced
//! whenever a response carries a fresh one.

use http::HeaderMap;
use serde_json::Value;
use std::sync::{PoisonError, RwLock};

pub const CSRF_HEADER: &str = "x-csrf-token";

#[derive(Debug)]
pub struct CsrfProtection {
    endpoint: String,
    token: RwLock<Option<String>>,
}

impl CsrfProtection {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            token: RwLock::new(None),
        }
    }

    /// Path the token is fetched from.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Whether `path` is the token endpoint itself; such requests never
    /// carry a token.
    pub fn is_token_endpoint(&self, path: &str) -> bool {
        path.split('?').next() == Some(self.endpoint.as_str())
    }

    pub fn token(&self) -> Option<String> {
        self.token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_token(&self, token: impl Into<String>) {
        *self.token.write().unwrap_or_else(PoisonError::into_inner) = Some(token.into());
    }

    pub fn clear(&self) {
        *self.token.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Adopts a token sent back in response headers. Returns whether one was found.
    pub fn update_from_headers(&self, headers: &HeaderMap) -> bool {
        match headers.get(CSRF_HEADER).and_then(|v| v.to_str().ok()) {
            Some(token) if !token.is_empty() => {
                self.set_token(token);
                true
            }
            _ => false,
        }
    }

    /// Extracts a token from a token-endpoint response body.
    ///
    /// ```
    /// use palisade::csrf::CsrfProtection;
    /// use serde_json::json;
    ///
    /// assert_eq!(
    ///     CsrfProtection::token_from_body(&json!({"csrfToken": "t0k"})).as_deref(),
    ///     Some("t0k")
    /// );
    /// assert_eq!(CsrfProtection::token_from_body(&json!({"other": 1})), None);
    /// ```
    pub fn token_from_body(body: &Value) -> Option<String> {
        ["csrfToken", "csrf_token", "token"]
            .iter()
            .find_map(|field| body.get(field)?.as_str())
            .filter(|token| !token.is_empty())
            .map(str::to_owned)
    }
}
