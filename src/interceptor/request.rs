use crate::circuit_breaker::{CircuitBreaker, CircuitPermit};
use crate::context::PipelineContext;
use crate::csrf::CSRF_HEADER;
use crate::dedup::PendingRequest;
use crate::error::ApiError;
use crate::metadata::{RequestMetadata, RequestOptions};
use crate::response::RawResponse;
use crate::sanitizer::DataSanitizer;
use crate::security::{SecurityEvent, SecurityEventKind, Severity};
use crate::signer::SIGNATURE_HEADER;
use crate::{Error, Result};
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method};
use serde_json::Value;
use std::future::Future;
use url::Url;

const CORRELATION_HEADER: &str = "x-correlation-id";

/// A request that passed every outbound stage and is ready to dispatch.
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    /// The screened body.
    pub body: Option<Value>,
}

/// What the circuit gate decided for a new request.
pub enum Gate {
    /// Proceed; the permit says whether this request is the breaker's probe.
    Pass(CircuitPermit),
    /// The breaker refused a dispatch, but an identical request is in flight.
    Join(PendingRequest<Result<RawResponse>>),
}

pub struct RequestInterceptor<'a> {
    ctx: &'a PipelineContext,
}

impl<'a> RequestInterceptor<'a> {
    pub fn new(ctx: &'a PipelineContext) -> Self {
        Self { ctx }
    }

    /// Breaker key of the request.
    pub fn endpoint(options: &RequestOptions) -> String {
        CircuitBreaker::endpoint_key(&options.method, &options.path)
    }

    /// Whether the response to `options` may be served from and stored in
    /// the cache.
    pub fn is_cacheable(&self, options: &RequestOptions) -> bool {
        self.ctx.config.cache.enabled && options.method == Method::GET && !options.skip_cache
    }

    /// Stage 1: correlation id, fingerprint and cache key.
    pub fn begin(&self, options: &RequestOptions) -> RequestMetadata {
        let meta = RequestMetadata::for_request(options, self.is_cacheable(options));
        tracing::debug!(
            method = %options.method,
            path = %options.path,
            correlation_id = %meta.correlation_id,
            "Request entered pipeline"
        );
        meta
    }

    /// Stage 2 for a new request. While the breaker is open the call is
    /// refused, unless an identical request that already passed the gate is
    /// still in flight and can be joined.
    pub fn gate(
        &self,
        options: &RequestOptions,
        endpoint: &str,
        meta: &RequestMetadata,
    ) -> Result<Gate> {
        match self.ctx.circuit_breaker.acquire(endpoint) {
            CircuitPermit::Refused => match self.in_flight(options, meta) {
                Some(pending) => Ok(Gate::Join(pending)),
                None => Err(self.refuse(endpoint, meta)),
            },
            permit => Ok(Gate::Pass(permit)),
        }
    }

    /// Stage 2 before a retry: refuses while the endpoint's breaker is open.
    pub fn check_circuit(&self, endpoint: &str, meta: &RequestMetadata) -> Result<()> {
        if self.ctx.circuit_breaker.can_execute(endpoint) {
            return Ok(());
        }
        Err(self.refuse(endpoint, meta))
    }

    fn refuse(&self, endpoint: &str, meta: &RequestMetadata) -> Error {
        let error = ApiError::circuit_open(endpoint).with_correlation_id(&meta.correlation_id);
        self.ctx.error_handler.report(error, endpoint).into()
    }

    /// Gives back a probe slot when the request ends without dispatching.
    pub fn release(&self, permit: CircuitPermit, endpoint: &str) {
        if permit == CircuitPermit::Probe {
            self.ctx.circuit_breaker.release_probe(endpoint);
        }
    }

    fn in_flight(
        &self,
        options: &RequestOptions,
        meta: &RequestMetadata,
    ) -> Option<PendingRequest<Result<RawResponse>>> {
        if !self.should_deduplicate(options) {
            return None;
        }
        self.ctx.dedup.get_pending_request(&meta.fingerprint)
    }

    /// Stage 3: a live cached response, if any. Counts the hit or miss.
    pub fn lookup_cache(&self, meta: &RequestMetadata) -> Option<RawResponse> {
        let key = meta.cache_key.as_deref()?;
        match self.ctx.cache.get(key) {
            Some(mut cached) => {
                self.ctx.metrics.record_cache_hit();
                tracing::debug!(key, correlation_id = %meta.correlation_id, "Cache hit");
                cached.from_cache = true;
                cached.correlation_id = meta.correlation_id.clone();
                cached.latency = meta.elapsed();
                Some(cached)
            }
            None => {
                self.ctx.metrics.record_cache_miss();
                None
            }
        }
    }

    /// Stage 4: only idempotent requests are coalesced.
    pub fn should_deduplicate(&self, options: &RequestOptions) -> bool {
        options.is_idempotent() && !options.skip_dedup
    }

    /// Stages 5 to 8, run for every dispatch including retries.
    ///
    /// `fetch_csrf` is only invoked when a token is needed and none is held.
    pub async fn prepare<F, Fut>(
        &self,
        options: &RequestOptions,
        meta: &RequestMetadata,
        url: Url,
        fetch_csrf: F,
    ) -> Result<PreparedRequest>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String>>,
    {
        let endpoint = Self::endpoint(options);
        let mut headers = options.headers.clone();
        headers.insert(
            HeaderName::from_static(CORRELATION_HEADER),
            header_value(&meta.correlation_id)?,
        );

        let body = match &options.body {
            Some(body) => Some(self.screen_payload(body, &endpoint, meta)?),
            None => None,
        };

        if let Some(signer) = &self.ctx.signer {
            let signature =
                signer.sign_request(&options.method, url.as_str(), body.as_ref(), None)?;
            headers.insert(
                HeaderName::from_static(SIGNATURE_HEADER),
                HeaderValue::try_from(signature.to_header())
                    .map_err(|e| Error::Signing(e.to_string()))?,
            );
        }

        if let Some(csrf) = &self.ctx.csrf {
            if options.is_state_changing() && !csrf.is_token_endpoint(&options.path) {
                let token = match csrf.token() {
                    Some(token) => Some(token),
                    None => match fetch_csrf().await {
                        Ok(token) => {
                            csrf.set_token(token.clone());
                            Some(token)
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Proceeding without CSRF token");
                            self.ctx.events.emit(
                                SecurityEvent::new(
                                    SecurityEventKind::CsrfTokenUnavailable {
                                        reason: e.to_string(),
                                    },
                                    Severity::Medium,
                                )
                                .with_endpoint(endpoint.as_str())
                                .with_correlation_id(meta.correlation_id.as_str()),
                            );
                            None
                        }
                    },
                };
                if let Some(value) = token.and_then(|t| HeaderValue::try_from(t).ok()) {
                    headers.insert(HeaderName::from_static(CSRF_HEADER), value);
                }
            }
        }

        headers.insert(
            HeaderName::from_static("x-requested-with"),
            HeaderValue::from_static("XMLHttpRequest"),
        );
        headers.insert(
            HeaderName::from_static("x-frame-options"),
            HeaderValue::from_static("DENY"),
        );
        headers.insert(
            HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static("nosniff"),
        );

        Ok(PreparedRequest {
            method: options.method.clone(),
            url,
            headers,
            body,
        })
    }

    /// Stage 5: size ceiling, detection, then cleaning.
    fn screen_payload(&self, body: &Value, endpoint: &str, meta: &RequestMetadata) -> Result<Value> {
        let sanitizer = &self.ctx.sanitizer;
        if !sanitizer.validate_request_size(body) {
            let size = DataSanitizer::request_size(body);
            let limit = sanitizer.max_request_size();
            self.ctx.events.emit(
                SecurityEvent::new(SecurityEventKind::PayloadTooLarge { size, limit }, Severity::High)
                    .with_endpoint(endpoint)
                    .with_correlation_id(meta.correlation_id.as_str()),
            );
            return Err(Error::PayloadTooLarge { size, limit });
        }

        if !self.ctx.config.security.enable_sanitization {
            return Ok(body.clone());
        }

        let findings = sanitizer.detect_suspicious_patterns(body);
        if !findings.is_empty() {
            let mut patterns: Vec<String> =
                findings.iter().map(|m| m.pattern.to_string()).collect();
            patterns.sort();
            patterns.dedup();
            self.ctx.logger.warn(
                &format!("Suspicious payload sent to {endpoint}: {}", patterns.join(", ")),
                Some(&meta.correlation_id),
            );
            self.ctx.events.emit(
                SecurityEvent::new(SecurityEventKind::SuspiciousPayload { patterns }, Severity::High)
                    .with_endpoint(endpoint)
                    .with_correlation_id(meta.correlation_id.as_str()),
            );
        }
        Ok(sanitizer.sanitize_request(body))
    }
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::try_from(value)
        .map_err(|e| Error::ConfigurationError(format!("Invalid header value: {}", e)))
}
