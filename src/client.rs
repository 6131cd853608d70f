//! The pipeline client.
//!
//! The [`Client`] type is the main entry point for making HTTP requests.
//! Use [`ClientBuilder`] to configure and create clients.

use crate::{
    cache::CacheStats,
    circuit_breaker::CircuitBreakerState,
    config::{
        CacheConfig, CircuitBreakerConfig, HealthConfig, MonitoringConfig, PipelineConfig,
        RetryConfig, SecurityConfig,
    },
    context::{ContextParts, PipelineContext},
    csrf::{CsrfProtection, CSRF_HEADER},
    error::{ApiError, ErrorKind},
    error_handler::{ErrorHandler, Notifier, TransportFailure},
    health::HealthStatus,
    interceptor::{Gate, PreparedRequest, RequestInterceptor, ResponseAction, ResponseInterceptor},
    logging::LogShipper,
    metadata::{RequestMetadata, RequestOptions},
    metrics::PerformanceMetrics,
    retry::RetryPredicate,
    security::{SecurityEvent, Severity},
    Error, RawResponse, Response, Result,
};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// An HTTP client that runs every request through the resilience and
/// security pipeline.
///
/// Cloning is cheap; clones share the cache, circuit breakers, metrics and
/// background tasks.
///
/// # Examples
///
/// ```no_run
/// use palisade::{Client, Response};
/// use serde::Deserialize;
/// use std::time::Duration;
///
/// #[derive(Deserialize)]
/// struct Invoice {
///     number: String,
///     total_cents: i64,
/// }
///
/// # async fn example() -> Result<(), palisade::Error> {
/// let client = Client::builder()
///     .base_url("https://billing.example.com")?
///     .timeout(Duration::from_secs(5))
///     .build()?;
///
/// let first: Response<Invoice> = client.get("/invoices/2024-117").await?;
/// // Served from the cache within the TTL.
/// let again: Response<Invoice> = client.get("/invoices/2024-117").await?;
/// assert!(again.from_cache);
/// println!("{} totals {} cents", first.data.number, first.data.total_cents);
///
/// let paid: Response<Invoice> = client
///     .post("/invoices/2024-117/payments", &serde_json::json!({"amount": 1200}))
///     .await?;
/// println!("Correlation id {}", paid.correlation_id);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    http_client: reqwest::Client,
    base_url: Url,
    default_headers: HeaderMap,
    timeout: Duration,
    context: PipelineContext,
}

/// A 2xx response as received, before pipeline bookkeeping.
struct Delivered {
    status: StatusCode,
    headers: HeaderMap,
    body: String,
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Makes a typed HTTP request.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use palisade::{Client, RequestOptions};
    /// use serde::Deserialize;
    /// use std::time::Duration;
    ///
    /// #[derive(Deserialize)]
    /// struct Page { items: Vec<String>, next: Option<String> }
    ///
    /// # async fn example() -> Result<(), palisade::Error> {
    /// let client = Client::builder()
    ///     .base_url("https://catalog.example.com")?
    ///     .build()?;
    ///
    /// let options = RequestOptions::get("/products")
    ///     .with_query_param("category", "tools")
    ///     .with_cache_ttl(Duration::from_secs(30));
    ///
    /// let page = client.call::<(), Page>(options, None).await?;
    /// println!("{} products, more: {}", page.data.items.len(), page.data.next.is_some());
    /// # Ok(())
    /// # }
    /// ```
    pub async fn call<Req, Res>(
        &self,
        options: RequestOptions,
        body: Option<&Req>,
    ) -> Result<Response<Res>>
    where
        Req: Serialize + ?Sized,
        Res: DeserializeOwned,
    {
        let options = match body {
            Some(body) => options.with_json(body)?,
            None => options,
        };
        let raw = self.send(options).await?;
        let status = raw.status;
        raw.decode().inspect_err(|e| {
            tracing::error!(
                error = %e,
                status = status.as_u16(),
                "Failed to deserialize response"
            );
        })
    }

    /// Runs `options` through the pipeline and returns the undecoded response.
    ///
    /// Identical idempotent requests in flight at the same time share one
    /// dispatch; cacheable GETs may be answered without any dispatch.
    pub async fn send(&self, options: RequestOptions) -> Result<RawResponse> {
        let ctx = &self.inner.context;
        let requests = RequestInterceptor::new(ctx);

        let meta = requests.begin(&options);
        let endpoint = RequestInterceptor::endpoint(&options);
        let permit = match requests.gate(&options, &endpoint, &meta)? {
            Gate::Pass(permit) => permit,
            Gate::Join(pending) => {
                tracing::debug!("Joined in-flight probe of an open circuit");
                return pending.await;
            }
        };

        if let Some(cached) = requests.lookup_cache(&meta) {
            requests.release(permit, &endpoint);
            return Ok(cached);
        }

        if requests.should_deduplicate(&options) {
            let client = self.clone();
            let key = meta.fingerprint.clone();
            let probe_endpoint = endpoint.clone();
            let (pending, registered) = ctx.dedup.get_or_register(key, move || async move {
                client.execute(options, meta, endpoint).await
            });
            if !registered {
                requests.release(permit, &probe_endpoint);
                tracing::debug!("Joined identical request already in flight");
            }
            return pending.await;
        }

        self.execute(options, meta, endpoint).await
    }

    /// Dispatches until success, a non-retryable failure or retry exhaustion.
    async fn execute(
        &self,
        options: RequestOptions,
        mut meta: RequestMetadata,
        endpoint: String,
    ) -> Result<RawResponse> {
        let ctx = &self.inner.context;
        let requests = RequestInterceptor::new(ctx);
        let responses = ResponseInterceptor::new(ctx);
        let url = self.build_url(&options)?;

        loop {
            if meta.retry_count > 0 {
                requests.check_circuit(&endpoint, &meta)?;
            }
            let prepared = requests
                .prepare(&options, &meta, url.clone(), || self.fetch_csrf_token())
                .await?;

            tracing::debug!(
                method = %prepared.method,
                url = %prepared.url,
                attempt = meta.retry_count + 1,
                correlation_id = %meta.correlation_id,
                "Executing HTTP request"
            );

            match self.dispatch(prepared).await {
                Ok(delivered) => {
                    let raw = RawResponse {
                        status: delivered.status,
                        headers: delivered.headers,
                        body: delivered.body,
                        latency: meta.elapsed(),
                        attempts: meta.retry_count as usize + 1,
                        correlation_id: meta.correlation_id.clone(),
                        from_cache: false,
                    };
                    responses.on_success(&options, &meta, &endpoint, &raw);
                    return Ok(raw);
                }
                Err(failure) => match responses.on_failure(&failure, &meta, &endpoint) {
                    ResponseAction::Retry { delay } => {
                        tokio::time::sleep(delay).await;
                        meta.retry_count += 1;
                    }
                    ResponseAction::Reject(error) => return Err(error),
                },
            }
        }
    }

    /// Sends one prepared request.
    async fn dispatch(
        &self,
        prepared: PreparedRequest,
    ) -> std::result::Result<Delivered, TransportFailure> {
        let mut headers = self.inner.default_headers.clone();
        for (name, value) in &prepared.headers {
            headers.insert(name.clone(), value.clone());
        }

        let mut request = self
            .inner
            .http_client
            .request(prepared.method, prepared.url)
            .headers(headers)
            .timeout(self.inner.timeout);
        if let Some(body) = &prepared.body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| TransportFailure::from_reqwest(&e))?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .text()
            .await
            .map_err(|e| TransportFailure::from_reqwest(&e))?;

        if !status.is_success() {
            return Err(TransportFailure::Status {
                status,
                body,
                headers,
            });
        }
        Ok(Delivered {
            status,
            headers,
            body,
        })
    }

    /// Fetches a CSRF token from the configured endpoint.
    ///
    /// The fetch bypasses the pipeline so it can never recurse into itself.
    async fn fetch_csrf_token(&self) -> Result<String> {
        let csrf = self.csrf()?;
        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static("x-requested-with"),
            HeaderValue::from_static("XMLHttpRequest"),
        );
        let prepared = PreparedRequest {
            method: Method::GET,
            url: self.join(csrf.endpoint())?,
            headers,
            body: None,
        };

        let delivered = self
            .dispatch(prepared)
            .await
            .map_err(|failure| Error::from(ErrorHandler::classify(&failure, None)))?;

        serde_json::from_str(&delivered.body)
            .ok()
            .and_then(|body| CsrfProtection::token_from_body(&body))
            .or_else(|| {
                delivered
                    .headers
                    .get(CSRF_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_owned)
            })
            .ok_or_else(|| {
                ApiError::new(ErrorKind::Http, "CSRF endpoint returned no token").into()
            })
    }

    /// Discards the held CSRF token and fetches a new one.
    pub async fn refresh_csrf_token(&self) -> Result<String> {
        let csrf = self.csrf()?;
        csrf.clear();
        let token = self.fetch_csrf_token().await?;
        csrf.set_token(token.clone());
        Ok(token)
    }

    fn csrf(&self) -> Result<&CsrfProtection> {
        self.inner
            .context
            .csrf
            .as_ref()
            .ok_or_else(|| Error::ConfigurationError("CSRF protection is disabled".to_string()))
    }

    fn build_url(&self, options: &RequestOptions) -> Result<Url> {
        let mut url = self.join(&options.path)?;
        if !options.query_params.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in &options.query_params {
                pairs.append_pair(key, value);
            }
        }
        Ok(url)
    }

    /// Appends `path` to the base URL's path. Absolute URLs are used as given.
    fn join(&self, path: &str) -> Result<Url> {
        if path.starts_with("http://") || path.starts_with("https://") {
            return Ok(Url::parse(path)?);
        }
        let mut url = self.inner.base_url.clone();
        let base_path = url.path().trim_end_matches('/').to_string();
        url.set_path(&format!("{}/{}", base_path, path.trim_start_matches('/')));
        Ok(url)
    }

    /// Makes a GET request to the specified path. Eligible for caching and
    /// coalescing.
    pub async fn get<Res>(&self, path: impl Into<String>) -> Result<Response<Res>>
    where
        Res: DeserializeOwned,
    {
        self.call::<(), Res>(RequestOptions::get(path), None).await
    }

    /// Makes a POST request to the specified path with a JSON body.
    pub async fn post<Req, Res>(&self, path: impl Into<String>, body: &Req) -> Result<Response<Res>>
    where
        Req: Serialize + ?Sized,
        Res: DeserializeOwned,
    {
        self.call(RequestOptions::new(Method::POST, path), Some(body))
            .await
    }

    /// Makes a PUT request to the specified path with a JSON body.
    pub async fn put<Req, Res>(&self, path: impl Into<String>, body: &Req) -> Result<Response<Res>>
    where
        Req: Serialize + ?Sized,
        Res: DeserializeOwned,
    {
        self.call(RequestOptions::new(Method::PUT, path), Some(body))
            .await
    }

    /// Makes a PATCH request to the specified path with a JSON body.
    pub async fn patch<Req, Res>(
        &self,
        path: impl Into<String>,
        body: &Req,
    ) -> Result<Response<Res>>
    where
        Req: Serialize + ?Sized,
        Res: DeserializeOwned,
    {
        self.call(RequestOptions::new(Method::PATCH, path), Some(body))
            .await
    }

    /// Makes a DELETE request to the specified path.
    pub async fn delete<Res>(&self, path: impl Into<String>) -> Result<Response<Res>>
    where
        Res: DeserializeOwned,
    {
        self.call::<(), Res>(RequestOptions::new(Method::DELETE, path), None)
            .await
    }

    pub fn metrics(&self) -> PerformanceMetrics {
        self.inner.context.metrics.metrics()
    }

    pub fn success_rate(&self) -> f64 {
        self.inner.context.metrics.success_rate()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.inner.context.cache.stats()
    }

    pub fn circuit_breaker_stats(&self) -> HashMap<String, CircuitBreakerState> {
        self.inner.context.circuit_breaker.stats()
    }

    /// Recorded security events, optionally only those of one severity.
    ///
    /// Events are recorded by a background task, so an event emitted by a
    /// request that just returned may take a moment to appear.
    pub fn security_events(&self, severity: Option<Severity>) -> Vec<SecurityEvent> {
        self.inner.context.security.events(severity)
    }

    /// Subscribes to security threshold alerts.
    pub fn on_security_alert(&self, callback: impl Fn(&SecurityEvent) + Send + Sync + 'static) {
        self.inner.context.security.on_alert(callback);
    }

    /// The latest health snapshot, if a check has run.
    pub fn health_status(&self) -> Option<HealthStatus> {
        self.inner.context.health.status()
    }

    pub async fn force_health_check(&self) -> HealthStatus {
        self.inner.context.health.force_health_check().await
    }

    pub fn on_health_check(&self, callback: impl Fn(&HealthStatus) + Send + Sync + 'static) {
        self.inner.context.health.on_check(callback);
    }

    pub fn clear_cache(&self) {
        self.inner.context.cache.clear();
    }

    pub fn reset_circuit_breakers(&self) {
        self.inner.context.circuit_breaker.reset();
    }

    pub fn reset_metrics(&self) {
        self.inner.context.metrics.reset();
    }

    /// Stops background work and flushes buffered logs. Requests can still
    /// be made afterwards, but nothing more is shipped or health checked.
    pub async fn shutdown(&self) {
        self.inner.context.shutdown().await;
    }

    pub fn context(&self) -> &PipelineContext {
        &self.inner.context
    }
}

/// Builder for configuring and creating a [`Client`].
///
/// # Examples
///
/// ```no_run
/// use palisade::ClientBuilder;
/// use palisade::config::RetryConfig;
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), palisade::Error> {
/// let client = ClientBuilder::new()
///     .base_url("https://api.example.com")?
///     .timeout(Duration::from_secs(30))
///     .retries(RetryConfig {
///         max_attempts: 5,
///         base_delay: Duration::from_millis(200),
///         ..RetryConfig::default()
///     })
///     .signing_secret("shared-secret")
///     .default_header("User-Agent", "my-app/1.0")?
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct ClientBuilder {
    config: PipelineConfig,
    base_url: Option<Url>,
    default_headers: HeaderMap,
    retry_predicate: Option<Box<dyn RetryPredicate>>,
    notifier: Option<Arc<dyn Notifier>>,
    log_shipper: Option<Arc<dyn LogShipper>>,
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self {
            config: PipelineConfig::default(),
            base_url: None,
            default_headers: HeaderMap::new(),
            retry_predicate: None,
            notifier: None,
            log_shipper: None,
        }
    }

    /// Replaces the whole pipeline configuration.
    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the base URL for all requests.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid.
    pub fn base_url(mut self, url: impl AsRef<str>) -> Result<Self> {
        self.base_url = Some(Url::parse(url.as_ref())?);
        Ok(self)
    }

    /// Adds a default header that will be included in all requests.
    ///
    /// # Errors
    ///
    /// Returns an error if the header name or value is invalid.
    pub fn default_header(mut self, name: impl AsRef<str>, value: impl AsRef<str>) -> Result<Self> {
        let name = HeaderName::try_from(name.as_ref())
            .map_err(|e| Error::ConfigurationError(format!("Invalid header name: {}", e)))?;
        let value = HeaderValue::try_from(value.as_ref())
            .map_err(|e| Error::ConfigurationError(format!("Invalid header value: {}", e)))?;
        self.default_headers.insert(name, value);
        Ok(self)
    }

    /// Sets the per-dispatch timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    pub fn retries(mut self, retries: RetryConfig) -> Self {
        self.config.retries = retries;
        self
    }

    pub fn cache(mut self, cache: CacheConfig) -> Self {
        self.config.cache = cache;
        self
    }

    pub fn circuit_breaker(mut self, circuit_breaker: CircuitBreakerConfig) -> Self {
        self.config.circuit_breaker = circuit_breaker;
        self
    }

    pub fn security(mut self, security: SecurityConfig) -> Self {
        self.config.security = security;
        self
    }

    pub fn monitoring(mut self, monitoring: MonitoringConfig) -> Self {
        self.config.monitoring = monitoring;
        self
    }

    pub fn health(mut self, health: HealthConfig) -> Self {
        self.config.health = health;
        self
    }

    /// Enables request signing with `secret`.
    pub fn signing_secret(mut self, secret: impl Into<String>) -> Self {
        self.config.security.enable_request_signing = true;
        self.config.security.signing_secret = Some(secret.into());
        self
    }

    /// Sets a custom retry predicate.
    ///
    /// By default, requests are retried based on `Error::is_retryable()`.
    pub fn retry_predicate(mut self, predicate: Box<dyn RetryPredicate>) -> Self {
        self.retry_predicate = Some(predicate);
        self
    }

    /// Where user-facing failure notifications go. Defaults to `tracing`.
    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Ships buffered logs and security events through `shipper` instead of
    /// the HTTP shipper configured by `monitoring.log_endpoint`.
    pub fn log_shipper(mut self, shipper: Arc<dyn LogShipper>) -> Self {
        self.log_shipper = Some(shipper);
        self
    }

    /// Builds the configured `Client` and starts its background tasks.
    ///
    /// # Errors
    ///
    /// Returns an error if no base URL was provided, if the configuration
    /// is invalid, or if called outside a Tokio runtime.
    pub fn build(self) -> Result<Client> {
        let base_url = match (self.base_url, &self.config.base_url) {
            (Some(url), _) => url,
            (None, Some(url)) => Url::parse(url)?,
            (None, None) => {
                return Err(Error::ConfigurationError("Base URL is required".to_string()))
            }
        };
        self.config.validate()?;

        tokio::runtime::Handle::try_current().map_err(|_| {
            Error::ConfigurationError("Client must be built within a Tokio runtime".to_string())
        })?;

        let http_client = reqwest::Client::builder().build().map_err(|e| {
            Error::ConfigurationError(format!("Failed to build HTTP client: {}", e))
        })?;

        let timeout = self.config.timeout;
        let context = PipelineContext::new(
            self.config,
            http_client.clone(),
            ContextParts {
                retry_predicate: self.retry_predicate,
                notifier: self.notifier,
                log_shipper: self.log_shipper,
            },
        )?;

        Ok(Client {
            inner: Arc::new(ClientInner {
                http_client,
                base_url,
                default_headers: self.default_headers,
                timeout,
                context,
            }),
        })
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}
