use crate::context::PipelineContext;
use crate::error_handler::{ErrorHandler, TransportFailure};
use crate::metadata::{RequestMetadata, RequestOptions};
use crate::response::RawResponse;
use crate::security::{SecurityEvent, SecurityEventKind, Severity};
use crate::Error;
use http::header::ETAG;
use std::time::Duration;

/// What the caller should do after a failed dispatch.
#[derive(Debug)]
pub enum ResponseAction {
    /// Wait `delay`, then run the gate and stages 5 to 8 again.
    Retry { delay: Duration },
    /// Give up with this error.
    Reject(Error),
}

pub struct ResponseInterceptor<'a> {
    ctx: &'a PipelineContext,
}

impl<'a> ResponseInterceptor<'a> {
    pub fn new(ctx: &'a PipelineContext) -> Self {
        Self { ctx }
    }

    pub fn on_success(
        &self,
        options: &RequestOptions,
        meta: &RequestMetadata,
        endpoint: &str,
        response: &RawResponse,
    ) {
        let ctx = self.ctx;
        ctx.metrics.record_request(meta.elapsed(), true);

        if let Some(key) = &meta.cache_key {
            let ttl = options.cache_ttl.unwrap_or(ctx.config.cache.default_ttl);
            let etag = response
                .headers
                .get(ETAG)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned);
            ctx.cache.set_with_etag(key.clone(), response.clone(), ttl, etag);
        } else if options.is_state_changing() && ctx.config.cache.enabled {
            // The resource itself and anything beneath it, not siblings that
            // merely share a prefix.
            let resource = options.path.trim_end_matches('/');
            let dropped = ctx.cache.invalidate_prefix(&format!("GET {resource}|"))
                + ctx.cache.invalidate_prefix(&format!("GET {resource}/"));
            if dropped > 0 {
                tracing::debug!(path = %options.path, dropped, "Invalidated cached reads");
            }
        }

        ctx.circuit_breaker.on_success(endpoint);

        if let Some(csrf) = &ctx.csrf {
            csrf.update_from_headers(&response.headers);
        }

        tracing::info!(
            method = %options.method,
            path = %options.path,
            status = response.status.as_u16(),
            latency_ms = response.latency.as_millis() as u64,
            attempts = response.attempts,
            correlation_id = %meta.correlation_id,
            "Request succeeded"
        );
    }

    pub fn on_failure(
        &self,
        failure: &TransportFailure,
        meta: &RequestMetadata,
        endpoint: &str,
    ) -> ResponseAction {
        let ctx = self.ctx;
        ctx.metrics.record_request(meta.elapsed(), false);

        if ctx.circuit_breaker.on_failure(endpoint) {
            ctx.metrics.record_circuit_breaker_trip();
            let failures = ctx.circuit_breaker.state(endpoint).failure_count;
            ctx.events.emit(
                SecurityEvent::new(SecurityEventKind::CircuitOpened { failures }, Severity::High)
                    .with_endpoint(endpoint)
                    .with_correlation_id(meta.correlation_id.as_str()),
            );
        }

        let classified = ErrorHandler::classify(failure, Some(&meta.correlation_id));
        let error = Error::from(classified.clone());
        if ctx.retry.should_retry(&error, meta.retry_count) {
            ctx.metrics.record_retry_attempt();
            let delay = ctx.retry.delay_for(&error, meta.retry_count);
            tracing::info!(
                endpoint,
                status = failure.status().map(|s| s.as_u16()),
                attempt = meta.retry_count + 1,
                delay_ms = delay.as_millis() as u64,
                correlation_id = %meta.correlation_id,
                "Retrying request after delay"
            );
            return ResponseAction::Retry { delay };
        }

        ResponseAction::Reject(ctx.error_handler.report(classified, endpoint).into())
    }
}
