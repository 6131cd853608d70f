//! # Palisade - a resilient, secured HTTP request pipeline
//!
//! Palisade wraps `reqwest` in a pipeline that every request passes through.
//! On the way out a request is fingerprinted, checked against its endpoint's
//! circuit breaker, and served from the response cache when possible.
//! Identical in-flight requests are coalesced. The payload is size-checked,
//! scanned and sanitized, then the request is signed and stamped with a
//! CSRF token and security headers. On the way back, outcomes feed metrics,
//! the breaker, the cache and the retry policy, and failures are classified
//! into typed errors and security events.
//!
//! ## Quick Start
//!
//! ```no_run
//! use palisade::{Client, config::RetryConfig};
//! use serde::{Deserialize, Serialize};
//! use std::time::Duration;
//!
//! #[derive(Serialize)]
//! struct PlaceOrder {
//!     sku: String,
//!     quantity: u32,
//! }
//!
//! #[derive(Deserialize)]
//! struct Order {
//!     id: String,
//!     status: String,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), palisade::Error> {
//!     let client = Client::builder()
//!         .base_url("https://shop.example.com/api")?
//!         .timeout(Duration::from_secs(10))
//!         .retries(RetryConfig {
//!             max_attempts: 3,
//!             base_delay: Duration::from_millis(100),
//!             ..RetryConfig::default()
//!         })
//!         .signing_secret("shared-secret")
//!         .build()?;
//!
//!     // Signed, sanitized, retried on 5xx.
//!     let placed = client
//!         .post::<_, Order>("/orders", &PlaceOrder { sku: "A-1".into(), quantity: 2 })
//!         .await?;
//!
//!     // Cached for the default TTL; concurrent duplicates share one dispatch.
//!     let order = client.get::<Order>(format!("/orders/{}", placed.data.id)).await?;
//!     println!(
//!         "{} is {} ({:?}, cached: {})",
//!         order.data.id, order.data.status, order.latency, order.from_cache
//!     );
//!
//!     client.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Error Handling
//!
//! Failed requests surface as [`Error::Api`], carrying an [`ApiError`] with a
//! status-derived [`ErrorKind`], the raw body and the correlation id:
//!
//! ```no_run
//! use palisade::{Client, Error, ErrorKind};
//!
//! # async fn example() -> Result<(), Error> {
//! # let client = Client::builder().base_url("https://api.example.com")?.build()?;
//! match client.get::<serde_json::Value>("/inventory").await {
//!     Ok(response) => println!("Success: {:?}", response.data),
//!     Err(Error::DeserializationFailed { status, serde_error, .. }) => {
//!         eprintln!("Unexpected body with status {status}: {serde_error}");
//!     }
//!     Err(e) if e.kind() == Some(ErrorKind::CircuitOpen) => {
//!         eprintln!("Endpoint is failing fast: {}", e);
//!     }
//!     Err(e) => eprintln!("Request {:?} failed: {}", e.correlation_id(), e),
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Retry Predicates
//!
//! Which failures are retried is decided by a [`RetryPredicate`]:
//!
//! ```no_run
//! use palisade::{Client, Error, ErrorKind, OrPredicate, RetryOnRetryable, RetryPredicate};
//!
//! struct RetryOnNotFound;
//!
//! impl RetryPredicate for RetryOnNotFound {
//!     fn should_retry(&self, error: &Error, _attempt: u32) -> bool {
//!         error.status().map_or(false, |s| s.as_u16() == 404)
//!     }
//! }
//!
//! # async fn example() -> Result<(), Error> {
//! let client = Client::builder()
//!     .base_url("https://api.example.com")?
//!     .retry_predicate(Box::new(OrPredicate::new(vec![
//!         Box::new(RetryOnRetryable),
//!         Box::new(RetryOnNotFound),
//!     ])))
//!     .build()?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod circuit_breaker;
mod client;
pub mod config;
mod context;
pub mod csrf;
pub mod dedup;
mod error;
pub mod error_handler;
pub mod fingerprint;
pub mod health;
pub mod interceptor;
pub mod logging;
pub mod metadata;
pub mod metrics;
pub mod rate_limit;
mod response;
pub mod retry;
pub mod sanitizer;
pub mod security;
pub mod signer;
mod task;

pub use client::{Client, ClientBuilder};
pub use config::PipelineConfig;
pub use context::PipelineContext;
pub use error::{ApiError, Error, ErrorKind, Result};
pub use metadata::RequestOptions;
pub use response::{RawResponse, Response};
pub use retry::{OrPredicate, RetryOnRetryable, RetryPredicate};
pub use security::{SecurityEvent, Severity};
pub use task::ScheduledTask;
