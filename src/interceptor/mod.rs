//! The request and response halves of the pipeline.
//!
//! [`RequestInterceptor`] runs the outbound stages in a fixed order:
//! metadata, circuit gate, cache lookup, deduplication decision, payload
//! screening, signing, CSRF token, security headers. [`ResponseInterceptor`]
//! records the outcome and decides between retrying and rejecting.

mod request;
mod response;

pub use request::{Gate, PreparedRequest, RequestInterceptor};
pub use response::{ResponseAction, ResponseInterceptor};
