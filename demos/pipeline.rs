//! Walks a request through the whole pipeline against a public test API.
//!
//! This demo shows how to:
//! - Configure caching, retries, circuit breaking and request signing
//! - Observe cache hits and request coalescing
//! - Inspect metrics, circuit breakers and security events
//! - Run a health check and shut the pipeline down cleanly
//!
//! Run with: `cargo run --example pipeline`

use palisade::config::{CircuitBreakerConfig, HealthConfig, RetryConfig};
use palisade::{Client, Error, RequestOptions};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Deserialize)]
#[allow(dead_code)]
struct Post {
    #[serde(rename = "userId")]
    user_id: u32,
    id: u32,
    title: String,
}

#[derive(Debug, Serialize)]
struct NewPost {
    title: String,
    body: String,
    #[serde(rename = "userId")]
    user_id: u32,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "palisade=debug,pipeline=info".into()),
        )
        .init();

    let client = Client::builder()
        .base_url("https://jsonplaceholder.typicode.com")?
        .timeout(Duration::from_secs(10))
        .retries(RetryConfig {
            max_attempts: 2,
            base_delay: Duration::from_millis(250),
            ..RetryConfig::default()
        })
        .circuit_breaker(CircuitBreakerConfig {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(10),
            ..CircuitBreakerConfig::default()
        })
        .health(HealthConfig {
            endpoints: vec!["https://jsonplaceholder.typicode.com".to_string()],
            ..HealthConfig::default()
        })
        .signing_secret("demo-secret")
        .build()?;

    println!("=== Cached GET ===");
    let first = client.get::<Post>("/posts/1").await?;
    let second = client.get::<Post>("/posts/1").await?;
    println!("Title: {}", first.data.title);
    println!(
        "First took {:?} (cached: {}), second took {:?} (cached: {})",
        first.latency, first.from_cache, second.latency, second.from_cache
    );
    println!();

    println!("=== Coalesced GETs ===");
    let options = || RequestOptions::get("/posts/2").without_cache();
    let (a, b) = tokio::join!(
        client.call::<(), Post>(options(), None),
        client.call::<(), Post>(options(), None),
    );
    println!("Both callers got post {} and {}", a?.data.id, b?.data.id);
    println!();

    println!("=== Sanitized POST ===");
    let new_post = NewPost {
        title: "Hello <script>alert('x')</script>".to_string(),
        body: "<a href=\"javascript:void(0)\" onclick=\"steal()\">click</a>".to_string(),
        user_id: 1,
    };
    let created = client.post::<_, serde_json::Value>("/posts", &new_post).await?;
    println!("Server echoed: {}", created.data);
    println!();

    println!("=== Error classification ===");
    match client.get::<Post>("/posts/does-not-exist").await {
        Ok(post) => println!("Unexpected post: {:?}", post.data),
        Err(e) => println!("Failed with {:?}: {}", e.kind(), e),
    }
    println!();

    println!("=== Health ===");
    let health = client.force_health_check().await;
    println!("Overall: {:?}", health.status);
    for endpoint in &health.endpoints {
        println!(
            "  {} is {:?} ({} ms)",
            endpoint.endpoint, endpoint.status, endpoint.response_time
        );
    }
    println!();

    println!("=== Metrics ===");
    let metrics = client.metrics();
    println!("Requests: {}", metrics.total_requests);
    println!("Cache hit rate: {:.1}%", metrics.cache_hit_rate);
    println!("p95 latency: {:.1} ms", metrics.p95_response_time);
    println!("Success rate: {:.1}%", client.success_rate());
    println!("Circuit breakers: {:?}", client.circuit_breaker_stats().keys());

    tokio::time::sleep(Duration::from_millis(50)).await;
    for event in client.security_events(None) {
        println!("Security event: {:?} ({:?})", event.kind, event.severity);
    }

    client.shutdown().await;
    Ok(())
}
