//! Integration tests using wiremock to simulate HTTP servers.

use futures_util::future::BoxFuture;
use http::Method;
use palisade::circuit_breaker::CircuitState;
use palisade::config::{
    CacheConfig, CircuitBreakerConfig, HealthConfig, MonitoringConfig, RetryConfig,
    SecurityConfig,
};
use palisade::health::{EndpointStatus, HealthState};
use palisade::logging::{LogRecord, LogShipper};
use palisade::security::SecurityEventKind;
use palisade::signer::{RequestSignature, RequestSigner, SignatureAlgorithm};
use palisade::{
    Client, ClientBuilder, Error, ErrorKind, RequestOptions, RetryPredicate, SecurityEvent,
    Severity,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use wiremock::matchers::{header, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct TestData {
    id: u32,
    name: String,
}

fn fast_retries(max_attempts: u32) -> RetryConfig {
    RetryConfig {
        max_attempts,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(10),
        jitter: false,
        ..RetryConfig::default()
    }
}

fn no_retries() -> RetryConfig {
    RetryConfig {
        enabled: false,
        ..RetryConfig::default()
    }
}

fn builder(server: &MockServer) -> ClientBuilder {
    Client::builder()
        .base_url(server.uri())
        .unwrap()
        .retries(fast_retries(3))
}

/// Security events are recorded by a background task; give it a moment.
async fn wait_for_events(client: &Client, severity: Option<Severity>) -> Vec<SecurityEvent> {
    for _ in 0..100 {
        let events = client.security_events(severity);
        if !events.is_empty() {
            return events;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Vec::new()
}

#[tokio::test]
async fn test_successful_get_request() {
    let mock_server = MockServer::start().await;

    let response_data = TestData {
        id: 1,
        name: "Test".to_string(),
    };

    Mock::given(method("GET"))
        .and(path("/test"))
        .and(header_exists("x-correlation-id"))
        .and(header("x-requested-with", "XMLHttpRequest"))
        .and(header("x-frame-options", "DENY"))
        .and(header("x-content-type-options", "nosniff"))
        .respond_with(ResponseTemplate::new(200).set_body_json(&response_data))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = builder(&mock_server).build().unwrap();

    let response = client.get::<TestData>("/test").await.unwrap();

    assert_eq!(response.data, response_data);
    assert_eq!(response.status.as_u16(), 200);
    assert_eq!(response.attempts, 1);
    assert!(!response.was_retried());
    assert!(!response.from_cache);

    let received = mock_server.received_requests().await.unwrap();
    let sent_id = received[0]
        .headers
        .get("x-correlation-id")
        .unwrap()
        .to_str()
        .unwrap();
    assert_eq!(sent_id, response.correlation_id);
}

#[tokio::test]
async fn test_successful_post_request() {
    let mock_server = MockServer::start().await;

    let request_data = TestData {
        id: 0,
        name: "New".to_string(),
    };

    let response_data = TestData {
        id: 1,
        name: "New".to_string(),
    };

    Mock::given(method("POST"))
        .and(path("/test"))
        .respond_with(ResponseTemplate::new(201).set_body_json(&response_data))
        .mount(&mock_server)
        .await;

    let client = builder(&mock_server).build().unwrap();

    let response = client
        .post::<TestData, TestData>("/test", &request_data)
        .await
        .unwrap();

    assert_eq!(response.data, response_data);
    assert_eq!(response.status.as_u16(), 201);

    let received = mock_server.received_requests().await.unwrap();
    let body: TestData = serde_json::from_slice(&received[0].body).unwrap();
    assert_eq!(body, request_data);
}

#[tokio::test]
async fn test_query_params_and_default_headers() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/search"))
        .and(wiremock::matchers::query_param("q", "rust"))
        .and(header("user-agent", "palisade-tests"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"hits": 3})))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = builder(&mock_server)
        .default_header("User-Agent", "palisade-tests")
        .unwrap()
        .build()
        .unwrap();

    let options = RequestOptions::get("/search").with_query_param("q", "rust");
    let response = client.call::<(), Value>(options, None).await.unwrap();
    assert_eq!(response.data["hits"], 3);
}

#[tokio::test]
async fn test_get_served_from_cache() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/cached"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 7, "name": "x"})))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = builder(&mock_server).build().unwrap();

    let first = client.get::<TestData>("/cached").await.unwrap();
    let second = client.get::<TestData>("/cached").await.unwrap();

    assert!(!first.from_cache);
    assert!(second.from_cache);
    assert_eq!(first.data, second.data);
    assert_ne!(first.correlation_id, second.correlation_id);

    let metrics = client.metrics();
    assert_eq!(metrics.cache_hits, 1);
    assert_eq!(metrics.cache_misses, 1);
    assert_eq!(metrics.total_requests, 1);
    assert_eq!(client.cache_stats().size, 1);
}

#[tokio::test]
async fn test_skip_cache_always_dispatches() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/fresh"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(2)
        .mount(&mock_server)
        .await;

    let client = builder(&mock_server).build().unwrap();
    for _ in 0..2 {
        let options = RequestOptions::get("/fresh").without_cache();
        client.call::<(), Value>(options, None).await.unwrap();
    }
    assert_eq!(client.cache_stats().size, 0);
}

#[tokio::test]
async fn test_cache_disabled() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/nocache"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(2)
        .mount(&mock_server)
        .await;

    let client = builder(&mock_server)
        .cache(CacheConfig {
            enabled: false,
            ..CacheConfig::default()
        })
        .build()
        .unwrap();
    client.get::<Value>("/nocache").await.unwrap();
    client.get::<Value>("/nocache").await.unwrap();
}

#[tokio::test]
async fn test_write_invalidates_cached_reads() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/items"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(2)
        .mount(&mock_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/items"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": 1})))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = builder(&mock_server).build().unwrap();

    client.get::<Value>("/items").await.unwrap();
    client
        .post::<_, Value>("/items", &json!({"name": "a"}))
        .await
        .unwrap();
    let after = client.get::<Value>("/items").await.unwrap();
    assert!(!after.from_cache);
}

#[tokio::test]
async fn test_write_leaves_sibling_routes_cached() {
    let mock_server = MockServer::start().await;

    for route in ["/users", "/users/7", "/users2"] {
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(&mock_server)
            .await;
    }
    Mock::given(method("PUT"))
        .and(path("/users"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&mock_server)
        .await;

    let client = builder(&mock_server).build().unwrap();
    for route in ["/users", "/users/7", "/users2"] {
        client.get::<Value>(route).await.unwrap();
    }
    assert_eq!(client.cache_stats().size, 3);

    client
        .put::<_, Value>("/users", &json!({"name": "b"}))
        .await
        .unwrap();
    assert_eq!(client.cache_stats().size, 1);
    assert!(client.get::<Value>("/users2").await.unwrap().from_cache);
    assert!(!client.get::<Value>("/users/7").await.unwrap().from_cache);
}

#[tokio::test]
async fn test_concurrent_identical_requests_share_one_dispatch() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/slow"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"id": 1, "name": "slow"}))
                .set_delay(Duration::from_millis(200)),
        )
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = builder(&mock_server).build().unwrap();
    let options = || RequestOptions::get("/slow").without_cache();

    let (a, b, c) = tokio::join!(
        client.call::<(), TestData>(options(), None),
        client.call::<(), TestData>(options(), None),
        client.call::<(), TestData>(options(), None),
    );

    let a = a.unwrap();
    assert_eq!(a.data, b.unwrap().data);
    assert_eq!(a.data, c.unwrap().data);
    assert_eq!(client.context().dedup.pending_count(), 0);
}

#[tokio::test]
async fn test_in_flight_requests_settle_after_callers_time_out() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({}))
                .set_delay(Duration::from_millis(300)),
        )
        .expect(5)
        .mount(&mock_server)
        .await;

    let client = builder(&mock_server).build().unwrap();
    for i in 0..5 {
        let slow = client.get::<Value>(format!("/reports/{i}"));
        assert!(tokio::time::timeout(Duration::from_millis(20), slow)
            .await
            .is_err());
    }

    tokio::time::sleep(Duration::from_millis(1000)).await;
    assert_eq!(client.context().dedup.pending_count(), 0);
    // The abandoned dispatches completed and populated the cache.
    assert_eq!(client.cache_stats().size, 5);
}

#[tokio::test]
async fn test_posts_are_not_deduplicated() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/orders"))
        .respond_with(
            ResponseTemplate::new(201)
                .set_body_json(json!({}))
                .set_delay(Duration::from_millis(100)),
        )
        .expect(2)
        .mount(&mock_server)
        .await;

    let client = builder(&mock_server).build().unwrap();
    let body = json!({"sku": "a"});
    let (a, b) = tokio::join!(
        client.post::<_, Value>("/orders", &body),
        client.post::<_, Value>("/orders", &body),
    );
    a.unwrap();
    b.unwrap();
}

#[tokio::test]
async fn test_retry_on_5xx_then_success() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/test"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(2)
        .mount(&mock_server)
        .await;

    let response_data = TestData {
        id: 1,
        name: "Success".to_string(),
    };
    Mock::given(method("GET"))
        .and(path("/test"))
        .respond_with(ResponseTemplate::new(200).set_body_json(&response_data))
        .mount(&mock_server)
        .await;

    let client = builder(&mock_server).build().unwrap();

    let response = client.get::<TestData>("/test").await.unwrap();

    assert_eq!(response.data, response_data);
    assert_eq!(response.attempts, 3);
    assert!(response.was_retried());

    let metrics = client.metrics();
    assert_eq!(metrics.retry_attempts, 2);
    assert_eq!(metrics.total_requests, 3);
    assert_eq!(metrics.failed_requests, 2);
}

#[tokio::test]
async fn test_retries_exhausted() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/down"))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .expect(3)
        .mount(&mock_server)
        .await;

    let client = Client::builder()
        .base_url(mock_server.uri())
        .unwrap()
        .retries(fast_retries(2))
        .build()
        .unwrap();

    let error = client.get::<TestData>("/down").await.unwrap_err();
    assert_eq!(error.kind(), Some(ErrorKind::Server));
    assert_eq!(error.status().map(|s| s.as_u16()), Some(503));
    assert_eq!(error.raw_response(), Some("maintenance"));
    assert!(error.correlation_id().is_some());
}

#[tokio::test]
async fn test_client_errors_are_not_retried() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/test"))
        .respond_with(ResponseTemplate::new(404).set_body_string("Not found"))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = builder(&mock_server).build().unwrap();

    let result = client.get::<TestData>("/test").await;

    match result {
        Err(Error::Api(error)) => {
            assert_eq!(error.kind, ErrorKind::Http);
            assert_eq!(error.status.map(|s| s.as_u16()), Some(404));
            assert_eq!(error.details.as_deref(), Some("Not found"));
        }
        _ => panic!("Expected Api error, got {:?}", result),
    }
}

#[tokio::test]
async fn test_custom_retry_predicate() {
    let mock_server = MockServer::start().await;

    struct RetryOn404;

    impl RetryPredicate for RetryOn404 {
        fn should_retry(&self, error: &Error, _attempt: u32) -> bool {
            error.status().map(|s| s.as_u16()) == Some(404)
        }
    }

    let attempt_counter = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempt_counter);

    Mock::given(method("GET"))
        .and(path("/test"))
        .respond_with(move |_: &wiremock::Request| {
            let count = counter.fetch_add(1, Ordering::SeqCst);
            if count < 2 {
                ResponseTemplate::new(404)
            } else {
                ResponseTemplate::new(200).set_body_json(json!({"id": 1, "name": "Found"}))
            }
        })
        .mount(&mock_server)
        .await;

    let client = builder(&mock_server)
        .retry_predicate(Box::new(RetryOn404))
        .build()
        .unwrap();

    let response = client.get::<TestData>("/test").await.unwrap();
    assert_eq!(response.data.name, "Found");
    assert_eq!(attempt_counter.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_rate_limited_request_honours_retry_after() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/limited"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "0"))
        .up_to_n_times(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/limited"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .mount(&mock_server)
        .await;

    // A long backoff that only the Retry-After hint can shortcut.
    let client = Client::builder()
        .base_url(mock_server.uri())
        .unwrap()
        .retries(RetryConfig {
            base_delay: Duration::from_secs(20),
            max_delay: Duration::from_secs(20),
            jitter: false,
            ..RetryConfig::default()
        })
        .build()
        .unwrap();

    let response = tokio::time::timeout(Duration::from_secs(5), client.get::<Value>("/limited"))
        .await
        .expect("Retry-After should override the backoff")
        .unwrap();
    assert_eq!(response.attempts, 2);
    assert_eq!(client.metrics().retry_attempts, 1);
}

#[tokio::test]
async fn test_unauthorized_emits_high_severity_event() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/secret"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = builder(&mock_server).build().unwrap();

    let error = client.get::<Value>("/secret").await.unwrap_err();
    assert_eq!(error.kind(), Some(ErrorKind::Authentication));

    let events = wait_for_events(&client, Some(Severity::High)).await;
    assert_eq!(events.len(), 1);
    assert_eq!(
        events[0].kind,
        SecurityEventKind::AuthenticationFailure { status: 401 }
    );
    assert_eq!(events[0].correlation_id.as_deref(), error.correlation_id());
    assert_eq!(events[0].endpoint.as_deref(), Some("GET /secret"));
}

#[tokio::test]
async fn test_validation_failure_emits_no_event() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/users"))
        .respond_with(ResponseTemplate::new(422).set_body_json(json!({"field": "email"})))
        .mount(&mock_server)
        .await;

    let client = builder(&mock_server).build().unwrap();
    let error = client
        .post::<_, Value>("/users", &json!({"email": "nope"}))
        .await
        .unwrap_err();
    assert_eq!(error.kind(), Some(ErrorKind::Validation));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(client.security_events(None).is_empty());
}

#[tokio::test]
async fn test_circuit_breaker_opens_and_fails_fast() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(500))
        .expect(2)
        .mount(&mock_server)
        .await;

    let client = Client::builder()
        .base_url(mock_server.uri())
        .unwrap()
        .retries(no_retries())
        .circuit_breaker(CircuitBreakerConfig {
            failure_threshold: 2,
            recovery_timeout: Duration::from_secs(60),
            ..CircuitBreakerConfig::default()
        })
        .build()
        .unwrap();

    for _ in 0..2 {
        let error = client
            .call::<(), Value>(RequestOptions::get("/flaky").without_cache(), None)
            .await
            .unwrap_err();
        assert_eq!(error.kind(), Some(ErrorKind::Server));
    }

    let error = client
        .call::<(), Value>(RequestOptions::get("/flaky").without_cache(), None)
        .await
        .unwrap_err();
    assert_eq!(error.kind(), Some(ErrorKind::CircuitOpen));
    assert!(error.status().is_none());

    let stats = client.circuit_breaker_stats();
    assert_eq!(stats["GET /flaky"].state, CircuitState::Open);
    assert_eq!(client.metrics().circuit_breaker_trips, 1);

    let events = wait_for_events(&client, Some(Severity::High)).await;
    assert!(events
        .iter()
        .any(|e| matches!(e.kind, SecurityEventKind::CircuitOpened { failures: 2 })));

    client.reset_circuit_breakers();
    assert!(client.circuit_breaker_stats().is_empty());
}

#[tokio::test]
async fn test_circuit_breaker_probe_closes_circuit() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/recovering"))
        .respond_with(ResponseTemplate::new(502))
        .up_to_n_times(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/recovering"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&mock_server)
        .await;

    let client = Client::builder()
        .base_url(mock_server.uri())
        .unwrap()
        .retries(no_retries())
        .circuit_breaker(CircuitBreakerConfig {
            failure_threshold: 1,
            recovery_timeout: Duration::from_millis(50),
            ..CircuitBreakerConfig::default()
        })
        .build()
        .unwrap();

    assert!(client.get::<Value>("/recovering").await.is_err());
    let blocked = client.get::<Value>("/recovering").await.unwrap_err();
    assert_eq!(blocked.kind(), Some(ErrorKind::CircuitOpen));

    tokio::time::sleep(Duration::from_millis(80)).await;
    client.get::<Value>("/recovering").await.unwrap();
    assert_eq!(
        client.circuit_breaker_stats()["GET /recovering"].state,
        CircuitState::Closed
    );
}

fn fast_breaker(mock_server: &MockServer) -> Client {
    Client::builder()
        .base_url(mock_server.uri())
        .unwrap()
        .retries(no_retries())
        .circuit_breaker(CircuitBreakerConfig {
            failure_threshold: 1,
            recovery_timeout: Duration::from_millis(50),
            ..CircuitBreakerConfig::default()
        })
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_cache_hit_hands_back_half_open_slot() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/prices"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"eur": 1})))
        .up_to_n_times(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/prices"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/prices"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"eur": 2})))
        .mount(&mock_server)
        .await;

    let client = fast_breaker(&mock_server);
    let fresh = || RequestOptions::get("/prices").without_cache();

    client.get::<Value>("/prices").await.unwrap();
    client.call::<(), Value>(fresh(), None).await.unwrap_err();
    tokio::time::sleep(Duration::from_millis(80)).await;

    // Takes the probe slot, then answers from the cache without dispatching.
    let cached = client.get::<Value>("/prices").await.unwrap();
    assert!(cached.from_cache);

    let probed = client.call::<(), Value>(fresh(), None).await.unwrap();
    assert_eq!(probed.data["eur"], 2);
    assert_eq!(
        client.circuit_breaker_stats()["GET /prices"].state,
        CircuitState::Closed
    );
}

#[tokio::test]
async fn test_identical_request_joins_half_open_dispatch() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/stock"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/stock"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"id": 3, "name": "bolts"}))
                .set_delay(Duration::from_millis(150)),
        )
        .mount(&mock_server)
        .await;

    let client = fast_breaker(&mock_server);
    let options = || RequestOptions::get("/stock").without_cache();

    client.call::<(), Value>(options(), None).await.unwrap_err();
    tokio::time::sleep(Duration::from_millis(80)).await;

    let (probe, joined) = tokio::join!(
        client.call::<(), TestData>(options(), None),
        client.call::<(), TestData>(options(), None),
    );
    assert_eq!(probe.unwrap().data, joined.unwrap().data);
    assert_eq!(mock_server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_requests_are_signed() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/signed"))
        .and(header_exists("authorization"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = builder(&mock_server)
        .signing_secret("s3cret")
        .build()
        .unwrap();

    let body = json!({"amount": 10, "currency": "EUR"});
    client.post::<_, Value>("/signed", &body).await.unwrap();

    let received = mock_server.received_requests().await.unwrap();
    let header = received[0]
        .headers
        .get("authorization")
        .unwrap()
        .to_str()
        .unwrap();
    let signature = RequestSignature::parse_header(header).unwrap();
    let sent: Value = serde_json::from_slice(&received[0].body).unwrap();
    let url = format!("{}/signed", mock_server.uri());

    let verifier = RequestSigner::new("s3cret", SignatureAlgorithm::Sha256).unwrap();
    assert!(verifier.verify_signature(&Method::POST, &url, Some(&sent), &signature));

    let impostor = RequestSigner::new("other", SignatureAlgorithm::Sha256).unwrap();
    assert!(!impostor.verify_signature(&Method::POST, &url, Some(&sent), &signature));
}

#[tokio::test]
async fn test_csrf_token_fetched_once_and_attached() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/csrf"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"csrfToken": "tok-1"})))
        .expect(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/profile"))
        .and(header("x-csrf-token", "tok-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(2)
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/profile"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&mock_server)
        .await;

    let client = builder(&mock_server)
        .security(SecurityConfig {
            enable_csrf: true,
            csrf_endpoint: "/csrf".to_string(),
            ..SecurityConfig::default()
        })
        .build()
        .unwrap();

    client.get::<Value>("/profile").await.unwrap();
    client
        .put::<_, Value>("/profile", &json!({"name": "a"}))
        .await
        .unwrap();
    client
        .put::<_, Value>("/profile", &json!({"name": "b"}))
        .await
        .unwrap();

    let received = mock_server.received_requests().await.unwrap();
    let read = received
        .iter()
        .find(|r| r.method.as_str() == "GET" && r.url.path() == "/profile")
        .unwrap();
    assert!(read.headers.get("x-csrf-token").is_none());
}

#[tokio::test]
async fn test_csrf_token_rotated_by_response_header() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/csrf"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": "first"})))
        .expect(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/sessions/1"))
        .and(header("x-csrf-token", "first"))
        .respond_with(ResponseTemplate::new(204).insert_header("x-csrf-token", "second"))
        .expect(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/sessions/2"))
        .and(header("x-csrf-token", "second"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = builder(&mock_server)
        .security(SecurityConfig {
            enable_csrf: true,
            csrf_endpoint: "/csrf".to_string(),
            ..SecurityConfig::default()
        })
        .build()
        .unwrap();

    client.delete::<()>("/sessions/1").await.unwrap();
    client.delete::<()>("/sessions/2").await.unwrap();
}

#[tokio::test]
async fn test_csrf_fetch_failure_proceeds_without_token() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/csrf"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&mock_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/notes"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({})))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = builder(&mock_server)
        .security(SecurityConfig {
            enable_csrf: true,
            csrf_endpoint: "/csrf".to_string(),
            ..SecurityConfig::default()
        })
        .build()
        .unwrap();

    client
        .post::<_, Value>("/notes", &json!({"text": "hello"}))
        .await
        .unwrap();

    let received = mock_server.received_requests().await.unwrap();
    let post = received
        .iter()
        .find(|r| r.method.as_str() == "POST")
        .unwrap();
    assert!(post.headers.get("x-csrf-token").is_none());

    let events = wait_for_events(&client, Some(Severity::Medium)).await;
    assert!(events
        .iter()
        .any(|e| matches!(e.kind, SecurityEventKind::CsrfTokenUnavailable { .. })));
}

#[tokio::test]
async fn test_suspicious_payload_is_sanitized_and_reported() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/comments"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({})))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = builder(&mock_server).build().unwrap();

    client
        .post::<_, Value>(
            "/comments",
            &json!({"text": "<script>alert(1)</script>hello", "author": "sam"}),
        )
        .await
        .unwrap();

    let received = mock_server.received_requests().await.unwrap();
    let sent: Value = serde_json::from_slice(&received[0].body).unwrap();
    let text = sent["text"].as_str().unwrap();
    assert!(!text.contains("<script"));
    assert!(text.contains("hello"));
    assert_eq!(sent["author"], "sam");

    let events = wait_for_events(&client, Some(Severity::High)).await;
    match &events[0].kind {
        SecurityEventKind::SuspiciousPayload { patterns } => {
            assert!(patterns.iter().any(|p| p == "script_tag"));
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn test_sanitization_disabled_sends_payload_verbatim() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/raw"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&mock_server)
        .await;

    let client = builder(&mock_server)
        .security(SecurityConfig {
            enable_sanitization: false,
            ..SecurityConfig::default()
        })
        .build()
        .unwrap();

    let body = json!({"html": "<b onclick=\"x()\">bold</b>"});
    client.post::<_, Value>("/raw", &body).await.unwrap();

    let received = mock_server.received_requests().await.unwrap();
    let sent: Value = serde_json::from_slice(&received[0].body).unwrap();
    assert_eq!(sent, body);
}

#[tokio::test]
async fn test_oversized_payload_is_rejected_before_dispatch() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/upload"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&mock_server)
        .await;

    let client = builder(&mock_server)
        .security(SecurityConfig {
            max_request_size: 64,
            ..SecurityConfig::default()
        })
        .build()
        .unwrap();

    let body = json!({"blob": "x".repeat(200)});
    let error = client.post::<_, Value>("/upload", &body).await.unwrap_err();
    match error {
        Error::PayloadTooLarge { size, limit } => {
            assert!(size > 200);
            assert_eq!(limit, 64);
        }
        other => panic!("expected PayloadTooLarge, got {:?}", other),
    }

    let events = wait_for_events(&client, Some(Severity::High)).await;
    assert!(matches!(
        events[0].kind,
        SecurityEventKind::PayloadTooLarge { limit: 64, .. }
    ));
}

#[tokio::test]
async fn test_deserialization_error() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/test"))
        .respond_with(ResponseTemplate::new(200).set_body_string("invalid json"))
        .mount(&mock_server)
        .await;

    let client = builder(&mock_server).build().unwrap();

    let result = client.get::<TestData>("/test").await;

    match result {
        Err(Error::DeserializationFailed {
            raw_response,
            status,
            ..
        }) => {
            assert_eq!(raw_response, "invalid json");
            assert_eq!(status.as_u16(), 200);
        }
        _ => panic!("Expected DeserializationFailed, got {:?}", result),
    }
}

#[tokio::test]
async fn test_network_error_is_classified_and_reported() {
    let client = Client::builder()
        .base_url("http://127.0.0.1:1")
        .unwrap()
        .retries(no_retries())
        .build()
        .unwrap();

    let error = client.get::<Value>("/anything").await.unwrap_err();
    assert_eq!(error.kind(), Some(ErrorKind::Network));
    assert!(error.status().is_none());

    let events = wait_for_events(&client, Some(Severity::Low)).await;
    assert!(matches!(
        events[0].kind,
        SecurityEventKind::NetworkFailure { .. }
    ));
    assert_eq!(client.metrics().failed_requests, 1);
}

#[tokio::test]
async fn test_timeout_is_classified() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/sluggish"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
        .mount(&mock_server)
        .await;

    let client = Client::builder()
        .base_url(mock_server.uri())
        .unwrap()
        .timeout(Duration::from_millis(50))
        .retries(no_retries())
        .build()
        .unwrap();

    let error = client.get::<Value>("/sluggish").await.unwrap_err();
    assert_eq!(error.kind(), Some(ErrorKind::Timeout));
}

#[tokio::test]
async fn test_health_check_aggregates_endpoints() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&mock_server)
        .await;

    let client = builder(&mock_server)
        .health(HealthConfig {
            endpoints: vec![mock_server.uri(), "http://127.0.0.1:1".to_string()],
            timeout: Duration::from_millis(500),
            ..HealthConfig::default()
        })
        .build()
        .unwrap();

    assert!(client.health_status().is_none());

    let seen = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&seen);
    client.on_health_check(|_| panic!("listener failure must not stop the check"));
    client.on_health_check(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let status = client.force_health_check().await;
    assert_eq!(status.status, HealthState::Degraded);
    assert_eq!(status.endpoints.len(), 2);
    assert_eq!(status.endpoints[0].status, EndpointStatus::Up);
    assert_eq!(status.endpoints[1].status, EndpointStatus::Down);
    assert!(status.endpoints[1].error.is_some());
    assert_eq!(seen.load(Ordering::SeqCst), 1);
    assert!(client.health_status().is_some());
}

#[derive(Default)]
struct RecordingShipper {
    batches: Mutex<Vec<Vec<LogRecord>>>,
}

impl LogShipper for RecordingShipper {
    fn ship<'a>(&'a self, batch: &'a [LogRecord]) -> BoxFuture<'a, palisade::Result<()>> {
        self.batches.lock().unwrap().push(batch.to_vec());
        Box::pin(async { Ok(()) })
    }
}

#[tokio::test]
async fn test_shutdown_ships_security_events() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/admin"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&mock_server)
        .await;

    let shipper = Arc::new(RecordingShipper::default());
    let client = builder(&mock_server)
        .monitoring(MonitoringConfig {
            log_flush_interval: Duration::from_secs(3600),
            ..MonitoringConfig::default()
        })
        .log_shipper(Arc::clone(&shipper) as Arc<dyn LogShipper>)
        .build()
        .unwrap();

    client.get::<Value>("/admin").await.unwrap_err();
    client.shutdown().await;

    let batches = shipper.batches.lock().unwrap();
    let shipped: Vec<&LogRecord> = batches.iter().flatten().collect();
    assert!(shipped.iter().any(|record| matches!(
        record,
        LogRecord::Security(event)
            if event.kind == SecurityEventKind::AuthorizationFailure { status: 403 }
    )));
}

#[tokio::test]
async fn test_terminal_failure_is_shipped_as_log_entry() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/reports"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&mock_server)
        .await;

    let shipper = Arc::new(RecordingShipper::default());
    let client = builder(&mock_server)
        .retries(no_retries())
        .monitoring(MonitoringConfig {
            log_flush_interval: Duration::from_secs(3600),
            ..MonitoringConfig::default()
        })
        .log_shipper(Arc::clone(&shipper) as Arc<dyn LogShipper>)
        .build()
        .unwrap();

    let error = client.get::<Value>("/reports").await.unwrap_err();
    let correlation_id = error.correlation_id().map(str::to_owned);
    client.shutdown().await;

    let batches = shipper.batches.lock().unwrap();
    let entry = batches
        .iter()
        .flatten()
        .find_map(|record| match record {
            LogRecord::Log(entry)
                if entry
                    .context
                    .as_ref()
                    .is_some_and(|context| context.get("endpoint").is_some()) =>
            {
                Some(entry)
            }
            _ => None,
        })
        .expect("failure log entry shipped");
    assert_eq!(entry.correlation_id, correlation_id);
    let context = entry.context.as_ref().unwrap();
    assert_eq!(context["status"], 500);
    assert_eq!(context["endpoint"], "GET /reports");
}

#[tokio::test]
async fn test_alert_raised_after_repeated_high_severity_events() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/locked"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&mock_server)
        .await;

    let client = builder(&mock_server)
        .monitoring(MonitoringConfig {
            alert_threshold: 3,
            ..MonitoringConfig::default()
        })
        .build()
        .unwrap();

    let alerts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&alerts);
    client.on_security_alert(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    for _ in 0..3 {
        client.get::<Value>("/locked").await.unwrap_err();
    }

    let critical = wait_for_events(&client, Some(Severity::Critical)).await;
    assert_eq!(critical.len(), 1);
    assert!(matches!(
        critical[0].kind,
        SecurityEventKind::ThresholdExceeded { count: 3, .. }
    ));

    // Callbacks run just after the alert is recorded.
    for _ in 0..100 {
        if alerts.load(Ordering::SeqCst) > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(alerts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_reset_metrics_and_clear_cache() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/thing"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(2)
        .mount(&mock_server)
        .await;

    let client = builder(&mock_server).build().unwrap();
    client.get::<Value>("/thing").await.unwrap();
    assert_eq!(client.metrics().total_requests, 1);

    client.reset_metrics();
    client.clear_cache();
    assert_eq!(client.metrics(), Default::default());
    assert_eq!(client.success_rate(), 100.0);

    let again = client.get::<Value>("/thing").await.unwrap();
    assert!(!again.from_cache);
}
