//! Rate Limit Integration Tests
//!
//! Drives the REST client against a mock server that answers 429.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::time::{Duration, Instant};

use serde_json::{Value, json};
use session_sync::application::ports::SourceError;
use session_sync::infrastructure::http::{ApiClient, HttpSettings, RateLimitConfig};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client(server: &MockServer, max_retries: u32, cancel: CancellationToken) -> ApiClient {
    let settings = HttpSettings {
        timeout: Duration::from_secs(5),
        rate_limit: RateLimitConfig {
            max_retries,
            base_delay: Duration::from_millis(5),
        },
    };
    ApiClient::new(
        &server.uri(),
        &[("x-emby-token", "secret".to_string())],
        settings,
        cancel,
    )
    .unwrap()
}

#[tokio::test]
async fn retries_after_429_then_succeeds() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/Sessions"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
        .up_to_n_times(1)
        .with_priority(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/Sessions"))
        .and(header("x-emby-token", "secret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"Id": "a"}])))
        .expect(1)
        .mount(&server)
        .await;

    let body: Value = client(&server, 3, CancellationToken::new())
        .get_json("/Sessions")
        .await
        .unwrap();
    assert_eq!(body[0]["Id"], "a");
}

#[tokio::test]
async fn gives_up_after_max_retries() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/Sessions"))
        .respond_with(ResponseTemplate::new(429))
        .expect(3)
        .mount(&server)
        .await;

    let started = Instant::now();
    let err = client(&server, 2, CancellationToken::new())
        .get_ok("/Sessions")
        .await
        .unwrap_err();

    assert_eq!(err, SourceError::RateLimited { retries: 2 });
    // 5ms + 10ms of backoff.
    assert!(started.elapsed() >= Duration::from_millis(15));
}

#[tokio::test]
async fn other_errors_are_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/Sessions"))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .expect(1)
        .mount(&server)
        .await;

    let err = client(&server, 3, CancellationToken::new())
        .get_ok("/Sessions")
        .await
        .unwrap_err();
    assert_eq!(
        err,
        SourceError::Status {
            status: 503,
            body: "maintenance".to_string()
        }
    );
}

#[tokio::test]
async fn cancellation_interrupts_backoff() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/Sessions"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "30"))
        .mount(&server)
        .await;

    let cancel = CancellationToken::new();
    let api = client(&server, 3, cancel.clone());
    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
    });

    let started = Instant::now();
    let err = api.get_ok("/Sessions").await.unwrap_err();
    assert_eq!(err, SourceError::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(5));
    canceller.await.unwrap();
}
