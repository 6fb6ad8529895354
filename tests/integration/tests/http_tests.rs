//! REST dispatcher tests against a mock API
//!
//! Run with: cargo test -p integration-tests --test http_tests

use std::time::Duration;

use chat_common::ClientError;
use chat_core::Snowflake;
use chat_http::{HttpClient, HttpError, Method, RequestOptions, Route};
use integration_tests::{api_error, http_config, MockApi, MockResponse};
use serde_json::{json, Value};

fn client(api: &MockApi) -> HttpClient {
    HttpClient::new("test-token", http_config(&api.base_url())).unwrap()
}

fn messages(channel_id: u64) -> Route {
    Route::new(Method::GET, "/channels/{channel_id}/messages").channel_id(Snowflake::new(channel_id))
}

// ============================================================================
// Buckets
// ============================================================================

#[tokio::test]
async fn test_depleted_bucket_waits_for_reset() {
    let api = MockApi::start().await.unwrap();
    api.push(
        "/channels/1/messages",
        MockResponse::json(json!([]))
            .header("x-ratelimit-limit", "5")
            .header("x-ratelimit-remaining", "0")
            .header("x-ratelimit-reset-after", "0.05")
            .header("x-ratelimit-bucket", "abcd"),
    );
    let http = client(&api);

    let _: Value = http.request(messages(1), RequestOptions::default()).await.unwrap();
    let _: Value = http.request(messages(1), RequestOptions::default()).await.unwrap();

    let requests = api.requests_to("/channels/1/messages");
    assert_eq!(requests.len(), 2);
    let gap = requests[1].received_at - requests[0].received_at;
    assert!(gap >= Duration::from_millis(50), "second request came after {gap:?}");
    assert_eq!(requests[0].authorization.as_deref(), Some("Bot test-token"));
}

#[tokio::test]
async fn test_major_parameters_do_not_share_a_bucket() {
    let api = MockApi::start().await.unwrap();
    for channel in ["/channels/1/messages", "/channels/2/messages"] {
        api.push(
            channel,
            MockResponse::json(json!([]))
                .header("x-ratelimit-remaining", "0")
                .header("x-ratelimit-reset-after", "2"),
        );
    }
    let http = client(&api);

    // Channel 2 must not wait out the reset learned on channel 1
    let _: Value = http.request(messages(1), RequestOptions::default()).await.unwrap();
    let started = tokio::time::Instant::now();
    let _: Value = http.request(messages(2), RequestOptions::default()).await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(http.rate_limiter().bucket_count(), 2);
}

// ============================================================================
// 429 handling
// ============================================================================

#[tokio::test]
async fn test_rate_limited_request_is_retried() {
    let api = MockApi::start().await.unwrap();
    api.push("/channels/1/messages", MockResponse::rate_limited(0.05, false));
    api.push("/channels/1/messages", MockResponse::json(json!([{"id": "9"}])));
    let http = client(&api);

    let body: Value = http.request(messages(1), RequestOptions::default()).await.unwrap();
    assert_eq!(body[0]["id"], "9");

    let requests = api.requests_to("/channels/1/messages");
    assert_eq!(requests.len(), 2);
    assert!(requests[1].received_at - requests[0].received_at >= Duration::from_millis(50));
}

#[tokio::test]
async fn test_global_rate_limit_pauses_other_routes() {
    let api = MockApi::start().await.unwrap();
    api.push("/channels/1/messages", MockResponse::rate_limited(0.2, true));
    api.push("/channels/1/messages", MockResponse::json(json!([])));
    api.push("/users/@me", MockResponse::json(json!({"id": "42"})));
    let http = client(&api);

    let limited = {
        let http = http.clone();
        tokio::spawn(async move {
            http.request::<Value>(messages(1), RequestOptions::default())
                .await
        })
    };
    assert!(
        integration_tests::eventually(Duration::from_secs(2), || {
            http.rate_limiter().is_globally_locked()
        })
        .await
    );

    let me: Value = http
        .request(Route::new(Method::GET, "/users/@me"), RequestOptions::default())
        .await
        .unwrap();
    assert_eq!(me["id"], "42");
    limited.await.unwrap().unwrap();

    let first = api.requests_to("/channels/1/messages")[0].received_at;
    let other = api.requests_to("/users/@me")[0].received_at;
    assert!(other - first >= Duration::from_millis(200));
}

#[tokio::test]
async fn test_rate_limit_exhausting_retries_surfaces() {
    let api = MockApi::start().await.unwrap();
    api.push("/channels/1/messages", MockResponse::rate_limited(0.01, false));
    let http = client(&api);

    let err = http
        .request::<Value>(messages(1), RequestOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, HttpError::RateLimited { global: false, .. }));
    // One attempt plus three retries
    assert_eq!(api.requests_to("/channels/1/messages").len(), 4);

    let err = ClientError::from(err);
    assert!(matches!(err, ClientError::RateLimitExceeded { .. }));
    assert!(err.is_retryable());
}

// ============================================================================
// Errors
// ============================================================================

#[tokio::test]
async fn test_client_errors_fail_without_retry() {
    let api = MockApi::start().await.unwrap();
    api.push(
        "/channels/1/messages",
        MockResponse::status(404, api_error(10003, "Unknown Channel")),
    );
    api.push(
        "/channels/2/messages",
        MockResponse::status(401, api_error(0, "401: Unauthorized")),
    );
    let http = client(&api);

    let err = http
        .request::<Value>(messages(1), RequestOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.status(), Some(404));
    assert_eq!(err.api_error().map(|body| body.code), Some(10003));
    assert_eq!(api.requests_to("/channels/1/messages").len(), 1);

    let err = http
        .request::<Value>(messages(2), RequestOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, HttpError::Unauthorized(_)));
    assert!(ClientError::from(err).is_fatal());
}

#[tokio::test]
async fn test_server_errors_back_off_then_surface() {
    let api = MockApi::start().await.unwrap();
    api.push("/channels/1/messages", MockResponse::status(502, json!("bad gateway")));
    let http = client(&api);

    let err = http
        .request::<Value>(messages(1), RequestOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, HttpError::Server { status: 502, .. }));

    let requests = api.requests_to("/channels/1/messages");
    assert_eq!(requests.len(), 4);
    // Backoff of 10ms * (1 + 2n) between attempts
    assert!(requests[1].received_at - requests[0].received_at >= Duration::from_millis(10));
    assert!(requests[3].received_at - requests[2].received_at >= Duration::from_millis(50));
}

#[tokio::test]
async fn test_gateway_bot_decodes() {
    let api = MockApi::start().await.unwrap();
    api.push(
        "/gateway/bot",
        MockResponse::json(integration_tests::gateway_bot("wss://gateway.example", 4, 2)),
    );
    let http = client(&api);

    let info = http.get_gateway_bot().await.unwrap();
    assert_eq!(info.url, "wss://gateway.example");
    assert_eq!(info.shards, 4);
    assert_eq!(info.session_start_limit.max_concurrency, 2);
    assert_eq!(api.requests()[0].method, Method::GET);
}
