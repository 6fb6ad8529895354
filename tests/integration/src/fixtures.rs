//! Test fixtures and data generators
//!
//! Provides reusable configs and payloads for integration tests.

use std::sync::Arc;
use std::time::Duration;

use chat_common::{ClientConfig, HttpConfig, ReconnectConfig};
use chat_gateway::{IdentifyQueue, ShardConfig};
use serde_json::{json, Value};

/// Reconnect settings short enough for tests
pub fn fast_reconnect() -> ReconnectConfig {
    ReconnectConfig {
        initial_delay_ms: 10,
        max_delay_ms: 50,
        jitter_ratio: 0.0,
    }
}

/// Shard 0 of 1 against `gateway_url`, with fast reconnects
pub fn shard_config(gateway_url: &str) -> ShardConfig {
    ShardConfig::new("test-token", gateway_url)
        .with_reconnect(fast_reconnect())
        .with_invalid_session_delay(Duration::from_millis(10), Duration::from_millis(20))
}

/// Single-bucket identify queue with a short spacing
pub fn identify_queue() -> Arc<IdentifyQueue> {
    Arc::new(IdentifyQueue::with_interval(1, Duration::from_millis(10)))
}

/// HTTP settings pointing at a mock API
pub fn http_config(api_base: &str) -> HttpConfig {
    HttpConfig {
        api_base: api_base.to_string(),
        max_retries: 3,
        server_error_backoff_ms: 10,
        ..HttpConfig::default()
    }
}

/// Client settings pointing at a mock API, voice off
pub fn client_config(api_base: &str) -> ClientConfig {
    let mut config = ClientConfig::new("test-token");
    config.http = http_config(api_base);
    config.reconnect = fast_reconnect();
    config.voice.enabled = false;
    config
}

/// `GET /gateway/bot` body
pub fn gateway_bot(url: &str, shards: u32, max_concurrency: u32) -> Value {
    json!({
        "url": url,
        "shards": shards,
        "session_start_limit": {
            "total": 1000,
            "remaining": 999,
            "reset_after": 14_400_000,
            "max_concurrency": max_concurrency,
        },
    })
}

/// MESSAGE_CREATE data
pub fn message_create(id: u64, channel_id: u64, content: &str) -> Value {
    json!({
        "id": id.to_string(),
        "channel_id": channel_id.to_string(),
        "content": content,
        "author": {"id": "7", "username": "someone"},
    })
}

/// Error body returned with 4xx responses
pub fn api_error(code: u32, message: &str) -> Value {
    json!({"code": code, "message": message})
}
