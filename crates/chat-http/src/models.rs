//! Response bodies the dispatcher decodes itself

use serde::{Deserialize, Serialize};
use std::fmt;

/// `GET /gateway`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayInfo {
    pub url: String,
}

/// `GET /gateway/bot`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayBotInfo {
    pub url: String,
    /// Recommended shard count
    pub shards: u32,
    pub session_start_limit: SessionStartLimit,
}

/// Identify budget for the current token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStartLimit {
    pub total: u32,
    pub remaining: u32,
    /// Milliseconds until `remaining` resets
    pub reset_after: u64,
    /// Identify requests allowed per 5 seconds
    pub max_concurrency: u32,
}

impl Default for SessionStartLimit {
    fn default() -> Self {
        Self {
            total: 1000,
            remaining: 1000,
            reset_after: 0,
            max_concurrency: 1,
        }
    }
}

/// Error body returned with 4xx responses
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiErrorBody {
    #[serde(default)]
    pub code: u32,
    #[serde(default)]
    pub message: String,
    /// Nested per-field validation errors
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<serde_json::Value>,
}

impl ApiErrorBody {
    /// Decode a body, falling back to the raw text as the message
    pub fn from_bytes(body: &[u8]) -> Self {
        serde_json::from_slice(body).unwrap_or_else(|_| Self {
            code: 0,
            message: String::from_utf8_lossy(body).into_owned(),
            errors: None,
        })
    }
}

impl fmt::Display for ApiErrorBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (error code: {})", self.message, self.code)
    }
}

/// Body of a 429 response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitedBody {
    #[serde(default)]
    pub message: String,
    /// Seconds to wait
    pub retry_after: f64,
    #[serde(default)]
    pub global: bool,
}
