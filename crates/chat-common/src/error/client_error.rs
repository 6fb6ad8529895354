//! Client error types
//!
//! The taxonomy surfaced to callers once local recovery (reconnect, resume,
//! bucket waits, retries) has been exhausted or a fatal condition is hit.

use chat_core::Snowflake;
use std::fmt;

/// Subsystem and session an error originated from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorOrigin {
    /// A gateway shard
    Gateway { shard_id: u32 },
    /// A voice session for a guild
    Voice { guild_id: Snowflake },
    /// The REST dispatcher
    Http,
    /// Client setup, before any subsystem started
    Client,
}

impl fmt::Display for ErrorOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gateway { shard_id } => write!(f, "gateway shard {shard_id}"),
            Self::Voice { guild_id } => write!(f, "voice guild {guild_id}"),
            Self::Http => f.write_str("http"),
            Self::Client => f.write_str("client"),
        }
    }
}

/// Client-wide error type
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Connection dropped outside of a deliberate teardown and could not be recovered
    #[error("[{origin}] transport error: {message}")]
    Transport { origin: ErrorOrigin, message: String },

    /// Malformed or out-of-sequence payload that kept recurring
    #[error("[{origin}] protocol violation: {message}")]
    ProtocolViolation { origin: ErrorOrigin, message: String },

    /// Credentials rejected; never retried
    #[error("[{origin}] authentication failed: {message}")]
    Authentication { origin: ErrorOrigin, message: String },

    /// Bounded rate-limit retries were exhausted
    #[error("[{origin}] rate limit exceeded on {route} (retry after {retry_after:.3}s)")]
    RateLimitExceeded {
        origin: ErrorOrigin,
        route: String,
        retry_after: f64,
    },

    /// Non-retryable 4xx response
    #[error("[{origin}] {status} {message} (code {code})")]
    HttpClient {
        origin: ErrorOrigin,
        status: u16,
        code: u32,
        message: String,
    },

    /// 5xx response after bounded retries
    #[error("[{origin}] server error {status}: {message}")]
    HttpServer {
        origin: ErrorOrigin,
        status: u16,
        message: String,
    },

    /// Encryption mode mismatch or handshake timeout; fatal to that voice session only
    #[error("[{origin}] voice negotiation failed: {message}")]
    VoiceNegotiation { origin: ErrorOrigin, message: String },

    /// Invalid client configuration
    #[error("[{origin}] configuration error: {message}")]
    Config { origin: ErrorOrigin, message: String },
}

impl ClientError {
    /// Subsystem and session this error came from
    #[must_use]
    pub fn origin(&self) -> ErrorOrigin {
        match self {
            Self::Transport { origin, .. }
            | Self::ProtocolViolation { origin, .. }
            | Self::Authentication { origin, .. }
            | Self::RateLimitExceeded { origin, .. }
            | Self::HttpClient { origin, .. }
            | Self::HttpServer { origin, .. }
            | Self::VoiceNegotiation { origin, .. }
            | Self::Config { origin, .. } => *origin,
        }
    }

    /// Whether retrying the same operation later could succeed
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. } | Self::RateLimitExceeded { .. } | Self::HttpServer { .. }
        )
    }

    /// Whether this error can never be fixed by retrying
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Authentication { .. } | Self::Config { .. })
    }

    /// Get a stable error code for logs
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Transport { .. } => "TRANSPORT",
            Self::ProtocolViolation { .. } => "PROTOCOL_VIOLATION",
            Self::Authentication { .. } => "AUTHENTICATION",
            Self::RateLimitExceeded { .. } => "RATE_LIMIT_EXCEEDED",
            Self::HttpClient { .. } => "HTTP_CLIENT",
            Self::HttpServer { .. } => "HTTP_SERVER",
            Self::VoiceNegotiation { .. } => "VOICE_NEGOTIATION",
            Self::Config { .. } => "CONFIG",
        }
    }
}

/// Result type using [`ClientError`]
pub type ClientResult<T> = Result<T, ClientError>;
