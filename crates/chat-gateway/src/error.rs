//! Gateway error types

use crate::protocol::CloseCode;
use chat_common::{ClientError, ErrorOrigin};
use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Errors raised while running a shard
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Transport level failure
    #[error("WebSocket error: {0}")]
    WebSocket(Box<tungstenite::Error>),

    /// Server closed the connection
    #[error("Connection closed ({code}): {reason}")]
    Closed { code: u16, reason: String },

    /// Stream ended without a close frame
    #[error("Connection lost")]
    ConnectionLost,

    /// No Hello arrived after connecting
    #[error("Timed out waiting for Hello")]
    HelloTimeout,

    /// The previous heartbeat was never acknowledged
    #[error("Heartbeat was not acknowledged")]
    HeartbeatTimeout,

    /// Malformed frames kept arriving
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Heartbeat task error: {0}")]
    Heartbeat(#[from] chat_tasks::LoopError),

    /// The shard task is gone
    #[error("Shard is not running")]
    ShardStopped,

    #[error("Shard {0} is not managed here")]
    ShardNotFound(u32),
}

impl GatewayError {
    /// Gateway close code carried by this error, if any
    #[must_use]
    pub fn close_code(&self) -> Option<CloseCode> {
        match self {
            Self::Closed { code, .. } => CloseCode::from_u16(*code),
            _ => None,
        }
    }

    /// Errors that must not be retried
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        self.close_code().is_some_and(CloseCode::is_fatal)
    }
}

impl From<tungstenite::Error> for GatewayError {
    fn from(err: tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(err))
    }
}

/// A gateway error tagged with the shard it came from
#[derive(Debug, Error)]
#[error("shard {shard_id}: {source}")]
pub struct ShardError {
    pub shard_id: u32,
    #[source]
    pub source: GatewayError,
}

impl ShardError {
    #[must_use]
    pub fn new(shard_id: u32, source: GatewayError) -> Self {
        Self { shard_id, source }
    }
}

impl From<ShardError> for ClientError {
    fn from(err: ShardError) -> Self {
        let origin = ErrorOrigin::Gateway {
            shard_id: err.shard_id,
        };
        let message = err.source.to_string();

        match err.source.close_code() {
            Some(CloseCode::AuthenticationFailed) => {
                return ClientError::Authentication { origin, message }
            }
            Some(code) if code.is_fatal() => return ClientError::Config { origin, message },
            _ => {}
        }

        match err.source {
            GatewayError::ProtocolViolation(_) | GatewayError::Serialization(_) => {
                ClientError::ProtocolViolation { origin, message }
            }
            GatewayError::Heartbeat(_) => ClientError::Config { origin, message },
            _ => ClientError::Transport { origin, message },
        }
    }
}

/// Gateway result type
pub type GatewayResult<T> = Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn closed(code: u16) -> GatewayError {
        GatewayError::Closed {
            code,
            reason: String::new(),
        }
    }

    #[test]
    fn test_fatal_close_codes() {
        assert!(closed(4004).is_fatal());
        assert!(closed(4014).is_fatal());
        assert!(!closed(4000).is_fatal());
        assert!(!closed(1006).is_fatal());
        assert!(!GatewayError::HeartbeatTimeout.is_fatal());
    }

    #[test]
    fn test_authentication_maps_to_client_error() {
        let err: ClientError = ShardError::new(2, closed(4004)).into();
        assert!(matches!(err, ClientError::Authentication { .. }));
        assert_eq!(err.origin(), ErrorOrigin::Gateway { shard_id: 2 });
        assert!(err.is_fatal());
    }

    #[test]
    fn test_sharding_misconfiguration_maps_to_config() {
        let err: ClientError = ShardError::new(0, closed(4011)).into();
        assert!(matches!(err, ClientError::Config { .. }));
    }

    #[test]
    fn test_transport_errors_are_retryable() {
        let err: ClientError = ShardError::new(1, GatewayError::ConnectionLost).into();
        assert!(matches!(err, ClientError::Transport { .. }));
        assert!(err.is_retryable());

        let err: ClientError =
            ShardError::new(1, GatewayError::ProtocolViolation("bad frame".into())).into();
        assert!(matches!(err, ClientError::ProtocolViolation { .. }));
    }
}
