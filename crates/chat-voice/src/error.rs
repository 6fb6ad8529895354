//! Voice error types

use crate::protocol::{close_action, CloseAction, VoiceCloseCode};
use chat_common::{ClientError, ErrorOrigin};
use chat_core::Snowflake;
use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Errors raised by a voice session
#[derive(Debug, Error)]
pub enum VoiceError {
    #[error("WebSocket error: {0}")]
    WebSocket(Box<tungstenite::Error>),

    #[error("Voice gateway closed ({code}): {reason}")]
    Closed { code: u16, reason: String },

    #[error("Voice connection lost")]
    ConnectionLost,

    #[error("Voice heartbeat not acknowledged")]
    HeartbeatTimeout,

    #[error("UDP error: {0}")]
    Io(#[from] std::io::Error),

    /// A handshake step did not finish in time
    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    /// The server offered nothing usable
    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    #[error("Unexpected voice payload: {0}")]
    Protocol(String),

    #[error("Encryption failed")]
    Crypto,

    /// PCM audio given without an encoder
    #[error("No audio encoder available for PCM source")]
    MissingEncoder,

    #[error("Encoder error: {0}")]
    Encoder(String),

    #[error("Audio is already playing")]
    AlreadyPlaying,

    #[error("Voice connection is closed")]
    NotConnected,

    /// Voice support is switched off in the configuration
    #[error("Voice is disabled")]
    Disabled,

    /// The playback task panicked or was cancelled
    #[error("Playback task failed: {0}")]
    Playback(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Heartbeat task error: {0}")]
    Heartbeat(#[from] chat_tasks::LoopError),

    /// The gateway refused the voice state update
    #[error("Gateway error: {0}")]
    Gateway(#[from] chat_gateway::GatewayError),
}

impl VoiceError {
    /// Close code carried by this error, if any
    #[must_use]
    pub fn close_code(&self) -> Option<VoiceCloseCode> {
        match self {
            Self::Closed { code, .. } => VoiceCloseCode::from_u16(*code),
            _ => None,
        }
    }

    /// How the session reacts when its voice gateway fails with this error
    #[must_use]
    pub fn action(&self) -> CloseAction {
        match self {
            Self::Closed { code, .. } => close_action(*code),
            Self::WebSocket(_) | Self::ConnectionLost | Self::HeartbeatTimeout | Self::Io(_) => {
                CloseAction::Resume
            }
            _ => CloseAction::Fatal,
        }
    }
}

impl From<tungstenite::Error> for VoiceError {
    fn from(err: tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(err))
    }
}

/// A voice error tagged with the guild of the session
#[derive(Debug, Error)]
#[error("voice guild {guild_id}: {source}")]
pub struct VoiceSessionError {
    pub guild_id: Snowflake,
    #[source]
    pub source: VoiceError,
}

impl VoiceSessionError {
    #[must_use]
    pub fn new(guild_id: Snowflake, source: VoiceError) -> Self {
        Self { guild_id, source }
    }
}

impl From<VoiceSessionError> for ClientError {
    fn from(err: VoiceSessionError) -> Self {
        let origin = ErrorOrigin::Voice {
            guild_id: err.guild_id,
        };
        let message = err.source.to_string();

        if err.source.close_code() == Some(VoiceCloseCode::AuthenticationFailed) {
            return ClientError::Authentication { origin, message };
        }

        match err.source {
            VoiceError::Negotiation(_)
            | VoiceError::Timeout(_)
            | VoiceError::Crypto
            | VoiceError::Closed { .. } => ClientError::VoiceNegotiation { origin, message },
            VoiceError::Protocol(_) | VoiceError::Serialization(_) => {
                ClientError::ProtocolViolation { origin, message }
            }
            VoiceError::MissingEncoder | VoiceError::Disabled | VoiceError::Heartbeat(_) => {
                ClientError::Config { origin, message }
            }
            _ => ClientError::Transport { origin, message },
        }
    }
}

/// Voice result type
pub type VoiceResult<T> = Result<T, VoiceError>;
