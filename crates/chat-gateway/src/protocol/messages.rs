//! Gateway message format
//!
//! Every frame on the gateway WebSocket is a JSON object of this shape.

use super::{
    HelloPayload, IdentifyPayload, OpCode, PresenceUpdatePayload, RequestGuildMembersPayload,
    ResumePayload, VoiceStateUpdatePayload,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Gateway message format
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayMessage {
    /// Operation code
    pub op: OpCode,

    /// Event name (only for op=0 Dispatch)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,

    /// Sequence number (only for op=0 Dispatch)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,

    /// Event data payload; always present on the wire, possibly `null`
    #[serde(default)]
    pub d: Value,
}

impl GatewayMessage {
    fn command(op: OpCode, payload: &impl Serialize) -> Result<Self, serde_json::Error> {
        Ok(Self {
            op,
            t: None,
            s: None,
            d: serde_json::to_value(payload)?,
        })
    }

    // === Client Messages ===

    /// Create a Heartbeat message (op=1) carrying the last seen sequence
    #[must_use]
    pub fn heartbeat(last_sequence: Option<u64>) -> Self {
        Self {
            op: OpCode::Heartbeat,
            t: None,
            s: None,
            d: last_sequence.map_or(Value::Null, Value::from),
        }
    }

    /// Create an Identify message (op=2)
    pub fn identify(payload: &IdentifyPayload) -> Result<Self, serde_json::Error> {
        Self::command(OpCode::Identify, payload)
    }

    /// Create a Presence Update message (op=3)
    pub fn presence_update(payload: &PresenceUpdatePayload) -> Result<Self, serde_json::Error> {
        Self::command(OpCode::PresenceUpdate, payload)
    }

    /// Create a Voice State Update message (op=4)
    pub fn voice_state_update(
        payload: &VoiceStateUpdatePayload,
    ) -> Result<Self, serde_json::Error> {
        Self::command(OpCode::VoiceStateUpdate, payload)
    }

    /// Create a Resume message (op=6)
    pub fn resume(payload: &ResumePayload) -> Result<Self, serde_json::Error> {
        Self::command(OpCode::Resume, payload)
    }

    /// Create a Request Guild Members message (op=8)
    pub fn request_guild_members(
        payload: &RequestGuildMembersPayload,
    ) -> Result<Self, serde_json::Error> {
        Self::command(OpCode::RequestGuildMembers, payload)
    }

    // === Parsing Server Messages ===

    /// Try to parse as a Hello payload (op=10)
    pub fn as_hello(&self) -> Option<HelloPayload> {
        if self.op != OpCode::Hello {
            return None;
        }
        serde_json::from_value(self.d.clone()).ok()
    }

    /// Whether an Invalid Session (op=9) allows resuming
    ///
    /// Returns `None` for any other op code.
    pub fn as_invalid_session(&self) -> Option<bool> {
        if self.op != OpCode::InvalidSession {
            return None;
        }
        Some(self.d.as_bool().unwrap_or(false))
    }

    // === Utilities ===

    /// Serialize to JSON string
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

impl std::fmt::Display for GatewayMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(t) = &self.t {
            write!(f, "GatewayMessage(op={}, t={}", self.op, t)?;
            if let Some(s) = self.s {
                write!(f, ", s={s}")?;
            }
            write!(f, ")")
        } else {
            write!(f, "GatewayMessage(op={})", self.op)
        }
    }
}

/// Commands a caller can send through a running shard
#[derive(Debug, Clone)]
pub enum GatewayCommand {
    PresenceUpdate(PresenceUpdatePayload),
    VoiceStateUpdate(VoiceStateUpdatePayload),
    RequestGuildMembers(RequestGuildMembersPayload),
}

impl GatewayCommand {
    /// Op code this command is sent with
    #[must_use]
    pub const fn op(&self) -> OpCode {
        match self {
            Self::PresenceUpdate(_) => OpCode::PresenceUpdate,
            Self::VoiceStateUpdate(_) => OpCode::VoiceStateUpdate,
            Self::RequestGuildMembers(_) => OpCode::RequestGuildMembers,
        }
    }

    /// Encode into a wire message
    pub fn to_message(&self) -> Result<GatewayMessage, serde_json::Error> {
        match self {
            Self::PresenceUpdate(p) => GatewayMessage::presence_update(p),
            Self::VoiceStateUpdate(p) => GatewayMessage::voice_state_update(p),
            Self::RequestGuildMembers(p) => GatewayMessage::request_guild_members(p),
        }
    }
}
