//! Voice gateway messages and payloads

use super::VoiceOpCode;
use chat_core::Snowflake;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Frame on the voice gateway WebSocket
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceMessage {
    pub op: VoiceOpCode,
    #[serde(default)]
    pub d: Value,
}

/// op 0
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceIdentify {
    pub server_id: Snowflake,
    pub user_id: Snowflake,
    pub session_id: String,
    pub token: String,
}

/// op 1
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectProtocol {
    pub protocol: String,
    pub data: SelectProtocolData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectProtocolData {
    pub address: String,
    pub port: u16,
    pub mode: String,
}

/// op 2
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceReady {
    pub ssrc: u32,
    pub ip: String,
    pub port: u16,
    pub modes: Vec<String>,
}

/// op 4
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDescription {
    pub mode: String,
    pub secret_key: Vec<u8>,
}

/// op 5
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Speaking {
    /// Bit 0 is microphone audio
    pub speaking: u8,
    pub delay: u32,
    pub ssrc: u32,
}

/// op 7
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceResume {
    pub server_id: Snowflake,
    pub session_id: String,
    pub token: String,
}

/// op 8
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceHello {
    /// Milliseconds; the server sends a float
    pub heartbeat_interval: f64,
}

impl VoiceMessage {
    fn with(op: VoiceOpCode, payload: &impl Serialize) -> Result<Self, serde_json::Error> {
        Ok(Self {
            op,
            d: serde_json::to_value(payload)?,
        })
    }

    pub fn identify(payload: &VoiceIdentify) -> Result<Self, serde_json::Error> {
        Self::with(VoiceOpCode::Identify, payload)
    }

    /// Select UDP with the discovered external address
    pub fn select_protocol(
        address: impl Into<String>,
        port: u16,
        mode: impl Into<String>,
    ) -> Result<Self, serde_json::Error> {
        let payload = SelectProtocol {
            protocol: "udp".to_string(),
            data: SelectProtocolData {
                address: address.into(),
                port,
                mode: mode.into(),
            },
        };
        Self::with(VoiceOpCode::SelectProtocol, &payload)
    }

    /// Heartbeat carrying a nonce the server echoes back
    #[must_use]
    pub fn heartbeat(nonce: u64) -> Self {
        Self {
            op: VoiceOpCode::Heartbeat,
            d: Value::from(nonce),
        }
    }

    pub fn speaking(speaking: bool, ssrc: u32) -> Result<Self, serde_json::Error> {
        let payload = Speaking {
            speaking: u8::from(speaking),
            delay: 0,
            ssrc,
        };
        Self::with(VoiceOpCode::Speaking, &payload)
    }

    pub fn resume(payload: &VoiceResume) -> Result<Self, serde_json::Error> {
        Self::with(VoiceOpCode::Resume, payload)
    }

    /// Decode the payload when the op code matches
    pub fn parse<T: serde::de::DeserializeOwned>(
        &self,
        op: VoiceOpCode,
    ) -> Option<Result<T, serde_json::Error>> {
        (self.op == op).then(|| T::deserialize(&self.d))
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
