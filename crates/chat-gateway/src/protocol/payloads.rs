//! Payload definitions
//!
//! Data carried in the `d` field of gateway messages, in both directions.

use crate::Intents;
use chat_core::Snowflake;
use serde::{Deserialize, Serialize};

/// Payload for op 10 (Hello)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloPayload {
    /// Heartbeat interval in milliseconds
    pub heartbeat_interval: u64,
}

/// Payload for op 2 (Identify)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentifyPayload {
    pub token: String,
    pub properties: IdentifyProperties,
    pub intents: Intents,
    /// `[shard_id, shard_count]`
    pub shard: [u32; 2],
    pub large_threshold: u16,
    pub compress: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence: Option<PresenceUpdatePayload>,
}

/// Client connection properties
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentifyProperties {
    pub os: String,
    pub browser: String,
    pub device: String,
}

impl IdentifyProperties {
    /// Library name reported as browser and device
    pub const LIBRARY: &'static str = "chat-client";

    /// Set operating system
    #[must_use]
    pub fn with_os(mut self, os: impl Into<String>) -> Self {
        self.os = os.into();
        self
    }

    /// Set browser
    #[must_use]
    pub fn with_browser(mut self, browser: impl Into<String>) -> Self {
        self.browser = browser.into();
        self
    }

    /// Set device type
    #[must_use]
    pub fn with_device(mut self, device: impl Into<String>) -> Self {
        self.device = device.into();
        self
    }
}

impl Default for IdentifyProperties {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            browser: Self::LIBRARY.to_string(),
            device: Self::LIBRARY.to_string(),
        }
    }
}

/// Online status shown to other users
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Online,
    Idle,
    Dnd,
    Invisible,
    Offline,
}

/// Activity shown under the user's name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Activity {
    pub name: String,
    /// 0 playing, 1 streaming, 2 listening, 3 watching, 4 custom, 5 competing
    #[serde(rename = "type")]
    pub kind: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl Activity {
    #[must_use]
    pub fn playing(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: 0,
            url: None,
        }
    }

    #[must_use]
    pub fn listening(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: 2,
            url: None,
        }
    }
}

/// Payload for op 3 (Presence Update), also embedded in Identify
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PresenceUpdatePayload {
    /// Unix millis since the client went idle
    pub since: Option<u64>,
    pub activities: Vec<Activity>,
    pub status: Status,
    pub afk: bool,
}

impl PresenceUpdatePayload {
    #[must_use]
    pub fn new(status: Status) -> Self {
        Self {
            status,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_activity(mut self, activity: Activity) -> Self {
        self.activities.push(activity);
        self
    }
}

/// Payload for op 6 (Resume)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumePayload {
    pub token: String,
    pub session_id: String,
    /// Last received sequence number
    pub seq: u64,
}

/// Payload for op 4 (Voice State Update)
///
/// A `None` channel leaves voice; it is sent as an explicit `null`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceStateUpdatePayload {
    pub guild_id: Snowflake,
    pub channel_id: Option<Snowflake>,
    pub self_mute: bool,
    pub self_deaf: bool,
}

impl VoiceStateUpdatePayload {
    /// Join or move to a channel
    #[must_use]
    pub fn join(guild_id: Snowflake, channel_id: Snowflake) -> Self {
        Self {
            guild_id,
            channel_id: Some(channel_id),
            self_mute: false,
            self_deaf: false,
        }
    }

    /// Leave voice in a guild
    #[must_use]
    pub fn leave(guild_id: Snowflake) -> Self {
        Self {
            guild_id,
            channel_id: None,
            self_mute: false,
            self_deaf: false,
        }
    }
}

/// Payload for op 8 (Request Guild Members)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestGuildMembersPayload {
    pub guild_id: Snowflake,
    /// Username prefix; empty string with limit 0 requests everyone
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    pub limit: u32,
    #[serde(default)]
    pub presences: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_ids: Option<Vec<Snowflake>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

impl RequestGuildMembersPayload {
    /// Request members whose username starts with `query`
    #[must_use]
    pub fn query(guild_id: Snowflake, query: impl Into<String>, limit: u32) -> Self {
        Self {
            guild_id,
            query: Some(query.into()),
            limit,
            presences: false,
            user_ids: None,
            nonce: None,
        }
    }

    /// Request specific members by id
    #[must_use]
    pub fn users(guild_id: Snowflake, user_ids: Vec<Snowflake>) -> Self {
        Self {
            guild_id,
            query: None,
            limit: 0,
            presences: false,
            user_ids: Some(user_ids),
            nonce: None,
        }
    }
}

/// Minimal user object carried by READY
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadyUser {
    pub id: Snowflake,
    #[serde(default)]
    pub username: String,
}

/// The fields of READY the session needs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadyPayload {
    pub session_id: String,
    #[serde(default)]
    pub resume_gateway_url: Option<String>,
    pub user: ReadyUser,
}

/// VOICE_STATE_UPDATE dispatch data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceStateEvent {
    #[serde(default)]
    pub guild_id: Option<Snowflake>,
    pub channel_id: Option<Snowflake>,
    pub user_id: Snowflake,
    pub session_id: String,
}

/// VOICE_SERVER_UPDATE dispatch data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceServerEvent {
    pub guild_id: Snowflake,
    pub token: String,
    /// `None` while the voice server is being reallocated
    pub endpoint: Option<String>,
}
