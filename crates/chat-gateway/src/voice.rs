//! Voice credential handoff
//!
//! Shards forward the two halves of a voice session's credentials, plus a
//! notice when the gateway session they belong to was lost.

use chat_core::Snowflake;

/// Signal relayed from a shard to the voice manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoiceSignal {
    /// The own user's voice state changed
    StateUpdate {
        guild_id: Snowflake,
        channel_id: Option<Snowflake>,
        user_id: Snowflake,
        session_id: String,
    },
    /// Voice server credentials; `endpoint` is `None` while the server is reallocated
    ServerUpdate {
        guild_id: Snowflake,
        token: String,
        endpoint: Option<String>,
    },
    /// The shard's session could not be resumed
    SessionLost { shard_id: u32 },
}

impl VoiceSignal {
    /// Guild the signal concerns, if it is guild scoped
    #[must_use]
    pub fn guild_id(&self) -> Option<Snowflake> {
        match self {
            Self::StateUpdate { guild_id, .. } | Self::ServerUpdate { guild_id, .. } => {
                Some(*guild_id)
            }
            Self::SessionLost { .. } => None,
        }
    }
}
