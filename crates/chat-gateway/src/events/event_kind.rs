//! Dispatch event kinds
//!
//! Closed set of event names the client knows how to route. Names outside
//! this set are still delivered, with no kind attached.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Known dispatch event names (the `t` field of op 0)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    // Connection events
    /// Sent after successful Identify
    Ready,
    /// Sent after successful Resume
    Resumed,

    // Guild events
    GuildCreate,
    GuildUpdate,
    GuildDelete,
    GuildMembersChunk,

    // Channel events
    ChannelCreate,
    ChannelUpdate,
    ChannelDelete,

    // Message events
    MessageCreate,
    MessageUpdate,
    MessageDelete,

    // Reaction events
    MessageReactionAdd,
    MessageReactionRemove,

    // Member events
    GuildMemberAdd,
    GuildMemberUpdate,
    GuildMemberRemove,

    // Presence events
    PresenceUpdate,
    TypingStart,

    // User events
    UserUpdate,

    // Interaction events
    InteractionCreate,

    // Voice events
    /// A user joined, left or moved between voice channels
    VoiceStateUpdate,
    /// Voice server credentials for the own user
    VoiceServerUpdate,
}

impl EventKind {
    /// Every known kind
    pub const ALL: [Self; 23] = [
        Self::Ready,
        Self::Resumed,
        Self::GuildCreate,
        Self::GuildUpdate,
        Self::GuildDelete,
        Self::GuildMembersChunk,
        Self::ChannelCreate,
        Self::ChannelUpdate,
        Self::ChannelDelete,
        Self::MessageCreate,
        Self::MessageUpdate,
        Self::MessageDelete,
        Self::MessageReactionAdd,
        Self::MessageReactionRemove,
        Self::GuildMemberAdd,
        Self::GuildMemberUpdate,
        Self::GuildMemberRemove,
        Self::PresenceUpdate,
        Self::TypingStart,
        Self::UserUpdate,
        Self::InteractionCreate,
        Self::VoiceStateUpdate,
        Self::VoiceServerUpdate,
    ];

    /// Get the wire name of the event
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ready => "READY",
            Self::Resumed => "RESUMED",
            Self::GuildCreate => "GUILD_CREATE",
            Self::GuildUpdate => "GUILD_UPDATE",
            Self::GuildDelete => "GUILD_DELETE",
            Self::GuildMembersChunk => "GUILD_MEMBERS_CHUNK",
            Self::ChannelCreate => "CHANNEL_CREATE",
            Self::ChannelUpdate => "CHANNEL_UPDATE",
            Self::ChannelDelete => "CHANNEL_DELETE",
            Self::MessageCreate => "MESSAGE_CREATE",
            Self::MessageUpdate => "MESSAGE_UPDATE",
            Self::MessageDelete => "MESSAGE_DELETE",
            Self::MessageReactionAdd => "MESSAGE_REACTION_ADD",
            Self::MessageReactionRemove => "MESSAGE_REACTION_REMOVE",
            Self::GuildMemberAdd => "GUILD_MEMBER_ADD",
            Self::GuildMemberUpdate => "GUILD_MEMBER_UPDATE",
            Self::GuildMemberRemove => "GUILD_MEMBER_REMOVE",
            Self::PresenceUpdate => "PRESENCE_UPDATE",
            Self::TypingStart => "TYPING_START",
            Self::UserUpdate => "USER_UPDATE",
            Self::InteractionCreate => "INTERACTION_CREATE",
            Self::VoiceStateUpdate => "VOICE_STATE_UPDATE",
            Self::VoiceServerUpdate => "VOICE_SERVER_UPDATE",
        }
    }

    /// Look up a kind by wire name; unknown names yield `None`
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventKind {
    type Err = UnknownEvent;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s).ok_or_else(|| UnknownEvent(s.to_string()))
    }
}

/// Event name outside the known set
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown event: {0}")]
pub struct UnknownEvent(pub String);
