//! Gateway intents
//!
//! Intents select which groups of dispatch events a shard receives.

use bitflags::bitflags;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

bitflags! {
    /// Intent bitfield sent with Identify
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Intents: u64 {
        const GUILDS = 1 << 0;
        /// Privileged
        const GUILD_MEMBERS = 1 << 1;
        const GUILD_MODERATION = 1 << 2;
        const GUILD_EXPRESSIONS = 1 << 3;
        const GUILD_INTEGRATIONS = 1 << 4;
        const GUILD_WEBHOOKS = 1 << 5;
        const GUILD_INVITES = 1 << 6;
        const GUILD_VOICE_STATES = 1 << 7;
        /// Privileged
        const GUILD_PRESENCES = 1 << 8;
        const GUILD_MESSAGES = 1 << 9;
        const GUILD_MESSAGE_REACTIONS = 1 << 10;
        const GUILD_MESSAGE_TYPING = 1 << 11;
        const DIRECT_MESSAGES = 1 << 12;
        const DIRECT_MESSAGE_REACTIONS = 1 << 13;
        const DIRECT_MESSAGE_TYPING = 1 << 14;
        /// Privileged
        const MESSAGE_CONTENT = 1 << 15;
        const GUILD_SCHEDULED_EVENTS = 1 << 16;
    }
}

impl Intents {
    /// Intents that must be enabled for the application before use
    pub const PRIVILEGED: Self = Self::GUILD_MEMBERS
        .union(Self::GUILD_PRESENCES)
        .union(Self::MESSAGE_CONTENT);

    /// Every intent that does not require approval
    #[must_use]
    pub const fn non_privileged() -> Self {
        Self::all().difference(Self::PRIVILEGED)
    }

    /// Check whether any privileged intent is requested
    #[must_use]
    pub const fn is_privileged(&self) -> bool {
        self.intersects(Self::PRIVILEGED)
    }

    /// Build from a raw bitfield, dropping unknown bits
    #[must_use]
    pub const fn from_raw(bits: u64) -> Self {
        Self::from_bits_truncate(bits)
    }

    /// Voice sessions need the voice state events of the own user
    #[must_use]
    pub const fn supports_voice(&self) -> bool {
        self.contains(Self::GUILDS.union(Self::GUILD_VOICE_STATES))
    }
}

impl Default for Intents {
    fn default() -> Self {
        Self::non_privileged()
    }
}

impl fmt::Display for Intents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.bits())
    }
}

impl Serialize for Intents {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(self.bits())
    }
}

impl<'de> Deserialize<'de> for Intents {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Self::from_raw)
    }
}

impl From<u64> for Intents {
    fn from(bits: u64) -> Self {
        Self::from_raw(bits)
    }
}
