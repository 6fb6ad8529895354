//! Shard connection state

use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Lifecycle of a shard connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardState {
    #[default]
    Disconnected,
    Connecting,
    Identifying,
    /// Normal traffic flows only in this state
    Connected,
    Resuming,
}

impl ShardState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Identifying => "identifying",
            Self::Connected => "connected",
            Self::Resuming => "resuming",
        }
    }
}

impl fmt::Display for ShardState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of a shard published to its handles
#[derive(Debug, Clone, Default)]
pub struct ShardInfo {
    pub shard_id: u32,
    pub state: ShardState,
    pub session_id: Option<String>,
    pub sequence: Option<u64>,
    /// Time between the last heartbeat and its ack
    pub latency: Option<Duration>,
    /// Consecutive failed connection attempts
    pub reconnect_attempts: u32,
}

impl ShardInfo {
    #[must_use]
    pub fn new(shard_id: u32) -> Self {
        Self {
            shard_id,
            ..Self::default()
        }
    }
}
