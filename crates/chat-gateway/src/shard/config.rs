//! Per-shard configuration

use crate::protocol::{IdentifyProperties, PresenceUpdatePayload};
use crate::Intents;
use chat_common::{GatewayConfig, ReconnectConfig};
use std::time::Duration;

/// Everything a shard needs to connect, identify and reconnect
#[derive(Debug, Clone)]
pub struct ShardConfig {
    pub shard_id: u32,
    pub shard_count: u32,
    pub token: String,
    /// Base gateway URL, without query
    pub gateway_url: String,
    pub version: u8,
    pub intents: Intents,
    pub large_threshold: u16,
    pub properties: IdentifyProperties,
    pub presence: Option<PresenceUpdatePayload>,
    pub reconnect: ReconnectConfig,
    pub hello_timeout: Duration,
    /// Bounds of the randomized wait before identifying after an invalidated session
    pub invalid_session_delay: (Duration, Duration),
    /// Consecutive malformed frames tolerated before the connection is dropped
    pub max_violations: u32,
}

impl ShardConfig {
    pub const DEFAULT_HELLO_TIMEOUT: Duration = Duration::from_secs(20);
    pub const DEFAULT_MAX_VIOLATIONS: u32 = 3;

    #[must_use]
    pub fn new(token: impl Into<String>, gateway_url: impl Into<String>) -> Self {
        let gateway = GatewayConfig::default();
        Self {
            shard_id: 0,
            shard_count: 1,
            token: token.into(),
            gateway_url: gateway_url.into(),
            version: gateway.version,
            intents: Intents::from_raw(gateway.intents),
            large_threshold: gateway.large_threshold,
            properties: IdentifyProperties::default(),
            presence: None,
            reconnect: ReconnectConfig::default(),
            hello_timeout: Self::DEFAULT_HELLO_TIMEOUT,
            invalid_session_delay: (Duration::from_secs(1), Duration::from_secs(5)),
            max_violations: Self::DEFAULT_MAX_VIOLATIONS,
        }
    }

    /// Apply the gateway section of the client configuration
    #[must_use]
    pub fn with_gateway_config(mut self, config: &GatewayConfig) -> Self {
        self.version = config.version;
        self.intents = Intents::from_raw(config.intents);
        self.large_threshold = config.large_threshold;
        self
    }

    #[must_use]
    pub fn with_shard(mut self, shard_id: u32, shard_count: u32) -> Self {
        self.shard_id = shard_id;
        self.shard_count = shard_count.max(1);
        self
    }

    #[must_use]
    pub fn with_intents(mut self, intents: Intents) -> Self {
        self.intents = intents;
        self
    }

    #[must_use]
    pub fn with_presence(mut self, presence: PresenceUpdatePayload) -> Self {
        self.presence = Some(presence);
        self
    }

    #[must_use]
    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    #[must_use]
    pub fn with_hello_timeout(mut self, timeout: Duration) -> Self {
        self.hello_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_invalid_session_delay(mut self, min: Duration, max: Duration) -> Self {
        self.invalid_session_delay = (min, max.max(min));
        self
    }

    /// Full connect URL for `base` (the gateway URL or a resume URL)
    #[must_use]
    pub fn connect_url(&self, base: &str) -> String {
        if base.contains('?') {
            return format!("{base}&v={}&encoding=json", self.version);
        }
        let base = base.trim_end_matches('/');
        format!("{base}/?v={}&encoding=json", self.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_url() {
        let config = ShardConfig::new("t", "wss://gateway.example");
        assert_eq!(
            config.connect_url("wss://gateway.example/"),
            "wss://gateway.example/?v=10&encoding=json"
        );
        assert_eq!(
            config.connect_url("wss://gateway.example"),
            "wss://gateway.example/?v=10&encoding=json"
        );
        assert_eq!(
            config.connect_url("wss://resume.example?x=1"),
            "wss://resume.example?x=1&v=10&encoding=json"
        );
    }

    #[test]
    fn test_defaults_follow_gateway_config() {
        let config = ShardConfig::new("t", "wss://gateway.example");
        assert_eq!(config.intents, Intents::non_privileged());
        assert_eq!(config.large_threshold, 250);
        assert_eq!(config.shard_count, 1);
    }

    #[test]
    fn test_builder_setters() {
        let gateway = GatewayConfig {
            intents: Intents::GUILDS.bits(),
            large_threshold: 50,
            ..GatewayConfig::default()
        };
        let config = ShardConfig::new("t", "wss://gateway.example")
            .with_gateway_config(&gateway)
            .with_shard(3, 0)
            .with_invalid_session_delay(Duration::from_secs(5), Duration::from_secs(1));

        assert_eq!(config.intents, Intents::GUILDS);
        assert_eq!(config.large_threshold, 50);
        assert_eq!((config.shard_id, config.shard_count), (3, 1));
        assert!(config.invalid_session_delay.0 <= config.invalid_session_delay.1);
    }
}
