//! Client configuration structs
//!
//! Loads configuration from environment variables once at startup. Components
//! receive the sub-config they need and never read the environment themselves.

use serde::Deserialize;
use std::env;
use std::time::Duration;

/// Main client configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    pub app: AppSettings,
    /// Bot token sent as `Authorization: Bot <token>`
    pub token: String,
    pub http: HttpConfig,
    pub gateway: GatewayConfig,
    pub reconnect: ReconnectConfig,
    pub voice: VoiceConfig,
}

/// General application settings
#[derive(Debug, Clone, Deserialize)]
pub struct AppSettings {
    #[serde(default = "default_app_name")]
    pub name: String,
    #[serde(default)]
    pub env: Environment,
}

/// Environment type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Staging,
    Production,
}

impl Environment {
    #[must_use]
    pub fn is_production(&self) -> bool {
        matches!(self, Self::Production)
    }

    #[must_use]
    pub fn is_development(&self) -> bool {
        matches!(self, Self::Development)
    }
}

/// REST dispatcher configuration
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// Versioned API base, e.g. `https://discord.com/api/v10`
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Attempts per request before surfacing a rate-limit or server error
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Per-request timeout
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Base unit of the 5xx backoff (`base * (1 + 2 * attempt)`)
    #[serde(default = "default_server_error_backoff_ms")]
    pub server_error_backoff_ms: u64,
}

impl HttpConfig {
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    #[must_use]
    pub fn server_error_backoff(&self) -> Duration {
        Duration::from_millis(self.server_error_backoff_ms)
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            user_agent: default_user_agent(),
            max_retries: default_max_retries(),
            request_timeout_ms: default_request_timeout_ms(),
            server_error_backoff_ms: default_server_error_backoff_ms(),
        }
    }
}

/// Gateway session configuration
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Gateway protocol version appended to the endpoint query
    #[serde(default = "default_gateway_version")]
    pub version: u8,
    /// Raw intents bitfield
    #[serde(default = "default_intents")]
    pub intents: u64,
    /// Fixed shard count; `None` uses the count recommended by the service
    #[serde(default)]
    pub shard_count: Option<u32>,
    /// Member count above which guilds are sent without offline members
    #[serde(default = "default_large_threshold")]
    pub large_threshold: u16,
    /// Capacity of the per-shard event channel
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            version: default_gateway_version(),
            intents: default_intents(),
            shard_count: None,
            large_threshold: default_large_threshold(),
            event_buffer: default_event_buffer(),
        }
    }
}

/// Reconnect backoff configuration shared by gateway and voice sessions
#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_reconnect_initial_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub max_delay_ms: u64,
    /// Fraction of the delay applied as +/- jitter
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,
}

impl ReconnectConfig {
    #[must_use]
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    #[must_use]
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_reconnect_initial_ms(),
            max_delay_ms: default_reconnect_max_ms(),
            jitter_ratio: default_jitter_ratio(),
        }
    }
}

/// Voice configuration
///
/// `encoder_available` is the result of the one-time codec capability check;
/// voice sessions read it from here instead of probing process state.
#[derive(Debug, Clone, Deserialize)]
pub struct VoiceConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub encoder_available: bool,
    #[serde(default = "default_udp_keepalive_ms")]
    pub udp_keepalive_ms: u64,
    /// Upper bound on the whole voice handshake
    #[serde(default = "default_voice_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl VoiceConfig {
    #[must_use]
    pub fn udp_keepalive(&self) -> Duration {
        Duration::from_millis(self.udp_keepalive_ms)
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            encoder_available: false,
            udp_keepalive_ms: default_udp_keepalive_ms(),
            connect_timeout_ms: default_voice_connect_timeout_ms(),
        }
    }
}

// Default value functions
fn default_app_name() -> String {
    "chat-client".to_string()
}

fn default_api_base() -> String {
    "https://discord.com/api/v10".to_string()
}

fn default_user_agent() -> String {
    format!(
        "DiscordBot (https://github.com/chat-client, {})",
        env!("CARGO_PKG_VERSION")
    )
}

fn default_max_retries() -> u32 {
    5
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_server_error_backoff_ms() -> u64 {
    1_000
}

fn default_gateway_version() -> u8 {
    10
}

fn default_intents() -> u64 {
    // Every non-privileged intent
    0x0001_7EFD
}

fn default_large_threshold() -> u16 {
    250
}

fn default_event_buffer() -> usize {
    1024
}

fn default_reconnect_initial_ms() -> u64 {
    1_000
}

fn default_reconnect_max_ms() -> u64 {
    60_000
}

fn default_jitter_ratio() -> f64 {
    0.2
}

fn default_udp_keepalive_ms() -> u64 {
    5_000
}

fn default_voice_connect_timeout_ms() -> u64 {
    60_000
}

fn parse_var<T: std::str::FromStr>(name: &'static str) -> Result<Option<T>, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue(name, raw)),
        Err(_) => Ok(None),
    }
}

fn parse_bool(name: &'static str) -> Result<Option<bool>, ConfigError> {
    match env::var(name) {
        Ok(raw) => match raw.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(ConfigError::InvalidValue(name, raw)),
        },
        Err(_) => Ok(None),
    }
}

impl ClientConfig {
    /// Build a configuration for `token` with every other value defaulted
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            app: AppSettings {
                name: default_app_name(),
                env: Environment::default(),
            },
            token: token.into(),
            http: HttpConfig::default(),
            gateway: GatewayConfig::default(),
            reconnect: ReconnectConfig::default(),
            voice: VoiceConfig::default(),
        }
    }

    /// Load configuration from environment variables
    ///
    /// # Errors
    /// Returns an error if `CHAT_TOKEN` is missing or a variable fails to parse
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let token = env::var("CHAT_TOKEN").map_err(|_| ConfigError::MissingVar("CHAT_TOKEN"))?;
        if token.trim().is_empty() {
            return Err(ConfigError::InvalidValue("CHAT_TOKEN", String::new()));
        }

        let mut config = Self::new(token.trim());

        config.app.name = env::var("APP_NAME").unwrap_or_else(|_| default_app_name());
        config.app.env = env::var("APP_ENV")
            .ok()
            .and_then(|s| match s.to_lowercase().as_str() {
                "production" => Some(Environment::Production),
                "staging" => Some(Environment::Staging),
                "development" => Some(Environment::Development),
                _ => None,
            })
            .unwrap_or_default();

        if let Ok(base) = env::var("CHAT_API_BASE") {
            config.http.api_base = base.trim_end_matches('/').to_string();
        }
        if let Some(retries) = parse_var("CHAT_HTTP_MAX_RETRIES")? {
            config.http.max_retries = retries;
        }
        if let Some(timeout) = parse_var("CHAT_HTTP_TIMEOUT_MS")? {
            config.http.request_timeout_ms = timeout;
        }

        if let Some(version) = parse_var("CHAT_GATEWAY_VERSION")? {
            config.gateway.version = version;
        }
        if let Some(intents) = parse_var("CHAT_INTENTS")? {
            config.gateway.intents = intents;
        }
        config.gateway.shard_count = parse_var("CHAT_SHARD_COUNT")?;
        if config.gateway.shard_count == Some(0) {
            return Err(ConfigError::InvalidValue("CHAT_SHARD_COUNT", "0".to_string()));
        }
        if let Some(threshold) = parse_var("CHAT_LARGE_THRESHOLD")? {
            config.gateway.large_threshold = threshold;
        }

        if let Some(max) = parse_var("CHAT_RECONNECT_MAX_DELAY_MS")? {
            config.reconnect.max_delay_ms = max;
        }

        if let Some(enabled) = parse_bool("CHAT_VOICE_ENABLED")? {
            config.voice.enabled = enabled;
        }

        Ok(config)
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(&'static str),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(&'static str, String),
}

impl From<ConfigError> for crate::ClientError {
    fn from(err: ConfigError) -> Self {
        Self::Config {
            origin: crate::ErrorOrigin::Client,
            message: err.to_string(),
        }
    }
}
