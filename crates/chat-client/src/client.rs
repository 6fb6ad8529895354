//! Client facade
//!
//! Owns the REST dispatcher, the shard manager and the voice manager, and
//! pumps gateway dispatches into the [`EventRegistry`].

use crate::registry::EventRegistry;
use chat_common::{ClientConfig, ClientError, ClientResult, ErrorOrigin};
use chat_core::Snowflake;
use chat_gateway::protocol::{PresenceUpdatePayload, RequestGuildMembersPayload};
use chat_gateway::{
    DispatchEvent, EventKind, IdentifyQueue, ShardConfig, ShardError, ShardInfo, ShardManager,
    VoiceSignal,
};
use chat_http::{GatewayBotInfo, HttpClient, SessionStartLimit};
use chat_voice::{
    AudioEncoder, AudioPlayer, AudioSource, VoiceError, VoiceEvent, VoiceManager,
    VoiceSessionError, VoiceStateSender,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, OnceCell};
use tokio::task::JoinHandle;

/// Builder for [`Client`]
#[derive(Debug)]
pub struct ClientBuilder {
    config: ClientConfig,
    registry: EventRegistry,
    gateway_url: Option<String>,
    identify_interval: Option<Duration>,
}

impl ClientBuilder {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            registry: EventRegistry::new(),
            gateway_url: None,
            identify_interval: None,
        }
    }

    /// Register a handler for one event kind
    pub fn on<F, Fut>(mut self, kind: EventKind, handler: F) -> Self
    where
        F: Fn(DispatchEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.registry.on(kind, handler);
        self
    }

    /// Replace the handler registry wholesale
    pub fn registry(mut self, registry: EventRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Connect to this gateway URL instead of asking `GET /gateway/bot`
    pub fn gateway_url(mut self, url: impl Into<String>) -> Self {
        self.gateway_url = Some(url.into());
        self
    }

    /// Spacing between identifies sharing a concurrency bucket
    pub fn identify_interval(mut self, interval: Duration) -> Self {
        self.identify_interval = Some(interval);
        self
    }

    pub fn build(self) -> ClientResult<Client> {
        let http = HttpClient::new(self.config.token.clone(), self.config.http.clone())?;

        Ok(Client {
            config: self.config,
            http,
            registry: Arc::new(self.registry),
            gateway_url: self.gateway_url,
            identify_interval: self.identify_interval,
            gateway: OnceCell::new(),
            shards: None,
            voice: None,
            voice_events: None,
            pumps: Vec::new(),
        })
    }
}

/// A connected (or connectable) application
pub struct Client {
    config: ClientConfig,
    http: HttpClient,
    registry: Arc<EventRegistry>,
    gateway_url: Option<String>,
    identify_interval: Option<Duration>,
    gateway: OnceCell<GatewayBotInfo>,
    shards: Option<ShardManager>,
    voice: Option<Arc<Mutex<VoiceManager>>>,
    voice_events: Option<mpsc::UnboundedReceiver<VoiceEvent>>,
    pumps: Vec<JoinHandle<()>>,
}

impl Client {
    pub fn builder(config: ClientConfig) -> ClientBuilder {
        ClientBuilder::new(config)
    }

    /// REST dispatcher shared by every caller
    pub fn http(&self) -> &HttpClient {
        &self.http
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.shards.is_some()
    }

    /// Gateway URL and sharding advice, fetched once per client
    pub async fn gateway_info(&self) -> ClientResult<&GatewayBotInfo> {
        self.gateway.get_or_try_init(|| self.fetch_gateway()).await
    }

    async fn fetch_gateway(&self) -> ClientResult<GatewayBotInfo> {
        if let Some(url) = &self.gateway_url {
            return Ok(GatewayBotInfo {
                url: url.clone(),
                shards: self.config.gateway.shard_count.unwrap_or(1),
                session_start_limit: SessionStartLimit::default(),
            });
        }

        let info = self.http.get_gateway_bot().await?;
        tracing::info!(
            url = %info.url,
            shards = info.shards,
            remaining = info.session_start_limit.remaining,
            max_concurrency = info.session_start_limit.max_concurrency,
            "Fetched gateway endpoint"
        );
        if info.session_start_limit.remaining == 0 {
            tracing::warn!(
                reset_after_ms = info.session_start_limit.reset_after,
                "Session start limit exhausted; identifies will be rejected until it resets"
            );
        }
        Ok(info)
    }

    /// Spawn every shard and start routing events
    pub async fn connect(&mut self) -> ClientResult<()> {
        if self.shards.is_some() {
            return Err(client_error("client is already connected"));
        }

        let info = self.gateway_info().await?.clone();
        let shard_count = self.config.gateway.shard_count.unwrap_or(info.shards).max(1);
        let max_concurrency = info.session_start_limit.max_concurrency.max(1);

        let identify_queue = Arc::new(match self.identify_interval {
            Some(interval) => IdentifyQueue::with_interval(max_concurrency, interval),
            None => IdentifyQueue::new(max_concurrency),
        });
        let base = ShardConfig::new(self.config.token.clone(), info.url)
            .with_gateway_config(&self.config.gateway)
            .with_reconnect(self.config.reconnect.clone())
            .with_shard(0, shard_count);

        let mut shards =
            ShardManager::spawn(&base, identify_queue, self.config.gateway.event_buffer);

        if let Some(events) = shards.take_events() {
            self.pumps
                .push(tokio::spawn(pump_events(events, Arc::clone(&self.registry))));
        }

        // Without a voice manager the signal stream is dropped and shards discard signals
        let signals = shards.take_voice_signals();
        if self.config.voice.enabled {
            let router: Arc<dyn VoiceStateSender> = Arc::new(shards.router());
            let mut manager = VoiceManager::new(self.config.voice.clone(), router, shard_count);
            self.voice_events = manager.take_events();

            let manager = Arc::new(Mutex::new(manager));
            if let Some(signals) = signals {
                self.pumps
                    .push(tokio::spawn(pump_voice(signals, Arc::clone(&manager))));
            }
            self.voice = Some(manager);
        }

        tracing::info!(
            shard_count,
            has_handlers = !self.registry.is_empty(),
            voice = self.config.voice.enabled,
            "Client connected"
        );
        self.shards = Some(shards);
        Ok(())
    }

    /// Connect if needed, then run until every shard stops
    ///
    /// A fatal shard error stops the other shards and is returned.
    pub async fn run(&mut self) -> ClientResult<()> {
        if self.shards.is_none() {
            self.connect().await?;
        }
        let shards = self
            .shards
            .as_mut()
            .ok_or_else(|| client_error("client is not connected"))?;
        shards.wait().await.map_err(ClientError::from)
    }

    /// Snapshot of every shard
    pub fn shard_info(&self) -> Vec<ShardInfo> {
        self.shards
            .as_ref()
            .map(|shards| shards.shards().map(chat_gateway::ShardHandle::info).collect())
            .unwrap_or_default()
    }

    /// Broadcast a presence to every shard
    pub async fn update_presence(&self, presence: PresenceUpdatePayload) -> ClientResult<()> {
        let shards = self.shards()?;
        for handle in shards.shards() {
            handle
                .update_presence(presence.clone())
                .await
                .map_err(|e| ShardError::new(handle.shard_id(), e))?;
        }
        Ok(())
    }

    /// Ask the guild's shard for a member chunk stream
    pub async fn request_guild_members(
        &self,
        request: RequestGuildMembersPayload,
    ) -> ClientResult<()> {
        let shards = self.shards()?;
        let shard_id = ShardManager::shard_id_for_guild(request.guild_id, shards.shard_count());
        shards
            .request_guild_members(request)
            .await
            .map_err(|e| ShardError::new(shard_id, e).into())
    }

    /// Move into a guild voice channel; [`VoiceEvent::Connected`] follows once the session is up
    pub async fn join_voice(
        &self,
        guild_id: Snowflake,
        channel_id: Snowflake,
        self_mute: bool,
        self_deaf: bool,
    ) -> ClientResult<()> {
        let voice = self.voice_manager(guild_id)?;
        let result = voice
            .lock()
            .await
            .join(guild_id, channel_id, self_mute, self_deaf)
            .await;
        result.map_err(|e| VoiceSessionError::new(guild_id, e).into())
    }

    pub async fn leave_voice(&self, guild_id: Snowflake) -> ClientResult<()> {
        let voice = self.voice_manager(guild_id)?;
        let result = voice.lock().await.leave(guild_id).await;
        result.map_err(|e| VoiceSessionError::new(guild_id, e).into())
    }

    /// Start playing on the guild's voice connection
    pub async fn play(
        &self,
        guild_id: Snowflake,
        source: Box<dyn AudioSource>,
        encoder: Option<Box<dyn AudioEncoder>>,
    ) -> ClientResult<AudioPlayer> {
        let voice = self.voice_manager(guild_id)?;
        let result = voice.lock().await.play(guild_id, source, encoder);
        result.map_err(|e| VoiceSessionError::new(guild_id, e).into())
    }

    /// Take the voice lifecycle stream; only the first call after connect gets it
    pub fn take_voice_events(&mut self) -> Option<mpsc::UnboundedReceiver<VoiceEvent>> {
        self.voice_events.take()
    }

    /// Leave voice, stop every shard and drain the event pumps
    pub async fn shutdown(&mut self) {
        if let Some(voice) = self.voice.take() {
            voice.lock().await.disconnect_all().await;
        }
        if let Some(mut shards) = self.shards.take() {
            shards.shutdown().await;
        }
        for pump in self.pumps.drain(..) {
            if let Err(e) = pump.await {
                tracing::debug!(error = %e, "Event pump ended abnormally");
            }
        }
        tracing::info!("Client shut down");
    }

    fn shards(&self) -> ClientResult<&ShardManager> {
        self.shards
            .as_ref()
            .ok_or_else(|| client_error("client is not connected"))
    }

    fn voice_manager(&self, guild_id: Snowflake) -> ClientResult<&Arc<Mutex<VoiceManager>>> {
        self.voice.as_ref().ok_or_else(|| {
            let source = if self.config.voice.enabled {
                VoiceError::NotConnected
            } else {
                VoiceError::Disabled
            };
            VoiceSessionError::new(guild_id, source).into()
        })
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        for pump in &self.pumps {
            pump.abort();
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("connected", &self.shards.is_some())
            .field("registry", &self.registry)
            .field("voice", &self.voice.is_some())
            .finish()
    }
}

fn client_error(message: &str) -> ClientError {
    ClientError::Config {
        origin: ErrorOrigin::Client,
        message: message.to_string(),
    }
}

/// Deliver dispatches in arrival order; a slow handler backs up its shards
async fn pump_events(mut events: mpsc::Receiver<DispatchEvent>, registry: Arc<EventRegistry>) {
    while let Some(event) = events.recv().await {
        registry.dispatch(&event).await;
    }
    tracing::debug!("Event stream closed");
}

async fn pump_voice(
    mut signals: mpsc::UnboundedReceiver<VoiceSignal>,
    voice: Arc<Mutex<VoiceManager>>,
) {
    while let Some(signal) = signals.recv().await {
        let accepted = voice.lock().await.accept_signal(signal);
        // The handshake runs unlocked so join, leave and play stay responsive
        let result = match accepted {
            Ok(Some(pending)) => {
                let outcome = pending.connect().await;
                voice.lock().await.complete(outcome)
            }
            Ok(None) => Ok(()),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            let err = ClientError::from(e);
            tracing::warn!(error = %err, code = err.error_code(), "Voice session failed");
        }
    }
    tracing::debug!("Voice signal stream closed");
}
