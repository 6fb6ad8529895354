//! Voice credential pairing and connection ownership
//!
//! A voice session needs both halves of its credentials: the session id from
//! the own user's voice state update and the token and endpoint from the
//! voice server update. They arrive in either order, so whichever comes first
//! is buffered per guild.
//!
//! The voice handshake itself runs outside the manager: `accept_signal` hands
//! out a [`PendingHandshake`] and `complete` takes its outcome back. Every
//! handshake carries the guild's generation at the time it started; leaving,
//! losing the session or a newer handshake bumps it, and a stale outcome is
//! discarded.

use crate::audio::{AudioEncoder, AudioPlayer, AudioSource};
use crate::connection::{DisconnectReason, VoiceConnection, VoiceEvent, VoiceServerInfo};
use crate::error::{VoiceError, VoiceResult, VoiceSessionError};
use crate::gateway_link::VoiceStateSender;
use chat_common::VoiceConfig;
use chat_core::Snowflake;
use chat_gateway::protocol::VoiceStateUpdatePayload;
use chat_gateway::{ShardManager, VoiceSignal};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Default, Clone)]
struct PendingCredentials {
    channel_id: Option<Snowflake>,
    user_id: Option<Snowflake>,
    session_id: Option<String>,
    token: Option<String>,
    endpoint: Option<String>,
}

/// Per-guild buffer pairing voice state and voice server updates
#[derive(Debug, Default)]
pub struct CredentialBuffer {
    pending: HashMap<Snowflake, PendingCredentials>,
}

impl CredentialBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the own user's voice state; a `None` channel forgets the guild
    pub fn on_state(
        &mut self,
        guild_id: Snowflake,
        channel_id: Option<Snowflake>,
        user_id: Snowflake,
        session_id: String,
    ) -> Option<VoiceServerInfo> {
        let Some(channel_id) = channel_id else {
            self.pending.remove(&guild_id);
            return None;
        };

        let entry = self.pending.entry(guild_id).or_default();
        entry.channel_id = Some(channel_id);
        entry.user_id = Some(user_id);
        entry.session_id = Some(session_id);
        self.take_complete(guild_id)
    }

    /// Record voice server credentials; a `None` endpoint means the server
    /// is being reallocated and a later update will carry the new one
    pub fn on_server(
        &mut self,
        guild_id: Snowflake,
        token: String,
        endpoint: Option<String>,
    ) -> Option<VoiceServerInfo> {
        let entry = self.pending.entry(guild_id).or_default();
        entry.token = Some(token);
        entry.endpoint = endpoint;
        self.take_complete(guild_id)
    }

    /// Both halves present: hand out the credentials and keep the state half
    /// for later server moves
    fn take_complete(&mut self, guild_id: Snowflake) -> Option<VoiceServerInfo> {
        let entry = self.pending.get_mut(&guild_id)?;
        let (Some(channel_id), Some(user_id), Some(session_id), Some(_), Some(_)) = (
            entry.channel_id,
            entry.user_id,
            entry.session_id.as_ref(),
            entry.token.as_ref(),
            entry.endpoint.as_ref(),
        ) else {
            return None;
        };
        let session_id = session_id.clone();

        Some(VoiceServerInfo {
            guild_id,
            channel_id,
            user_id,
            session_id,
            token: entry.token.take()?,
            endpoint: entry.endpoint.take()?,
        })
    }

    #[must_use]
    pub fn is_pending(&self, guild_id: Snowflake) -> bool {
        self.pending.contains_key(&guild_id)
    }

    pub fn clear(&mut self, guild_id: Snowflake) {
        self.pending.remove(&guild_id);
    }

    pub fn clear_all(&mut self) {
        self.pending.clear();
    }

    /// Drop every guild matching `predicate`
    pub fn clear_where(&mut self, mut predicate: impl FnMut(Snowflake) -> bool) {
        self.pending.retain(|guild_id, _| !predicate(*guild_id));
    }
}

/// A voice handshake that does not borrow its manager
pub struct PendingHandshake {
    info: VoiceServerInfo,
    generation: u64,
    config: VoiceConfig,
    gateway: Arc<dyn VoiceStateSender>,
    events_tx: mpsc::UnboundedSender<VoiceEvent>,
}

impl PendingHandshake {
    #[must_use]
    pub fn guild_id(&self) -> Snowflake {
        self.info.guild_id
    }

    /// Run the handshake; hand the outcome to [`VoiceManager::complete`]
    pub async fn connect(self) -> HandshakeOutcome {
        let guild_id = self.info.guild_id;
        let result =
            VoiceConnection::connect(self.info, &self.config, self.gateway, self.events_tx).await;
        HandshakeOutcome {
            guild_id,
            generation: self.generation,
            result,
        }
    }
}

impl std::fmt::Debug for PendingHandshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingHandshake")
            .field("guild_id", &self.info.guild_id)
            .field("channel_id", &self.info.channel_id)
            .field("generation", &self.generation)
            .finish()
    }
}

/// Result of a [`PendingHandshake`]
#[derive(Debug)]
pub struct HandshakeOutcome {
    guild_id: Snowflake,
    generation: u64,
    result: VoiceResult<VoiceConnection>,
}

/// Owns every voice connection of a client
pub struct VoiceManager {
    config: VoiceConfig,
    gateway: Arc<dyn VoiceStateSender>,
    shard_count: u32,
    buffer: CredentialBuffer,
    connections: HashMap<Snowflake, VoiceConnection>,
    generations: HashMap<Snowflake, u64>,
    events_tx: mpsc::UnboundedSender<VoiceEvent>,
    events: Option<mpsc::UnboundedReceiver<VoiceEvent>>,
}

impl VoiceManager {
    #[must_use]
    pub fn new(config: VoiceConfig, gateway: Arc<dyn VoiceStateSender>, shard_count: u32) -> Self {
        let (events_tx, events) = mpsc::unbounded_channel();
        Self {
            config,
            gateway,
            shard_count,
            buffer: CredentialBuffer::new(),
            connections: HashMap::new(),
            generations: HashMap::new(),
            events_tx,
            events: Some(events),
        }
    }

    /// Lifecycle events of every connection; can be taken once
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<VoiceEvent>> {
        self.events.take()
    }

    /// Ask the gateway to move the own user into a voice channel
    ///
    /// The connection itself starts once both credential halves arrive
    /// through [`handle_signal`](Self::handle_signal).
    pub async fn join(
        &mut self,
        guild_id: Snowflake,
        channel_id: Snowflake,
        self_mute: bool,
        self_deaf: bool,
    ) -> VoiceResult<()> {
        if !self.config.enabled {
            return Err(VoiceError::Disabled);
        }
        self.prune();

        let state = VoiceStateUpdatePayload {
            guild_id,
            channel_id: Some(channel_id),
            self_mute,
            self_deaf,
        };
        tracing::info!(guild_id = %guild_id, channel_id = %channel_id, "Joining voice channel");
        self.gateway.update_voice_state(state).await?;
        Ok(())
    }

    /// Leave the guild's voice channel, closing its connection if one is up
    pub async fn leave(&mut self, guild_id: Snowflake) -> VoiceResult<()> {
        self.buffer.clear(guild_id);
        self.supersede(guild_id);
        match self.connections.remove(&guild_id) {
            Some(mut connection) if connection.is_connected() => connection.disconnect().await,
            _ => {
                self.gateway
                    .update_voice_state(VoiceStateUpdatePayload::leave(guild_id))
                    .await?;
                Ok(())
            }
        }
    }

    /// Feed a signal relayed by a shard and run any handshake it completes
    ///
    /// This keeps `self` borrowed for the whole handshake. Callers sharing the
    /// manager behind a lock should use [`accept_signal`](Self::accept_signal)
    /// and [`complete`](Self::complete) instead.
    pub async fn handle_signal(&mut self, signal: VoiceSignal) -> Result<(), VoiceSessionError> {
        match self.accept_signal(signal)? {
            Some(pending) => {
                let outcome = pending.connect().await;
                self.complete(outcome)
            }
            None => Ok(()),
        }
    }

    /// Feed a signal relayed by a shard
    ///
    /// Returns the handshake to run when the signal completed a credential pair.
    pub fn accept_signal(
        &mut self,
        signal: VoiceSignal,
    ) -> Result<Option<PendingHandshake>, VoiceSessionError> {
        self.prune();

        let info = match signal {
            VoiceSignal::StateUpdate {
                guild_id,
                channel_id,
                user_id,
                session_id,
            } => {
                if channel_id.is_none() {
                    self.drop_connection(guild_id, DisconnectReason::Left);
                }
                self.buffer.on_state(guild_id, channel_id, user_id, session_id)
            }
            VoiceSignal::ServerUpdate {
                guild_id,
                token,
                endpoint,
            } => {
                if endpoint.is_none() {
                    tracing::debug!(guild_id = %guild_id, "Voice server reallocating");
                }
                // A new server always means a fresh handshake
                self.drop_connection(guild_id, DisconnectReason::Left);
                self.buffer.on_server(guild_id, token, endpoint)
            }
            VoiceSignal::SessionLost { shard_id } => {
                self.session_lost(shard_id);
                None
            }
        };

        let Some(info) = info else {
            return Ok(None);
        };
        let guild_id = info.guild_id;
        if !self.config.enabled {
            return Err(VoiceSessionError::new(guild_id, VoiceError::Disabled));
        }

        Ok(Some(PendingHandshake {
            info,
            generation: self.supersede(guild_id),
            config: self.config.clone(),
            gateway: Arc::clone(&self.gateway),
            events_tx: self.events_tx.clone(),
        }))
    }

    /// Take back a handshake outcome; stale ones are discarded
    pub fn complete(&mut self, outcome: HandshakeOutcome) -> Result<(), VoiceSessionError> {
        let HandshakeOutcome {
            guild_id,
            generation,
            result,
        } = outcome;

        if self.generations.get(&guild_id) != Some(&generation) {
            tracing::debug!(guild_id = %guild_id, generation, "Discarding superseded voice handshake");
            if let Ok(connection) = result {
                if connection.is_connected() {
                    drop(connection);
                    self.emit(VoiceEvent::Disconnected {
                        guild_id,
                        reason: DisconnectReason::Left,
                    });
                }
            }
            return Ok(());
        }

        match result {
            Ok(connection) => {
                self.connections.insert(guild_id, connection);
                Ok(())
            }
            Err(e) => {
                tracing::warn!(guild_id = %guild_id, error = %e, "Voice handshake failed");
                self.emit(VoiceEvent::Disconnected {
                    guild_id,
                    reason: DisconnectReason::Failed(e.to_string()),
                });
                Err(VoiceSessionError::new(guild_id, e))
            }
        }
    }

    fn session_lost(&mut self, shard_id: u32) {
        let shard_count = self.shard_count;
        let on_shard =
            |guild_id: Snowflake| ShardManager::shard_id_for_guild(guild_id, shard_count) == shard_id;

        self.buffer.clear_where(on_shard);
        let in_flight: Vec<Snowflake> = self.generations.keys().copied().filter(|g| on_shard(*g)).collect();
        for guild_id in in_flight {
            self.supersede(guild_id);
        }
        let lost: Vec<Snowflake> = self.connections.keys().copied().filter(|g| on_shard(*g)).collect();
        tracing::warn!(shard_id, connections = lost.len(), "Gateway session lost, closing voice");
        for guild_id in lost {
            self.drop_connection(guild_id, DisconnectReason::SessionLost);
        }
    }

    /// Close a connection without leaving through the gateway
    fn drop_connection(&mut self, guild_id: Snowflake, reason: DisconnectReason) {
        self.supersede(guild_id);
        if let Some(connection) = self.connections.remove(&guild_id) {
            let was_connected = connection.is_connected();
            drop(connection);
            if was_connected {
                self.emit(VoiceEvent::Disconnected { guild_id, reason });
            }
        }
    }

    /// Invalidate any handshake in flight for the guild; returns the new generation
    fn supersede(&mut self, guild_id: Snowflake) -> u64 {
        let generation = self.generations.entry(guild_id).or_insert(0);
        *generation += 1;
        *generation
    }

    /// Forget connections whose runner already ended
    fn prune(&mut self) {
        self.connections.retain(|_, connection| connection.is_connected());
    }

    fn emit(&self, event: VoiceEvent) {
        if self.events_tx.send(event).is_err() {
            tracing::debug!("Voice event receiver dropped");
        }
    }

    #[must_use]
    pub fn connection(&self, guild_id: Snowflake) -> Option<&VoiceConnection> {
        self.connections
            .get(&guild_id)
            .filter(|connection| connection.is_connected())
    }

    /// Guilds with a live connection
    pub fn connected_guilds(&self) -> impl Iterator<Item = Snowflake> + '_ {
        self.connections
            .iter()
            .filter(|(_, connection)| connection.is_connected())
            .map(|(guild_id, _)| *guild_id)
    }

    /// Play on the guild's connection
    pub fn play(
        &self,
        guild_id: Snowflake,
        source: Box<dyn AudioSource>,
        encoder: Option<Box<dyn AudioEncoder>>,
    ) -> VoiceResult<AudioPlayer> {
        self.connection(guild_id)
            .ok_or(VoiceError::NotConnected)?
            .play(source, encoder)
    }

    #[must_use]
    pub fn is_pending(&self, guild_id: Snowflake) -> bool {
        self.buffer.is_pending(guild_id)
    }

    /// Leave every channel; used on client shutdown
    pub async fn disconnect_all(&mut self) {
        let guilds: Vec<Snowflake> = self.connections.keys().copied().collect();
        for guild_id in guilds {
            if let Err(e) = self.leave(guild_id).await {
                tracing::warn!(guild_id = %guild_id, error = %e, "Failed to leave voice channel");
            }
        }
        self.buffer.clear_all();
    }
}

impl std::fmt::Debug for VoiceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoiceManager")
            .field("enabled", &self.config.enabled)
            .field("shard_count", &self.shard_count)
            .field("connections", &self.connections.len())
            .field("pending", &self.buffer.pending.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway_link::testing::RecordingGateway;

    const GUILD: Snowflake = Snowflake::new(41_771_983_423_143_937);
    const CHANNEL: Snowflake = Snowflake::new(127_121_515_262_115_840);
    const USER: Snowflake = Snowflake::new(80_351_110_224_678_912);

    #[test]
    fn test_state_then_server_pairs_credentials() {
        let mut buffer = CredentialBuffer::new();
        assert!(buffer
            .on_state(GUILD, Some(CHANNEL), USER, "session".into())
            .is_none());
        assert!(buffer.is_pending(GUILD));

        let info = buffer
            .on_server(GUILD, "token".into(), Some("voice.example.com".into()))
            .unwrap();
        assert_eq!(info.guild_id, GUILD);
        assert_eq!(info.channel_id, CHANNEL);
        assert_eq!(info.user_id, USER);
        assert_eq!(info.session_id, "session");
        assert_eq!(info.token, "token");
        assert_eq!(info.endpoint, "voice.example.com");
    }

    #[test]
    fn test_server_then_state_pairs_credentials() {
        let mut buffer = CredentialBuffer::new();
        assert!(buffer
            .on_server(GUILD, "token".into(), Some("voice.example.com".into()))
            .is_none());

        let info = buffer
            .on_state(GUILD, Some(CHANNEL), USER, "session".into())
            .unwrap();
        assert_eq!(info.token, "token");
    }

    #[test]
    fn test_completed_pair_is_not_handed_out_twice() {
        let mut buffer = CredentialBuffer::new();
        buffer.on_state(GUILD, Some(CHANNEL), USER, "session".into());
        assert!(buffer
            .on_server(GUILD, "token".into(), Some("a.example.com".into()))
            .is_some());

        // Mute toggles resend the voice state
        assert!(buffer
            .on_state(GUILD, Some(CHANNEL), USER, "session".into())
            .is_none());

        // A server move reuses the remembered session
        let moved = buffer
            .on_server(GUILD, "token-2".into(), Some("b.example.com".into()))
            .unwrap();
        assert_eq!(moved.session_id, "session");
        assert_eq!(moved.endpoint, "b.example.com");
    }

    #[test]
    fn test_missing_endpoint_waits() {
        let mut buffer = CredentialBuffer::new();
        buffer.on_state(GUILD, Some(CHANNEL), USER, "session".into());
        assert!(buffer.on_server(GUILD, "token".into(), None).is_none());

        let info = buffer
            .on_server(GUILD, "token".into(), Some("voice.example.com".into()))
            .unwrap();
        assert_eq!(info.endpoint, "voice.example.com");
    }

    #[test]
    fn test_leaving_channel_forgets_guild() {
        let mut buffer = CredentialBuffer::new();
        buffer.on_server(GUILD, "token".into(), Some("voice.example.com".into()));
        assert!(buffer.on_state(GUILD, None, USER, "session".into()).is_none());
        assert!(!buffer.is_pending(GUILD));
    }

    #[test]
    fn test_clear_where() {
        let mut buffer = CredentialBuffer::new();
        buffer.on_state(Snowflake::new(1), Some(CHANNEL), USER, "a".into());
        buffer.on_state(Snowflake::new(2), Some(CHANNEL), USER, "b".into());

        buffer.clear_where(|guild_id| guild_id == Snowflake::new(1));
        assert!(!buffer.is_pending(Snowflake::new(1)));
        assert!(buffer.is_pending(Snowflake::new(2)));

        buffer.clear_all();
        assert!(!buffer.is_pending(Snowflake::new(2)));
    }

    fn manager(enabled: bool) -> (VoiceManager, Arc<RecordingGateway>) {
        let gateway = Arc::new(RecordingGateway::default());
        let config = VoiceConfig {
            enabled,
            connect_timeout_ms: 500,
            ..VoiceConfig::default()
        };
        let link: Arc<dyn VoiceStateSender> = gateway.clone();
        (VoiceManager::new(config, link, 2), gateway)
    }

    #[tokio::test]
    async fn test_join_sends_voice_state_through_gateway() {
        let (mut manager, gateway) = manager(true);
        manager.join(GUILD, CHANNEL, false, true).await.unwrap();

        let sent = gateway.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].channel_id, Some(CHANNEL));
        assert!(sent[0].self_deaf);
    }

    #[tokio::test]
    async fn test_join_when_disabled_fails() {
        let (mut manager, gateway) = manager(false);
        assert!(matches!(
            manager.join(GUILD, CHANNEL, false, false).await,
            Err(VoiceError::Disabled)
        ));
        assert!(gateway.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_leave_without_connection_still_leaves() {
        let (mut manager, gateway) = manager(true);
        manager
            .handle_signal(VoiceSignal::StateUpdate {
                guild_id: GUILD,
                channel_id: Some(CHANNEL),
                user_id: USER,
                session_id: "session".into(),
            })
            .await
            .unwrap();
        assert!(manager.is_pending(GUILD));

        manager.leave(GUILD).await.unwrap();
        assert!(!manager.is_pending(GUILD));
        assert_eq!(
            gateway.sent.lock().unwrap().clone(),
            vec![VoiceStateUpdatePayload::leave(GUILD)]
        );
    }

    #[tokio::test]
    async fn test_failed_handshake_is_reported() {
        let (mut manager, _gateway) = manager(true);
        let mut events = manager.take_events().unwrap();
        assert!(manager.take_events().is_none());

        manager
            .handle_signal(VoiceSignal::StateUpdate {
                guild_id: GUILD,
                channel_id: Some(CHANNEL),
                user_id: USER,
                session_id: "session".into(),
            })
            .await
            .unwrap();
        let err = manager
            .handle_signal(VoiceSignal::ServerUpdate {
                guild_id: GUILD,
                token: "token".into(),
                endpoint: Some("ws://127.0.0.1:9".into()),
            })
            .await
            .unwrap_err();
        assert_eq!(err.guild_id, GUILD);

        assert!(matches!(
            events.recv().await,
            Some(VoiceEvent::Disconnected {
                reason: DisconnectReason::Failed(_),
                ..
            })
        ));
        assert!(manager.connection(GUILD).is_none());
        assert!(matches!(
            manager.play(GUILD, Box::new(crate::audio::EncodedFrames::default()), None),
            Err(VoiceError::NotConnected)
        ));
    }

    /// Endpoint that accepts TCP but never answers the WebSocket upgrade
    async fn silent_endpoint() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("ws://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });
        endpoint
    }

    fn pair(manager: &mut VoiceManager, endpoint: &str) -> PendingHandshake {
        let state = manager
            .accept_signal(VoiceSignal::StateUpdate {
                guild_id: GUILD,
                channel_id: Some(CHANNEL),
                user_id: USER,
                session_id: "session".into(),
            })
            .unwrap();
        assert!(state.is_none());
        manager
            .accept_signal(VoiceSignal::ServerUpdate {
                guild_id: GUILD,
                token: "token".into(),
                endpoint: Some(endpoint.to_string()),
            })
            .unwrap()
            .expect("credentials paired")
    }

    #[tokio::test]
    async fn test_manager_usable_while_handshake_runs() {
        let (mut manager, gateway) = manager(true);
        let mut events = manager.take_events().unwrap();
        let pending = pair(&mut manager, &silent_endpoint().await);
        assert_eq!(pending.guild_id(), GUILD);

        let handshake = tokio::spawn(pending.connect());
        manager.join(GUILD, CHANNEL, true, false).await.unwrap();
        assert!(!handshake.is_finished());

        let outcome = handshake.await.unwrap();
        let err = manager.complete(outcome).unwrap_err();
        assert!(matches!(err.source, VoiceError::Timeout(_)));
        assert!(matches!(
            events.recv().await,
            Some(VoiceEvent::Disconnected {
                reason: DisconnectReason::Failed(_),
                ..
            })
        ));
        assert_eq!(gateway.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_leave_during_handshake_discards_outcome() {
        let (mut manager, gateway) = manager(true);
        let mut events = manager.take_events().unwrap();
        let pending = pair(&mut manager, &silent_endpoint().await);

        let handshake = tokio::spawn(pending.connect());
        manager.leave(GUILD).await.unwrap();

        let outcome = handshake.await.unwrap();
        manager.complete(outcome).unwrap();
        assert!(events.try_recv().is_err());
        assert!(manager.connection(GUILD).is_none());
        assert_eq!(
            gateway.sent.lock().unwrap().clone(),
            vec![VoiceStateUpdatePayload::leave(GUILD)]
        );
    }

    #[tokio::test]
    async fn test_session_lost_clears_guilds_on_that_shard() {
        let (mut manager, _gateway) = manager(true);
        // Shard of a guild is (id >> 22) % 2
        let on_zero = Snowflake::new(2 << 22);
        let on_one = Snowflake::new(1 << 22);
        for guild_id in [on_zero, on_one] {
            manager
                .handle_signal(VoiceSignal::StateUpdate {
                    guild_id,
                    channel_id: Some(CHANNEL),
                    user_id: USER,
                    session_id: "session".into(),
                })
                .await
                .unwrap();
        }

        manager
            .handle_signal(VoiceSignal::SessionLost { shard_id: 1 })
            .await
            .unwrap();
        assert!(manager.is_pending(on_zero));
        assert!(!manager.is_pending(on_one));
    }
}
