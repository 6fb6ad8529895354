//! Voice connection
//!
//! `connect` runs the handshake: voice gateway Hello and Identify, Ready, UDP
//! IP discovery, mode selection, SelectProtocol and SessionDescription. After
//! that a runner task keeps the voice gateway heartbeat and the UDP keepalive
//! going, and resumes the voice gateway once when a heartbeat goes
//! unacknowledged or the socket drops.
//!
//! A running player is cut off as soon as the connection is torn down,
//! whether by `disconnect`, by dropping it, or by the runner ending.

use crate::audio::{AudioEncoder, AudioPlayer, AudioSender, AudioSource, SpeakingHook};
use crate::crypto::{EncryptionMode, PacketCipher};
use crate::error::{VoiceError, VoiceResult};
use crate::gateway_link::VoiceStateSender;
use crate::protocol::{
    CloseAction, SessionDescription, VoiceHello, VoiceIdentify, VoiceMessage, VoiceOpCode,
    VoiceReady, VoiceResume,
};
use crate::udp::discover;
use chat_common::VoiceConfig;
use chat_core::Snowflake;
use chat_gateway::protocol::VoiceStateUpdatePayload;
use chat_tasks::{Loop, Schedule};
use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const VOICE_GATEWAY_VERSION: u8 = 4;
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);
/// Close code used when dropping a voice socket we intend to resume
const RESUME_CLOSE_CODE: u16 = 4000;

/// Credentials for one voice session, paired from the two gateway events
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceServerInfo {
    pub guild_id: Snowflake,
    pub channel_id: Snowflake,
    pub user_id: Snowflake,
    pub session_id: String,
    pub token: String,
    pub endpoint: String,
}

impl VoiceServerInfo {
    /// Voice gateway URL for the endpoint
    #[must_use]
    pub fn gateway_url(&self) -> String {
        endpoint_url(&self.endpoint)
    }
}

/// Accepts a bare `host:port` or a full ws/wss URL
fn endpoint_url(endpoint: &str) -> String {
    let base = if endpoint.starts_with("wss://") || endpoint.starts_with("ws://") {
        endpoint.to_string()
    } else {
        format!("wss://{endpoint}")
    };
    format!("{}/?v={VOICE_GATEWAY_VERSION}", base.trim_end_matches('/'))
}

/// Why a voice connection ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// `disconnect` was called
    Requested,
    /// The server closed the session for good (kicked, moved, session invalid)
    Closed { code: u16 },
    /// The gateway reported that the user left the channel
    Left,
    /// The owning gateway session was lost
    SessionLost,
    /// The voice gateway failed and could not be resumed
    Failed(String),
}

/// Lifecycle notifications for voice connections
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoiceEvent {
    Connected {
        guild_id: Snowflake,
        channel_id: Snowflake,
    },
    Resumed {
        guild_id: Snowflake,
    },
    Disconnected {
        guild_id: Snowflake,
        reason: DisconnectReason,
    },
}

impl VoiceEvent {
    #[must_use]
    pub fn guild_id(&self) -> Snowflake {
        match self {
            Self::Connected { guild_id, .. }
            | Self::Resumed { guild_id }
            | Self::Disconnected { guild_id, .. } => *guild_id,
        }
    }
}

enum VoiceCommand {
    Speaking(bool),
    Disconnect,
}

/// Established voice session
pub struct VoiceConnection {
    guild_id: Snowflake,
    channel_id: Snowflake,
    ssrc: u32,
    mode: EncryptionMode,
    encoder_available: bool,
    sender: Arc<Mutex<AudioSender>>,
    closed: Arc<watch::Sender<bool>>,
    commands: mpsc::UnboundedSender<VoiceCommand>,
    gateway: Arc<dyn VoiceStateSender>,
    task: Option<JoinHandle<()>>,
}

impl VoiceConnection {
    /// Run the handshake and start the session
    ///
    /// The whole handshake is bounded by `config.connect_timeout()`.
    pub async fn connect(
        info: VoiceServerInfo,
        config: &VoiceConfig,
        gateway: Arc<dyn VoiceStateSender>,
        events: mpsc::UnboundedSender<VoiceEvent>,
    ) -> VoiceResult<Self> {
        let established = timeout(config.connect_timeout(), handshake(&info))
            .await
            .map_err(|_| VoiceError::Timeout("voice handshake"))??;

        let mode = established.cipher.mode();
        let ssrc = established.ssrc;
        let (heartbeat, beats) = start_heartbeat(info.guild_id, established.heartbeat_interval)?;
        let keepalive = start_keepalive(
            Arc::clone(&established.socket),
            info.guild_id,
            config.udp_keepalive(),
        )?;

        tracing::info!(
            guild_id = %info.guild_id,
            channel_id = %info.channel_id,
            ssrc,
            mode = %mode,
            "Voice connected"
        );
        if events
            .send(VoiceEvent::Connected {
                guild_id: info.guild_id,
                channel_id: info.channel_id,
            })
            .is_err()
        {
            tracing::debug!(guild_id = %info.guild_id, "Voice event receiver dropped");
        }

        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (closed, closed_rx) = watch::channel(false);
        let closed = Arc::new(closed);
        let sender = AudioSender::new(Arc::clone(&established.socket), established.cipher, ssrc)
            .with_close_signal(closed_rx);

        let runner = VoiceRunner {
            info: info.clone(),
            connect_timeout: config.connect_timeout(),
            ws: established.ws,
            ssrc,
            gateway: Arc::clone(&gateway),
            commands,
            events,
            heartbeat,
            beats,
            _keepalive: keepalive,
            closed: Arc::clone(&closed),
            awaiting_ack: false,
            last_heartbeat: None,
        };

        Ok(Self {
            guild_id: info.guild_id,
            channel_id: info.channel_id,
            ssrc,
            mode,
            encoder_available: config.encoder_available,
            sender: Arc::new(Mutex::new(sender)),
            closed,
            commands: commands_tx,
            gateway,
            task: Some(tokio::spawn(runner.run())),
        })
    }

    #[must_use]
    pub fn guild_id(&self) -> Snowflake {
        self.guild_id
    }

    #[must_use]
    pub fn channel_id(&self) -> Snowflake {
        self.channel_id
    }

    #[must_use]
    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    #[must_use]
    pub fn mode(&self) -> EncryptionMode {
        self.mode
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Start playing `source`; only one player may run at a time
    ///
    /// PCM sources need both an encoder and `encoder_available` in the
    /// voice config.
    pub fn play(
        &self,
        source: Box<dyn AudioSource>,
        encoder: Option<Box<dyn AudioEncoder>>,
    ) -> VoiceResult<AudioPlayer> {
        if !self.is_connected() {
            return Err(VoiceError::NotConnected);
        }
        if !source.is_encoded() && !self.encoder_available {
            return Err(VoiceError::MissingEncoder);
        }

        let guard = Arc::clone(&self.sender)
            .try_lock_owned()
            .map_err(|_| VoiceError::AlreadyPlaying)?;
        let commands = self.commands.clone();
        let speaking: SpeakingHook = Arc::new(move |on| {
            let _ = commands.send(VoiceCommand::Speaking(on));
        });

        AudioPlayer::start(source, encoder, guard, Some(speaking))
    }

    /// Leave the channel through the gateway, then close the sockets
    pub async fn disconnect(&mut self) -> VoiceResult<()> {
        let Some(task) = self.task.take() else {
            return Err(VoiceError::NotConnected);
        };
        self.closed.send_replace(true);

        let left = self
            .gateway
            .update_voice_state(VoiceStateUpdatePayload::leave(self.guild_id))
            .await;

        let _ = self.commands.send(VoiceCommand::Disconnect);
        if let Err(e) = task.await {
            tracing::debug!(guild_id = %self.guild_id, error = %e, "Voice runner ended abnormally");
        }

        left.map_err(VoiceError::from)
    }
}

impl Drop for VoiceConnection {
    fn drop(&mut self) {
        self.closed.send_replace(true);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for VoiceConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoiceConnection")
            .field("guild_id", &self.guild_id)
            .field("channel_id", &self.channel_id)
            .field("ssrc", &self.ssrc)
            .field("mode", &self.mode)
            .field("connected", &self.is_connected())
            .finish()
    }
}

struct Established {
    ws: WsStream,
    socket: Arc<UdpSocket>,
    ssrc: u32,
    heartbeat_interval: Duration,
    cipher: PacketCipher,
}

async fn handshake(info: &VoiceServerInfo) -> VoiceResult<Established> {
    let url = info.gateway_url();
    tracing::debug!(guild_id = %info.guild_id, url = %url, "Connecting to voice gateway");
    let (mut ws, _) = connect_async(url.as_str()).await?;

    let hello: VoiceHello = expect(&mut ws, VoiceOpCode::Hello).await?;
    let heartbeat_interval = heartbeat_interval(&hello)?;

    let identify = VoiceIdentify {
        server_id: info.guild_id,
        user_id: info.user_id,
        session_id: info.session_id.clone(),
        token: info.token.clone(),
    };
    send(&mut ws, &VoiceMessage::identify(&identify)?).await?;

    let ready: VoiceReady = expect(&mut ws, VoiceOpCode::Ready).await?;
    let offered_mode = EncryptionMode::select(&ready.modes)?;
    tracing::debug!(
        guild_id = %info.guild_id,
        ssrc = ready.ssrc,
        mode = %offered_mode,
        "Voice ready"
    );

    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect((ready.ip.as_str(), ready.port)).await?;
    let external = discover(&socket, ready.ssrc, DISCOVERY_TIMEOUT).await?;

    let select =
        VoiceMessage::select_protocol(external.ip, external.port, offered_mode.as_str())?;
    send(&mut ws, &select).await?;

    let description: SessionDescription = expect(&mut ws, VoiceOpCode::SessionDescription).await?;
    let mode = EncryptionMode::from_name(&description.mode).ok_or_else(|| {
        VoiceError::Negotiation(format!("server chose unsupported mode {}", description.mode))
    })?;
    let cipher = PacketCipher::new(mode, &description.secret_key)?;

    Ok(Established {
        ws,
        socket: Arc::new(socket),
        ssrc: ready.ssrc,
        heartbeat_interval,
        cipher,
    })
}

fn heartbeat_interval(hello: &VoiceHello) -> VoiceResult<Duration> {
    Duration::try_from_secs_f64(hello.heartbeat_interval / 1000.0)
        .ok()
        .filter(|interval| !interval.is_zero())
        .ok_or_else(|| {
            VoiceError::Protocol(format!(
                "invalid heartbeat interval {}",
                hello.heartbeat_interval
            ))
        })
}

async fn send(ws: &mut WsStream, message: &VoiceMessage) -> VoiceResult<()> {
    ws.send(Message::Text(message.to_json()?)).await?;
    Ok(())
}

fn closed(frame: Option<CloseFrame<'_>>) -> VoiceError {
    match frame {
        Some(frame) => VoiceError::Closed {
            code: u16::from(frame.code),
            reason: frame.reason.into_owned(),
        },
        None => VoiceError::ConnectionLost,
    }
}

/// Read until a message with `op` arrives, skipping everything else
async fn expect<T: DeserializeOwned>(ws: &mut WsStream, op: VoiceOpCode) -> VoiceResult<T> {
    loop {
        let text = match ws.next().await {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(frame))) => return Err(closed(frame)),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
            None => return Err(VoiceError::ConnectionLost),
        };
        match VoiceMessage::from_json(&text) {
            Ok(message) => {
                if let Some(payload) = message.parse::<T>(op) {
                    return Ok(payload?);
                }
                tracing::trace!(op = %message.op, expected = %op, "Skipping voice message");
            }
            Err(e) => tracing::trace!(error = %e, "Skipping undecodable voice frame"),
        }
    }
}

fn start_heartbeat(
    guild_id: Snowflake,
    interval: Duration,
) -> VoiceResult<(Loop, mpsc::Receiver<()>)> {
    let (beat_tx, beats) = mpsc::channel(1);
    let heartbeat = Loop::builder(Schedule::every(interval))
        .name(format!("voice-heartbeat-{guild_id}"))
        .clear_exception_types()
        .build(move |_| {
            let beat_tx = beat_tx.clone();
            async move {
                beat_tx
                    .send(())
                    .await
                    .map_err(|_| anyhow::anyhow!("voice connection closed"))
            }
        })?;
    heartbeat.start()?;
    Ok((heartbeat, beats))
}

/// UDP keepalive: an 8-byte big-endian counter that wraps at 32 bits
fn start_keepalive(socket: Arc<UdpSocket>, guild_id: Snowflake, every: Duration) -> VoiceResult<Loop> {
    let keepalive = Loop::builder(Schedule::every(every))
        .name(format!("voice-keepalive-{guild_id}"))
        .build(move |iteration| {
            let socket = Arc::clone(&socket);
            async move {
                let packet = (iteration & u64::from(u32::MAX)).to_be_bytes();
                socket.send(&packet).await?;
                Ok(())
            }
        })?;
    keepalive.start()?;
    Ok(keepalive)
}

/// Background half of a voice connection
struct VoiceRunner {
    info: VoiceServerInfo,
    connect_timeout: Duration,
    ws: WsStream,
    ssrc: u32,
    gateway: Arc<dyn VoiceStateSender>,
    commands: mpsc::UnboundedReceiver<VoiceCommand>,
    events: mpsc::UnboundedSender<VoiceEvent>,
    heartbeat: Loop,
    beats: mpsc::Receiver<()>,
    _keepalive: Loop,
    closed: Arc<watch::Sender<bool>>,
    awaiting_ack: bool,
    last_heartbeat: Option<Instant>,
}

impl VoiceRunner {
    fn guild_id(&self) -> Snowflake {
        self.info.guild_id
    }

    async fn run(mut self) {
        let reason = match self.serve().await {
            Ok(reason) => reason,
            Err(e) => {
                tracing::error!(guild_id = %self.guild_id(), error = %e, "Voice session failed");
                // Leave explicitly so the server does not wait for a timeout
                if let Err(leave) = self
                    .gateway
                    .update_voice_state(VoiceStateUpdatePayload::leave(self.guild_id()))
                    .await
                {
                    tracing::warn!(guild_id = %self.guild_id(), error = %leave, "Failed to leave voice channel");
                }
                DisconnectReason::Failed(e.to_string())
            }
        };
        self.closed.send_replace(true);

        tracing::info!(guild_id = %self.guild_id(), reason = ?reason, "Voice disconnected");
        self.emit(VoiceEvent::Disconnected {
            guild_id: self.guild_id(),
            reason,
        });
    }

    async fn serve(&mut self) -> VoiceResult<DisconnectReason> {
        loop {
            let failure = tokio::select! {
                frame = self.ws.next() => match self.handle_frame(frame) {
                    Ok(()) => continue,
                    Err(e) => e,
                },
                Some(()) = self.beats.recv() => {
                    if self.awaiting_ack {
                        VoiceError::HeartbeatTimeout
                    } else {
                        match self.send_heartbeat().await {
                            Ok(()) => continue,
                            Err(e) => e,
                        }
                    }
                }
                command = self.commands.recv() => match command {
                    Some(VoiceCommand::Speaking(on)) => {
                        let message = VoiceMessage::speaking(on, self.ssrc)?;
                        match send(&mut self.ws, &message).await {
                            Ok(()) => continue,
                            Err(e) => e,
                        }
                    }
                    Some(VoiceCommand::Disconnect) | None => {
                        self.close(1000).await;
                        return Ok(DisconnectReason::Requested);
                    }
                },
            };

            match failure.action() {
                CloseAction::Resume => {
                    tracing::warn!(guild_id = %self.guild_id(), error = %failure, "Voice gateway lost, resuming");
                    self.resume().await?;
                    tracing::info!(guild_id = %self.guild_id(), "Voice session resumed");
                    self.emit(VoiceEvent::Resumed {
                        guild_id: self.guild_id(),
                    });
                }
                CloseAction::Teardown => {
                    return match failure {
                        VoiceError::Closed { code, .. } => Ok(DisconnectReason::Closed { code }),
                        other => Err(other),
                    };
                }
                CloseAction::Fatal => return Err(failure),
            }
        }
    }

    fn handle_frame(&mut self, frame: Option<Result<Message, tungstenite::Error>>) -> VoiceResult<()> {
        let text = match frame {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(frame))) => return Err(closed(frame)),
            Some(Ok(_)) => return Ok(()),
            Some(Err(e)) => return Err(e.into()),
            None => return Err(VoiceError::ConnectionLost),
        };

        let message = match VoiceMessage::from_json(&text) {
            Ok(message) => message,
            Err(e) => {
                tracing::trace!(guild_id = %self.guild_id(), error = %e, "Dropping undecodable voice frame");
                return Ok(());
            }
        };

        if message.op == VoiceOpCode::HeartbeatAck {
            self.awaiting_ack = false;
            if let Some(sent) = self.last_heartbeat {
                tracing::trace!(
                    guild_id = %self.guild_id(),
                    latency_ms = sent.elapsed().as_millis() as u64,
                    "Voice heartbeat acknowledged"
                );
            }
        } else {
            tracing::trace!(guild_id = %self.guild_id(), op = %message.op, "Voice gateway message");
        }
        Ok(())
    }

    async fn send_heartbeat(&mut self) -> VoiceResult<()> {
        let nonce = u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default();
        send(&mut self.ws, &VoiceMessage::heartbeat(nonce)).await?;
        self.awaiting_ack = true;
        self.last_heartbeat = Some(Instant::now());
        Ok(())
    }

    /// Reconnect the voice gateway and resume; the UDP socket is kept
    async fn resume(&mut self) -> VoiceResult<()> {
        self.close(RESUME_CLOSE_CODE).await;

        let (ws, hello) = timeout(self.connect_timeout, self.reconnect())
            .await
            .map_err(|_| VoiceError::Timeout("voice resume"))??;

        let (heartbeat, beats) = start_heartbeat(self.guild_id(), heartbeat_interval(&hello)?)?;
        self.ws = ws;
        self.heartbeat = heartbeat;
        self.beats = beats;
        self.awaiting_ack = false;
        self.last_heartbeat = None;
        Ok(())
    }

    async fn reconnect(&self) -> VoiceResult<(WsStream, VoiceHello)> {
        let (mut ws, _) = connect_async(self.info.gateway_url().as_str()).await?;
        let hello: VoiceHello = expect(&mut ws, VoiceOpCode::Hello).await?;

        let resume = VoiceResume {
            server_id: self.info.guild_id,
            session_id: self.info.session_id.clone(),
            token: self.info.token.clone(),
        };
        send(&mut ws, &VoiceMessage::resume(&resume)?).await?;
        expect::<serde::de::IgnoredAny>(&mut ws, VoiceOpCode::Resumed).await?;
        Ok((ws, hello))
    }

    async fn close(&mut self, code: u16) {
        let frame = CloseFrame {
            code: WsCloseCode::from(code),
            reason: "".into(),
        };
        if let Err(e) = self.ws.close(Some(frame)).await {
            tracing::debug!(guild_id = %self.guild_id(), error = %e, "Error while closing voice gateway");
        }
    }

    fn emit(&self, event: VoiceEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!(guild_id = %self.guild_id(), "Voice event receiver dropped");
        }
    }
}
