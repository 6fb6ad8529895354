//! Shard runner
//!
//! Owns one gateway connection at a time. The outer loop reconnects with
//! backoff; the inner loop multiplexes inbound frames, heartbeat ticks,
//! commands from handles and delivery of buffered dispatch events.
//!
//! Dispatches never block the loop: when the events channel is full they
//! wait in an ordered backlog, so heartbeats keep flowing while a slow
//! consumer catches up. Commands sent while the shard is not connected are
//! held and written once the next session is up.

use super::handle::ShardCommand;
use super::{IdentifyQueue, Session, ShardConfig, ShardInfo, ShardState};
use crate::error::{GatewayError, GatewayResult};
use crate::events::{DispatchEvent, EventKind};
use crate::protocol::{
    CloseCode, GatewayCommand, GatewayMessage, HelloPayload, IdentifyPayload, OpCode,
    ReadyPayload, VoiceServerEvent, VoiceStateEvent,
};
use crate::voice::VoiceSignal;
use chat_tasks::{ExponentialBackoff, Loop, Schedule};
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, timeout, Instant};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Backlog length at which a lagging event consumer is reported
const BACKLOG_WARN: usize = 1024;

/// How a connection ended without an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionOutcome {
    /// Stop the shard
    Shutdown,
    /// Connect again right away, resuming if possible
    Reconnect,
    /// Session was invalidated; wait, then identify fresh
    Reidentify,
}

/// What to do after handling one frame
enum Flow {
    Continue,
    Finish(ConnectionOutcome),
}

/// One live WebSocket connection and its liveness bookkeeping
struct Connection {
    ws: WsStream,
    awaiting_ack: bool,
    last_heartbeat: Option<Instant>,
    violations: u32,
}

impl Connection {
    fn new(ws: WsStream) -> Self {
        Self {
            ws,
            awaiting_ack: false,
            last_heartbeat: None,
            violations: 0,
        }
    }

    async fn send(&mut self, message: &GatewayMessage) -> GatewayResult<()> {
        let json = message.to_json()?;
        self.ws.send(Message::Text(json)).await?;
        Ok(())
    }

    async fn close(&mut self, code: u16, reason: &'static str) {
        let frame = CloseFrame {
            code: WsCloseCode::from(code),
            reason: reason.into(),
        };
        if let Err(e) = self.ws.close(Some(frame)).await {
            tracing::debug!(error = %e, "Error while closing gateway connection");
        }
    }
}

pub(crate) struct ShardRunner {
    config: ShardConfig,
    session: Session,
    identify_queue: Arc<IdentifyQueue>,
    events: mpsc::Sender<DispatchEvent>,
    voice: Option<mpsc::UnboundedSender<VoiceSignal>>,
    commands: mpsc::Receiver<ShardCommand>,
    info: watch::Sender<ShardInfo>,
    backoff: ExponentialBackoff,
    /// Dispatches waiting for room in the events channel, oldest first
    backlog: VecDeque<DispatchEvent>,
    /// Commands held until the shard is connected
    pending: VecDeque<GatewayCommand>,
}

impl ShardRunner {
    pub(crate) fn new(
        config: ShardConfig,
        identify_queue: Arc<IdentifyQueue>,
        events: mpsc::Sender<DispatchEvent>,
        voice: Option<mpsc::UnboundedSender<VoiceSignal>>,
        commands: mpsc::Receiver<ShardCommand>,
        info: watch::Sender<ShardInfo>,
    ) -> Self {
        let backoff =
            ExponentialBackoff::new(config.reconnect.initial_delay(), config.reconnect.max_delay())
                .with_jitter(config.reconnect.jitter_ratio);
        Self {
            config,
            session: Session::new(),
            identify_queue,
            events,
            voice,
            commands,
            info,
            backoff,
            backlog: VecDeque::new(),
            pending: VecDeque::new(),
        }
    }

    fn shard_id(&self) -> u32 {
        self.config.shard_id
    }

    /// Run until shutdown or a fatal error
    pub(crate) async fn run(mut self) -> GatewayResult<()> {
        tracing::info!(
            shard_id = self.shard_id(),
            shard_count = self.config.shard_count,
            "Starting shard"
        );

        loop {
            let result = self.run_connection().await;
            self.set_state(ShardState::Disconnected);

            let delay = match result {
                Ok(ConnectionOutcome::Shutdown) => {
                    self.stopped();
                    return Ok(());
                }
                Ok(ConnectionOutcome::Reconnect) => {
                    tracing::debug!(shard_id = self.shard_id(), "Reconnecting");
                    continue;
                }
                Ok(ConnectionOutcome::Reidentify) => self.invalid_session_delay(),
                Err(e) if e.is_fatal() => {
                    tracing::error!(shard_id = self.shard_id(), error = %e, "Fatal gateway error");
                    self.stopped();
                    return Err(e);
                }
                Err(e) => {
                    if let Some(code) = e.close_code() {
                        if code.invalidates_session() {
                            self.session_lost();
                        }
                    }
                    let delay = self.backoff.next_delay();
                    let attempt = self.backoff.attempts();
                    self.info.send_modify(|info| info.reconnect_attempts = attempt);
                    tracing::warn!(
                        shard_id = self.shard_id(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Gateway connection lost, reconnecting"
                    );
                    delay
                }
            };

            if self.wait_or_shutdown(delay).await {
                self.stopped();
                return Ok(());
            }
        }
    }

    /// Hand over what can still be delivered before the runner exits
    fn stopped(&mut self) {
        self.flush_backlog();
        if !self.backlog.is_empty() {
            tracing::debug!(
                shard_id = self.shard_id(),
                events = self.backlog.len(),
                "Dropping undelivered events"
            );
        }
        if !self.pending.is_empty() {
            tracing::warn!(
                shard_id = self.shard_id(),
                commands = self.pending.len(),
                "Dropping commands held for a session that never came"
            );
        }
        tracing::info!(shard_id = self.shard_id(), "Shard stopped");
    }

    /// Sleep before the next attempt; returns true if shutdown was requested
    async fn wait_or_shutdown(&mut self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        loop {
            let events = self.events.clone();
            tokio::select! {
                () = sleep_until(deadline) => return false,
                command = self.commands.recv() => match command {
                    Some(ShardCommand::Shutdown) | None => return true,
                    Some(ShardCommand::Reconnect) => return false,
                    Some(ShardCommand::Send(command)) => self.hold(command),
                },
                permit = events.reserve(), if !self.backlog.is_empty() => match permit {
                    Ok(permit) => {
                        match self.backlog.pop_front() {
                            Some(event) => permit.send(event),
                            None => drop(permit),
                        }
                        self.flush_backlog();
                    }
                    Err(_) => self.receiver_dropped(),
                },
            }
        }
    }

    async fn run_connection(&mut self) -> GatewayResult<ConnectionOutcome> {
        self.set_state(ShardState::Connecting);

        let base = self
            .session
            .resume_url()
            .unwrap_or(self.config.gateway_url.as_str())
            .to_string();
        let url = self.config.connect_url(&base);
        tracing::debug!(shard_id = self.shard_id(), url = %url, "Connecting to gateway");

        let (ws, _) = connect_async(url.as_str()).await?;
        let mut conn = Connection::new(ws);

        let hello = timeout(self.config.hello_timeout, read_hello(&mut conn.ws))
            .await
            .map_err(|_| GatewayError::HelloTimeout)??;
        let interval = Duration::from_millis(hello.heartbeat_interval);
        tracing::debug!(
            shard_id = self.shard_id(),
            heartbeat_interval_ms = hello.heartbeat_interval,
            "Received Hello"
        );

        // Dropping the loop aborts it, so heartbeats end with this connection
        let (beat_tx, mut beats) = mpsc::channel(1);
        let _heartbeat = self.start_heartbeat(interval, beat_tx)?;

        if let Some(resume) = self.session.resume_payload(&self.config.token) {
            self.set_state(ShardState::Resuming);
            tracing::info!(
                shard_id = self.shard_id(),
                session_id = %resume.session_id,
                seq = resume.seq,
                "Resuming session"
            );
            conn.send(&GatewayMessage::resume(&resume)?).await?;
        } else {
            self.identify(&mut conn).await?;
        }

        loop {
            let events = self.events.clone();
            tokio::select! {
                frame = conn.ws.next() => {
                    let frame = match frame {
                        Some(frame) => frame?,
                        None => return Err(GatewayError::ConnectionLost),
                    };
                    if let Flow::Finish(outcome) = self.handle_frame(&mut conn, frame).await? {
                        let code = match outcome {
                            ConnectionOutcome::Reconnect => CloseCode::UnknownError.as_u16(),
                            _ => 1000,
                        };
                        conn.close(code, "reconnecting").await;
                        return Ok(outcome);
                    }
                    if !self.pending.is_empty() && self.is_connected() {
                        self.flush_pending(&mut conn).await?;
                    }
                }
                Some(()) = beats.recv() => {
                    if conn.awaiting_ack {
                        tracing::warn!(
                            shard_id = self.shard_id(),
                            "Heartbeat not acknowledged, closing zombie connection"
                        );
                        conn.close(CloseCode::UnknownError.as_u16(), "heartbeat timeout").await;
                        return Err(GatewayError::HeartbeatTimeout);
                    }
                    self.send_heartbeat(&mut conn).await?;
                }
                permit = events.reserve(), if !self.backlog.is_empty() => match permit {
                    Ok(permit) => {
                        match self.backlog.pop_front() {
                            Some(event) => permit.send(event),
                            None => drop(permit),
                        }
                        self.flush_backlog();
                    }
                    Err(_) => self.receiver_dropped(),
                },
                command = self.commands.recv() => match command {
                    Some(ShardCommand::Send(command)) if self.is_connected() => {
                        tracing::trace!(shard_id = self.shard_id(), op = %command.op(), "Sending command");
                        conn.send(&command.to_message()?).await?;
                    }
                    Some(ShardCommand::Send(command)) => self.hold(command),
                    Some(ShardCommand::Reconnect) => {
                        conn.close(CloseCode::UnknownError.as_u16(), "reconnect requested").await;
                        return Ok(ConnectionOutcome::Reconnect);
                    }
                    Some(ShardCommand::Shutdown) | None => {
                        conn.close(1000, "shutdown").await;
                        return Ok(ConnectionOutcome::Shutdown);
                    }
                },
            }
        }
    }

    fn start_heartbeat(&self, interval: Duration, beats: mpsc::Sender<()>) -> GatewayResult<Loop> {
        let jitter = interval.mul_f64(rand::thread_rng().gen::<f64>());
        let heartbeat = Loop::builder(Schedule::every(interval))
            .name(format!("heartbeat-{}", self.shard_id()))
            .initial_delay(jitter)
            .clear_exception_types()
            .build(move |_| {
                let beats = beats.clone();
                async move {
                    beats
                        .send(())
                        .await
                        .map_err(|_| anyhow::anyhow!("connection closed"))
                }
            })?;
        heartbeat.start()?;
        Ok(heartbeat)
    }

    async fn identify(&mut self, conn: &mut Connection) -> GatewayResult<()> {
        self.identify_queue.wait_turn(self.shard_id()).await;
        self.set_state(ShardState::Identifying);

        let payload = IdentifyPayload {
            token: self.config.token.clone(),
            properties: self.config.properties.clone(),
            intents: self.config.intents,
            shard: [self.config.shard_id, self.config.shard_count],
            large_threshold: self.config.large_threshold,
            compress: false,
            presence: self.config.presence.clone(),
        };
        tracing::info!(shard_id = self.shard_id(), intents = %payload.intents, "Identifying");
        conn.send(&GatewayMessage::identify(&payload)?).await
    }

    async fn send_heartbeat(&mut self, conn: &mut Connection) -> GatewayResult<()> {
        tracing::trace!(shard_id = self.shard_id(), seq = ?self.session.sequence(), "Heartbeat");
        conn.send(&GatewayMessage::heartbeat(self.session.sequence()))
            .await?;
        conn.awaiting_ack = true;
        conn.last_heartbeat = Some(Instant::now());
        Ok(())
    }

    async fn handle_frame(&mut self, conn: &mut Connection, frame: Message) -> GatewayResult<Flow> {
        let text = match frame {
            Message::Text(text) => text,
            Message::Close(frame) => {
                let (code, reason) = frame.map_or((1005, String::new()), |f| {
                    (u16::from(f.code), f.reason.into_owned())
                });
                return Err(GatewayError::Closed { code, reason });
            }
            Message::Binary(_) => return self.violation(conn, "unexpected binary frame"),
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => return Ok(Flow::Continue),
        };

        let message = match GatewayMessage::from_json(&text) {
            Ok(message) => message,
            Err(e) => return self.violation(conn, &format!("undecodable payload: {e}")),
        };
        conn.violations = 0;

        if let Some(seq) = message.s {
            self.session.set_sequence(seq);
        }

        match message.op {
            OpCode::Dispatch => {
                self.handle_dispatch(message)?;
            }
            OpCode::Heartbeat => {
                self.send_heartbeat(conn).await?;
            }
            OpCode::HeartbeatAck => {
                conn.awaiting_ack = false;
                if let Some(sent) = conn.last_heartbeat {
                    let latency = sent.elapsed();
                    self.info.send_modify(|info| info.latency = Some(latency));
                    tracing::trace!(
                        shard_id = self.shard_id(),
                        latency_ms = latency.as_millis() as u64,
                        "Heartbeat acknowledged"
                    );
                }
            }
            OpCode::Reconnect => {
                tracing::info!(shard_id = self.shard_id(), "Server requested reconnect");
                return Ok(Flow::Finish(ConnectionOutcome::Reconnect));
            }
            OpCode::InvalidSession => {
                let resumable = message.as_invalid_session().unwrap_or(false);
                if resumable && self.session.is_resumable() {
                    tracing::info!(shard_id = self.shard_id(), "Session invalidated, resuming");
                    return Ok(Flow::Finish(ConnectionOutcome::Reconnect));
                }
                tracing::info!(
                    shard_id = self.shard_id(),
                    "Session invalidated, identifying again"
                );
                self.session_lost();
                return Ok(Flow::Finish(ConnectionOutcome::Reidentify));
            }
            OpCode::Hello => {
                tracing::debug!(shard_id = self.shard_id(), "Ignoring repeated Hello");
            }
            op => {
                return self.violation(conn, &format!("client op code from server: {op}"));
            }
        }

        Ok(Flow::Continue)
    }

    fn handle_dispatch(&mut self, message: GatewayMessage) -> GatewayResult<()> {
        let Some(name) = message.t else {
            tracing::warn!(shard_id = self.shard_id(), "Dispatch without event name");
            return Ok(());
        };
        let sequence = message.s.or(self.session.sequence()).unwrap_or_default();
        let event = DispatchEvent::new(self.shard_id(), sequence, name, message.d);

        match event.kind {
            Some(EventKind::Ready) => {
                let ready: ReadyPayload = event.parse()?;
                self.session.ready(&ready);
                self.connected();
                tracing::info!(
                    shard_id = self.shard_id(),
                    session_id = %ready.session_id,
                    user_id = %ready.user.id,
                    "Shard ready"
                );
            }
            Some(EventKind::Resumed) => {
                self.connected();
                tracing::info!(shard_id = self.shard_id(), seq = sequence, "Session resumed");
            }
            Some(EventKind::VoiceStateUpdate) => self.forward_voice_state(&event),
            Some(EventKind::VoiceServerUpdate) => self.forward_voice_server(&event),
            _ => {}
        }

        tracing::trace!(shard_id = self.shard_id(), seq = sequence, event = %event.name, "Dispatch");
        self.queue_event(event);
        Ok(())
    }

    /// Deliver an event now if the channel has room, otherwise behind the backlog
    fn queue_event(&mut self, event: DispatchEvent) {
        if self.backlog.is_empty() {
            match self.events.try_send(event) {
                Ok(()) => return,
                Err(TrySendError::Closed(_)) => {
                    self.receiver_dropped();
                    return;
                }
                Err(TrySendError::Full(event)) => self.backlog.push_back(event),
            }
        } else if self.events.is_closed() {
            self.receiver_dropped();
            return;
        } else {
            self.backlog.push_back(event);
        }

        if self.backlog.len() == BACKLOG_WARN {
            tracing::warn!(
                shard_id = self.shard_id(),
                backlog = BACKLOG_WARN,
                "Event consumer is falling behind"
            );
        }
    }

    /// Move backlogged events into the channel while it has room
    fn flush_backlog(&mut self) {
        while let Some(event) = self.backlog.pop_front() {
            match self.events.try_send(event) {
                Ok(()) => {}
                Err(TrySendError::Full(event)) => {
                    self.backlog.push_front(event);
                    return;
                }
                Err(TrySendError::Closed(_)) => {
                    self.receiver_dropped();
                    return;
                }
            }
        }
    }

    fn receiver_dropped(&mut self) {
        self.backlog.clear();
        tracing::debug!(shard_id = self.shard_id(), "Event receiver dropped");
    }

    /// Keep a command for the next connected session
    fn hold(&mut self, command: GatewayCommand) {
        tracing::debug!(
            shard_id = self.shard_id(),
            op = %command.op(),
            held = self.pending.len() + 1,
            "Holding command until connected"
        );
        self.pending.push_back(command);
    }

    /// Write held commands in the order they were sent
    async fn flush_pending(&mut self, conn: &mut Connection) -> GatewayResult<()> {
        tracing::debug!(
            shard_id = self.shard_id(),
            commands = self.pending.len(),
            "Sending held commands"
        );
        while let Some(command) = self.pending.front() {
            conn.send(&command.to_message()?).await?;
            self.pending.pop_front();
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.info.borrow().state == ShardState::Connected
    }

    fn forward_voice_state(&self, event: &DispatchEvent) {
        let Ok(state) = event.parse::<VoiceStateEvent>() else {
            tracing::debug!(shard_id = self.shard_id(), "Undecodable voice state update");
            return;
        };
        if Some(state.user_id) != self.session.user_id() {
            return;
        }
        if let Some(guild_id) = state.guild_id {
            self.signal_voice(VoiceSignal::StateUpdate {
                guild_id,
                channel_id: state.channel_id,
                user_id: state.user_id,
                session_id: state.session_id,
            });
        }
    }

    fn forward_voice_server(&self, event: &DispatchEvent) {
        match event.parse::<VoiceServerEvent>() {
            Ok(server) => self.signal_voice(VoiceSignal::ServerUpdate {
                guild_id: server.guild_id,
                token: server.token,
                endpoint: server.endpoint,
            }),
            Err(e) => {
                tracing::debug!(shard_id = self.shard_id(), error = %e, "Undecodable voice server update");
            }
        }
    }

    fn signal_voice(&self, signal: VoiceSignal) {
        if let Some(voice) = &self.voice {
            if voice.send(signal).is_err() {
                tracing::debug!(shard_id = self.shard_id(), "Voice signal receiver dropped");
            }
        }
    }

    /// Drop a malformed frame, failing only once violations keep recurring
    fn violation(&self, conn: &mut Connection, detail: &str) -> GatewayResult<Flow> {
        conn.violations += 1;
        tracing::warn!(
            shard_id = self.shard_id(),
            violations = conn.violations,
            detail,
            "Dropping malformed gateway frame"
        );
        if conn.violations >= self.config.max_violations {
            return Err(GatewayError::ProtocolViolation(detail.to_string()));
        }
        Ok(Flow::Continue)
    }

    fn session_lost(&mut self) {
        self.session.clear();
        self.info.send_modify(|info| {
            info.session_id = None;
            info.sequence = None;
        });
        self.signal_voice(VoiceSignal::SessionLost {
            shard_id: self.shard_id(),
        });
    }

    fn connected(&mut self) {
        self.backoff.reset();
        let session_id = self.session.session_id().map(str::to_string);
        let sequence = self.session.sequence();
        self.info.send_modify(|info| {
            info.state = ShardState::Connected;
            info.session_id = session_id;
            info.sequence = sequence;
            info.reconnect_attempts = 0;
        });
    }

    fn set_state(&self, state: ShardState) {
        self.info.send_if_modified(|info| {
            if info.state == state {
                return false;
            }
            tracing::debug!(shard_id = info.shard_id, from = %info.state, to = %state, "Shard state");
            info.state = state;
            true
        });
    }

    fn invalid_session_delay(&self) -> Duration {
        let (min, max) = self.config.invalid_session_delay;
        if max <= min {
            return min;
        }
        let millis = rand::thread_rng().gen_range(min.as_millis() as u64..=max.as_millis() as u64);
        Duration::from_millis(millis)
    }
}

/// Read frames until Hello; anything else first is a protocol error
async fn read_hello(ws: &mut WsStream) -> GatewayResult<HelloPayload> {
    while let Some(frame) = ws.next().await {
        match frame? {
            Message::Text(text) => {
                let message = GatewayMessage::from_json(&text)?;
                return message.as_hello().ok_or_else(|| {
                    GatewayError::ProtocolViolation(format!("expected Hello, got {}", message.op))
                });
            }
            Message::Close(frame) => {
                let (code, reason) = frame.map_or((1005, String::new()), |f| {
                    (u16::from(f.code), f.reason.into_owned())
                });
                return Err(GatewayError::Closed { code, reason });
            }
            _ => {}
        }
    }
    Err(GatewayError::ConnectionLost)
}
