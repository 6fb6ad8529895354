//! Handle to a running shard

use super::{ShardInfo, ShardState};
use crate::error::{GatewayError, GatewayResult};
use crate::protocol::{
    GatewayCommand, PresenceUpdatePayload, RequestGuildMembersPayload, VoiceStateUpdatePayload,
};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// Control messages into a shard runner
#[derive(Debug)]
pub(crate) enum ShardCommand {
    Send(GatewayCommand),
    Reconnect,
    Shutdown,
}

/// Commands a caller may send per minute
///
/// The service allows 120; the rest is left for heartbeats and identifies.
pub const COMMANDS_PER_MINUTE: NonZeroU32 = NonZeroU32::MIN.saturating_add(109);

/// Cloneable handle used to command and observe a shard
#[derive(Clone)]
pub struct ShardHandle {
    shard_id: u32,
    commands: mpsc::Sender<ShardCommand>,
    info: watch::Receiver<ShardInfo>,
    limiter: Arc<DefaultDirectRateLimiter>,
}

impl ShardHandle {
    pub(crate) fn new(
        shard_id: u32,
        commands: mpsc::Sender<ShardCommand>,
        info: watch::Receiver<ShardInfo>,
    ) -> Self {
        Self {
            shard_id,
            commands,
            info,
            limiter: Arc::new(RateLimiter::direct(Quota::per_minute(COMMANDS_PER_MINUTE))),
        }
    }

    #[must_use]
    pub fn shard_id(&self) -> u32 {
        self.shard_id
    }

    /// Send a command, waiting for outbound rate limit capacity first
    ///
    /// A shard that is not connected holds the command and writes it once
    /// its next session is up.
    pub async fn send(&self, command: GatewayCommand) -> GatewayResult<()> {
        self.limiter.until_ready().await;
        tracing::trace!(shard_id = self.shard_id, op = %command.op(), "Queueing gateway command");
        self.control(ShardCommand::Send(command)).await
    }

    pub async fn update_presence(&self, presence: PresenceUpdatePayload) -> GatewayResult<()> {
        self.send(GatewayCommand::PresenceUpdate(presence)).await
    }

    /// Join, move or leave a voice channel
    pub async fn update_voice_state(&self, state: VoiceStateUpdatePayload) -> GatewayResult<()> {
        self.send(GatewayCommand::VoiceStateUpdate(state)).await
    }

    pub async fn request_guild_members(
        &self,
        request: RequestGuildMembersPayload,
    ) -> GatewayResult<()> {
        self.send(GatewayCommand::RequestGuildMembers(request)).await
    }

    /// Drop the current connection and resume on a new one
    pub async fn reconnect(&self) -> GatewayResult<()> {
        self.control(ShardCommand::Reconnect).await
    }

    /// Close the connection and stop the shard
    pub async fn shutdown(&self) -> GatewayResult<()> {
        self.control(ShardCommand::Shutdown).await
    }

    /// Current snapshot of the shard
    #[must_use]
    pub fn info(&self) -> ShardInfo {
        self.info.borrow().clone()
    }

    #[must_use]
    pub fn state(&self) -> ShardState {
        self.info.borrow().state
    }

    /// Wait until the shard reaches `state`
    pub async fn wait_for_state(&self, state: ShardState) -> GatewayResult<()> {
        let mut info = self.info.clone();
        info.wait_for(|current| current.state == state)
            .await
            .map(|_| ())
            .map_err(|_| GatewayError::ShardStopped)
    }

    /// Wait for the next change of the shard snapshot
    pub async fn changed(&mut self) -> GatewayResult<ShardInfo> {
        self.info
            .changed()
            .await
            .map_err(|_| GatewayError::ShardStopped)?;
        Ok(self.info.borrow_and_update().clone())
    }

    async fn control(&self, command: ShardCommand) -> GatewayResult<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| GatewayError::ShardStopped)
    }
}

impl std::fmt::Debug for ShardHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardHandle")
            .field("shard_id", &self.shard_id)
            .field("state", &self.state())
            .finish()
    }
}
