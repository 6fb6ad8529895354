//! Shard manager
//!
//! Spawns every shard of an application, merges their dispatch events into
//! one stream and routes guild-scoped commands to the owning shard.

use crate::error::{GatewayError, GatewayResult, ShardError};
use crate::events::DispatchEvent;
use crate::protocol::{RequestGuildMembersPayload, VoiceStateUpdatePayload};
use crate::shard::{IdentifyQueue, Shard, ShardConfig, ShardHandle};
use crate::voice::VoiceSignal;
use chat_core::Snowflake;
use futures_util::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Owns all shards of one client
pub struct ShardManager {
    shard_count: u32,
    handles: Vec<ShardHandle>,
    tasks: Vec<JoinHandle<Result<(), ShardError>>>,
    events: Option<mpsc::Receiver<DispatchEvent>>,
    voice: Option<mpsc::UnboundedReceiver<VoiceSignal>>,
}

impl ShardManager {
    /// Spawn shards `0..base.shard_count` from a template config
    pub fn spawn(base: &ShardConfig, identify_queue: Arc<IdentifyQueue>, event_buffer: usize) -> Self {
        let shard_count = base.shard_count.max(1);
        let (events_tx, events_rx) = mpsc::channel(event_buffer.max(1));
        let (voice_tx, voice_rx) = mpsc::unbounded_channel();

        let mut handles = Vec::with_capacity(shard_count as usize);
        let mut tasks = Vec::with_capacity(shard_count as usize);
        for shard_id in 0..shard_count {
            let config = base.clone().with_shard(shard_id, shard_count);
            let shard = Shard::spawn(
                config,
                Arc::clone(&identify_queue),
                events_tx.clone(),
                Some(voice_tx.clone()),
            );
            let (handle, task) = shard.into_parts();
            handles.push(handle);
            tasks.push(task);
        }

        tracing::info!(
            shard_count,
            max_concurrency = identify_queue.max_concurrency(),
            "Spawned shards"
        );

        Self {
            shard_count,
            handles,
            tasks,
            events: Some(events_rx),
            voice: Some(voice_rx),
        }
    }

    /// Shard responsible for a guild
    #[must_use]
    pub const fn shard_id_for_guild(guild_id: Snowflake, shard_count: u32) -> u32 {
        let count = if shard_count == 0 { 1 } else { shard_count };
        ((guild_id.into_inner() >> 22) % count as u64) as u32
    }

    #[must_use]
    pub fn shard_count(&self) -> u32 {
        self.shard_count
    }

    #[must_use]
    pub fn shard(&self, shard_id: u32) -> Option<&ShardHandle> {
        self.handles.get(shard_id as usize)
    }

    pub fn shards(&self) -> impl Iterator<Item = &ShardHandle> {
        self.handles.iter()
    }

    #[must_use]
    pub fn shard_for_guild(&self, guild_id: Snowflake) -> Option<&ShardHandle> {
        self.shard(Self::shard_id_for_guild(guild_id, self.shard_count))
    }

    /// Cloneable guild router over the shard handles
    #[must_use]
    pub fn router(&self) -> ShardRouter {
        ShardRouter {
            handles: self.handles.clone().into(),
        }
    }

    /// Take the merged dispatch event stream; only the first call gets it
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<DispatchEvent>> {
        self.events.take()
    }

    /// Take the voice signal stream; only the first call gets it
    pub fn take_voice_signals(&mut self) -> Option<mpsc::UnboundedReceiver<VoiceSignal>> {
        self.voice.take()
    }

    /// Send a voice state update through the shard owning the guild
    pub async fn update_voice_state(&self, state: VoiceStateUpdatePayload) -> GatewayResult<()> {
        self.guild_shard(state.guild_id)?
            .update_voice_state(state)
            .await
    }

    /// Request guild members through the shard owning the guild
    pub async fn request_guild_members(
        &self,
        request: RequestGuildMembersPayload,
    ) -> GatewayResult<()> {
        self.guild_shard(request.guild_id)?
            .request_guild_members(request)
            .await
    }

    /// Wait until every shard stops; the first fatal error stops the rest
    pub async fn wait(&mut self) -> Result<(), ShardError> {
        let mut pending: FuturesUnordered<_> = std::mem::take(&mut self.tasks).into_iter().collect();

        while let Some(result) = pending.next().await {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!(shard_id = e.shard_id, error = %e.source, "Shard failed");
                    self.signal_shutdown().await;
                    while pending.next().await.is_some() {}
                    return Err(e);
                }
                Err(e) => tracing::error!(error = %e, "Shard task panicked or was aborted"),
            }
        }
        Ok(())
    }

    /// Stop every shard and wait for them to close their connections
    pub async fn shutdown(&mut self) {
        self.signal_shutdown().await;
        for task in std::mem::take(&mut self.tasks) {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(shard_id = e.shard_id, error = %e.source, "Shard ended with error"),
                Err(e) => tracing::warn!(error = %e, "Shard task panicked or was aborted"),
            }
        }
        tracing::info!(shard_count = self.shard_count, "All shards stopped");
    }

    async fn signal_shutdown(&self) {
        for handle in &self.handles {
            // Already stopped shards are fine
            let _ = handle.shutdown().await;
        }
    }

    fn guild_shard(&self, guild_id: Snowflake) -> GatewayResult<&ShardHandle> {
        let shard_id = Self::shard_id_for_guild(guild_id, self.shard_count);
        self.shard(shard_id)
            .ok_or(GatewayError::ShardNotFound(shard_id))
    }
}

/// Routes guild-scoped commands to the owning shard
///
/// Unlike the manager it can be cloned into other tasks.
#[derive(Debug, Clone)]
pub struct ShardRouter {
    handles: Arc<[ShardHandle]>,
}

impl ShardRouter {
    #[must_use]
    pub fn shard_for_guild(&self, guild_id: Snowflake) -> Option<&ShardHandle> {
        let count = self.handles.len() as u32;
        self.handles
            .get(ShardManager::shard_id_for_guild(guild_id, count) as usize)
    }

    /// Send a voice state update through the shard owning the guild
    pub async fn update_voice_state(&self, state: VoiceStateUpdatePayload) -> GatewayResult<()> {
        let count = self.handles.len() as u32;
        let shard_id = ShardManager::shard_id_for_guild(state.guild_id, count);
        self.handles
            .get(shard_id as usize)
            .ok_or(GatewayError::ShardNotFound(shard_id))?
            .update_voice_state(state)
            .await
    }
}

impl Drop for ShardManager {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl std::fmt::Debug for ShardManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardManager")
            .field("shard_count", &self.shard_count)
            .field("shards", &self.handles)
            .finish()
    }
}
