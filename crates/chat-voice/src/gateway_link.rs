//! Voice state updates travel over the owning shard, not the voice socket

use async_trait::async_trait;
use chat_gateway::protocol::VoiceStateUpdatePayload;
use chat_gateway::{GatewayResult, ShardHandle, ShardRouter};

/// Sends voice state updates through the gateway
#[async_trait]
pub trait VoiceStateSender: Send + Sync {
    async fn update_voice_state(&self, state: VoiceStateUpdatePayload) -> GatewayResult<()>;
}

#[async_trait]
impl VoiceStateSender for ShardHandle {
    async fn update_voice_state(&self, state: VoiceStateUpdatePayload) -> GatewayResult<()> {
        ShardHandle::update_voice_state(self, state).await
    }
}

#[async_trait]
impl VoiceStateSender for ShardRouter {
    async fn update_voice_state(&self, state: VoiceStateUpdatePayload) -> GatewayResult<()> {
        ShardRouter::update_voice_state(self, state).await
    }
}
