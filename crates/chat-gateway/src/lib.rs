//! # chat-gateway
//!
//! Client side of the event gateway: protocol types, the per-shard session
//! state machine (connect, identify or resume, heartbeat, reconnect) and a
//! manager running every shard of an application.

pub mod error;
pub mod events;
pub mod intents;
pub mod manager;
pub mod protocol;
pub mod shard;
pub mod voice;

pub use error::{GatewayError, GatewayResult, ShardError};
pub use events::{DispatchEvent, EventKind};
pub use intents::Intents;
pub use manager::{ShardManager, ShardRouter};
pub use protocol::{GatewayCommand, GatewayMessage};
pub use shard::{IdentifyQueue, Shard, ShardConfig, ShardHandle, ShardInfo, ShardState};
pub use voice::VoiceSignal;
