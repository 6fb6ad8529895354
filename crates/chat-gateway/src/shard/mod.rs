//! Gateway shards
//!
//! Each shard is an independent session state machine running in its own task.

mod config;
mod handle;
mod identify;
mod runner;
mod session;
mod state;

pub use config::ShardConfig;
pub use handle::{ShardHandle, COMMANDS_PER_MINUTE};
pub use identify::IdentifyQueue;
pub use session::Session;
pub use state::{ShardInfo, ShardState};

use crate::error::ShardError;
use crate::events::DispatchEvent;
use crate::voice::VoiceSignal;
use runner::ShardRunner;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Capacity of the command channel between handles and the runner
const COMMAND_BUFFER: usize = 32;

/// A spawned shard task and its handle
pub struct Shard {
    handle: ShardHandle,
    task: JoinHandle<Result<(), ShardError>>,
}

impl Shard {
    /// Spawn a shard runner
    ///
    /// Dispatch events go to `events` in the order they were received;
    /// voice credentials additionally go to `voice` when provided.
    pub fn spawn(
        config: ShardConfig,
        identify_queue: Arc<IdentifyQueue>,
        events: mpsc::Sender<DispatchEvent>,
        voice: Option<mpsc::UnboundedSender<VoiceSignal>>,
    ) -> Self {
        let shard_id = config.shard_id;
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        let (info_tx, info_rx) = watch::channel(ShardInfo::new(shard_id));

        let runner = ShardRunner::new(config, identify_queue, events, voice, commands_rx, info_tx);
        let task = tokio::spawn(async move {
            runner
                .run()
                .await
                .map_err(|source| ShardError::new(shard_id, source))
        });

        Self {
            handle: ShardHandle::new(shard_id, commands_tx, info_rx),
            task,
        }
    }

    #[must_use]
    pub fn handle(&self) -> &ShardHandle {
        &self.handle
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the shard task to end
    pub async fn join(self) -> Result<(), ShardError> {
        let shard_id = self.handle.shard_id();
        match self.task.await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(shard_id, error = %e, "Shard task panicked or was aborted");
                Ok(())
            }
        }
    }

    pub fn abort(&self) {
        self.task.abort();
    }

    pub(crate) fn into_parts(self) -> (ShardHandle, JoinHandle<Result<(), ShardError>>) {
        (self.handle, self.task)
    }
}
