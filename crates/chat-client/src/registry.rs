//! Event handler registry
//!
//! Handlers are registered per [`EventKind`] at construction time. Events
//! without a known kind, or with no handlers, are skipped.

use chat_gateway::{DispatchEvent, EventKind};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

type Handler = Arc<dyn Fn(DispatchEvent) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Maps event kinds to their handlers
#[derive(Clone, Default)]
pub struct EventRegistry {
    handlers: HashMap<EventKind, Vec<Handler>>,
}

impl EventRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler; handlers of one kind run in registration order
    pub fn on<F, Fut>(&mut self, kind: EventKind, handler: F) -> &mut Self
    where
        F: Fn(DispatchEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |event| handler(event).boxed());
        self.handlers.entry(kind).or_default().push(handler);
        self
    }

    /// Register by wire name; returns false and registers nothing for
    /// unknown names
    pub fn on_name<F, Fut>(&mut self, name: &str, handler: F) -> bool
    where
        F: Fn(DispatchEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        match EventKind::from_name(name) {
            Some(kind) => {
                self.on(kind, handler);
                true
            }
            None => {
                tracing::debug!(event = name, "Ignoring handler for unknown event");
                false
            }
        }
    }

    #[must_use]
    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.handlers.get(&kind).map_or(0, Vec::len)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.values().all(Vec::is_empty)
    }

    /// Run every handler for the event, one after another
    ///
    /// Handler errors are logged and do not stop the remaining handlers.
    /// Returns how many handlers ran.
    pub async fn dispatch(&self, event: &DispatchEvent) -> usize {
        let Some(handlers) = event.kind.and_then(|kind| self.handlers.get(&kind)) else {
            tracing::trace!(event = %event.name, shard_id = event.shard_id, "No handlers for event");
            return 0;
        };

        for handler in handlers {
            if let Err(e) = handler(event.clone()).await {
                tracing::warn!(
                    event = %event.name,
                    shard_id = event.shard_id,
                    seq = event.sequence,
                    error = %e,
                    "Event handler failed"
                );
            }
        }
        handlers.len()
    }
}

impl std::fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let counts: HashMap<_, _> = self
            .handlers
            .iter()
            .map(|(kind, handlers)| (kind.as_str(), handlers.len()))
            .collect();
        f.debug_struct("EventRegistry").field("handlers", &counts).finish()
    }
}
