//! Gateway events
//!
//! Dispatch events forwarded from shards to the application.

mod dispatch;
mod event_kind;

pub use dispatch::DispatchEvent;
pub use event_kind::{EventKind, UnknownEvent};
