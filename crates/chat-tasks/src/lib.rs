//! # chat-tasks
//!
//! Recurring execution primitive used for gateway heartbeats, voice keepalives
//! and caller-defined background work.

mod backoff;
mod error;
mod schedule;
mod task_loop;

pub use backoff::ExponentialBackoff;
pub use error::{LoopError, LoopResult};
pub use schedule::Schedule;
pub use task_loop::{Loop, LoopBuilder, LoopStatus};
