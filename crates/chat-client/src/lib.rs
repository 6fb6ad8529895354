//! # chat-client
//!
//! The application-facing surface: build a [`Client`] from a
//! [`ClientConfig`], register event handlers, then `run` it.

pub mod client;
pub mod registry;

pub use client::{Client, ClientBuilder};
pub use registry::EventRegistry;

pub use chat_common::{ClientConfig, ClientError, ClientResult};
pub use chat_core::Snowflake;
pub use chat_gateway::{DispatchEvent, EventKind, Intents};
pub use chat_voice::{PlaybackState, VoiceEvent};
