//! Integration test utilities for the chat client
//!
//! This crate provides mock REST and gateway servers so the client can be
//! exercised end to end without a live service.

pub mod fixtures;
pub mod helpers;

pub use fixtures::*;
pub use helpers::*;
