//! # chat-core
//!
//! Identifier types and small helpers shared by the HTTP, gateway and voice crates.
//! This crate has no networking or runtime dependencies.

pub mod utils;
pub mod value_objects;

// Re-export commonly used types at crate root
pub use value_objects::{
    snowflake_time, time_snowflake, Snowflake, SnowflakeList, SnowflakeParseError,
};
