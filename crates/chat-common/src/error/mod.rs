//! Error types shared across subsystems

mod client_error;

pub use client_error::{ClientError, ClientResult, ErrorOrigin};
