//! Task loop error types

use thiserror::Error;

/// Task loop error type
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LoopError {
    /// `start` was called while the loop is still running
    #[error("Task is already launched and is not completed")]
    AlreadyRunning,

    /// The schedule can never fire or would spin without waiting
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),
}

/// Task loop result type
pub type LoopResult<T> = Result<T, LoopError>;
