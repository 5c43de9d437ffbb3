//! Scheduler error types.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while reacting to lifecycle changes.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("state store error: {0}")]
    State(#[from] stratus_state::StateError),

    #[error("bus error: {0}")]
    Bus(#[from] stratus_bus::BusError),

    #[error(transparent)]
    Staging(#[from] StagingError),

    #[error("backend error: {0}")]
    Backend(#[from] anyhow::Error),

    #[error("application {0} vanished mid-reaction")]
    ApplicationGone(String),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Why a staging attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StagingError {
    /// No stager had the memory or disk for the job. Worth retrying.
    #[error("no stager has capacity: {0}")]
    NoCapacity(String),

    #[error("staging failed: {0}")]
    Failed(String),

    #[error("no staging reply within {0:?}")]
    TimedOut(Duration),

    #[error("stager unreachable: {0}")]
    Unavailable(String),

    /// The package already failed to stage and was not marked for restaging.
    #[error("package failed to stage earlier ({0}); mark it for restaging first")]
    NotRestaged(String),
}

impl StagingError {
    /// Only resource exhaustion is transient.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StagingError::NoCapacity(_))
    }
}
