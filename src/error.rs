use thiserror::Error;
use uuid::Uuid;

use crate::queue::job::JobState;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition { from: JobState, to: JobState },

    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, QueueError>;

/// Failure produced while executing a claimed job.
///
/// The first three variants are validation failures (the job can never
/// succeed as written); the rest are execution failures. Both count as a
/// failed attempt and feed the retry policy.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("invalid dynamic command format: {0:?} (expected target.callable)")]
    InvalidFormat(String),

    #[error("no handler registered for {0:?}")]
    TargetNotFound(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("exit code {code:?}: {stderr}")]
    NonZeroExit { code: Option<i32>, stderr: String },

    #[error("timed out after {0}s")]
    Timeout(u64),

    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("handler failed: {0}")]
    Handler(String),
}

impl DispatchError {
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            DispatchError::InvalidFormat(_)
                | DispatchError::TargetNotFound(_)
                | DispatchError::InvalidPayload(_)
        )
    }
}
