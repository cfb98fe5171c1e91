//! # Scheduler Errors

use thiserror::Error;

use crate::queue::QueueError;

/// Result type for scheduler operations
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Scheduler errors
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Worker process could not be started
    #[error("Failed to spawn worker '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Queue operation failed
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SchedulerError {
    pub(crate) fn poisoned() -> Self {
        SchedulerError::Internal("Lock poisoned".into())
    }
}
