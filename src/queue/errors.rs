//! # Queue Errors

use thiserror::Error;

/// Result type for queue operations
pub type QueueResult<T> = Result<T, QueueError>;

/// Queue errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    /// No payload or event stored under the id
    #[error("Queue has no item with id {0}")]
    NotFound(String),

    /// `write_head` called twice for one event
    #[error("Headers already sent")]
    HeadersAlreadySent,

    /// Reply already delivered for one event
    #[error("Reply already sent for id {0}")]
    AlreadyReplied(String),

    /// The consuming side of the queue is gone
    #[error("Queue is closed")]
    Closed,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl QueueError {
    /// Stable error code reported over the worker protocol
    pub fn code(&self) -> &'static str {
        match self {
            QueueError::NotFound(_) => "NOT_FOUND",
            QueueError::HeadersAlreadySent => "PROTOCOL_VIOLATION",
            QueueError::AlreadyReplied(_) => "PROTOCOL_VIOLATION",
            QueueError::Closed => "UNAVAILABLE",
            QueueError::Internal(_) => "INTERNAL",
        }
    }

    pub(crate) fn poisoned() -> Self {
        QueueError::Internal("Lock poisoned".into())
    }
}
