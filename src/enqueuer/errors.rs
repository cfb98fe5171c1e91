//! # Enqueuer Errors
//!
//! Resource failures of a subscription are not errors: they are recorded
//! on its [`SubscriptionStatus`](super::SubscriptionStatus). These variants
//! cover misuse and failures while emitting events.

use thiserror::Error;

use super::TriggerKind;
use crate::queue::QueueError;
use crate::replication::ReplicationError;

/// Result type for enqueuer operations
pub type EnqueuerResult<T> = Result<T, EnqueuerError>;

/// Enqueuer errors
#[derive(Debug, Error)]
pub enum EnqueuerError {
    /// Options of another trigger kind were handed to an enqueuer
    #[error("Expected {expected} trigger options, got {found}")]
    KindMismatch {
        expected: TriggerKind,
        found: TriggerKind,
    },

    /// Options could not be parsed
    #[error("Invalid {kind} trigger options: {message}")]
    InvalidOptions { kind: TriggerKind, message: String },

    /// A change stream could not be opened
    #[error("Change stream unavailable: {0}")]
    StreamUnavailable(String),

    /// Queue operation failed
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// Ownership coordination failed
    #[error("Replication error: {0}")]
    Replication(#[from] ReplicationError),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EnqueuerError {
    pub(crate) fn poisoned() -> Self {
        EnqueuerError::Internal("Lock poisoned".into())
    }
}
