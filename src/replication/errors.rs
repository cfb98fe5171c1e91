//! # Replication Errors

use thiserror::Error;

/// Result type for ownership coordination
pub type ReplicationResult<T> = Result<T, ReplicationError>;

/// Ownership coordination errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplicationError {
    /// Another replica kept a pending lease for longer than the wait budget
    #[error("Job {job_key} is held by replica {owner}")]
    OwnershipConflict { job_key: String, owner: String },

    /// The record vanished between two store calls
    #[error("No ownership record for job {0}")]
    MissingRecord(String),

    /// Coordination store failure
    #[error("Coordination store error: {0}")]
    Store(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReplicationError {
    /// Whether retrying later may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ReplicationError::OwnershipConflict { .. } | ReplicationError::Store(_)
        )
    }

    pub(crate) fn poisoned() -> Self {
        ReplicationError::Internal("Lock poisoned".into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_is_retryable() {
        let err = ReplicationError::OwnershipConflict {
            job_key: "schedule:/fn:tick:0".into(),
            owner: "replica-b".into(),
        };
        assert!(err.is_retryable());
        assert!(!ReplicationError::poisoned().is_retryable());
    }
}
