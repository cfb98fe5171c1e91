//! # Engine Errors

use std::path::PathBuf;

use thiserror::Error;

use crate::enqueuer::EnqueuerError;

/// Result type for target-change operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Target-change engine errors
#[derive(Debug, Error)]
pub enum EngineError {
    /// Definition directory could not be read
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A definition file is not valid
    #[error("Invalid function definition {path}: {message}")]
    InvalidDefinition { path: PathBuf, message: String },

    /// Subscribing a target failed
    #[error("Subscription failed: {0}")]
    Subscription(#[from] EnqueuerError),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}
