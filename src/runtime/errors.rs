//! # Worker Runtime Errors

use thiserror::Error;

use crate::rpc::RpcError;

/// Result type for the built-in worker
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Built-in worker errors
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// A protocol variable is not set
    #[error("Environment variable {0} is not set")]
    MissingEnv(&'static str),

    /// A protocol variable could not be parsed
    #[error("Invalid value for {name}: {value}")]
    InvalidEnv { name: &'static str, value: String },

    /// Talking to the scheduler failed
    #[error("Worker protocol error: {0}")]
    Rpc(#[from] RpcError),

    /// Running the handler failed
    #[error("Failed to run handler {handler}: {source}")]
    Handler {
        handler: String,
        #[source]
        source: std::io::Error,
    },
}
