//! # Worker Protocol Errors

use thiserror::Error;

/// Result type for worker protocol operations
pub type RpcResult<T> = Result<T, RpcError>;

/// Worker protocol errors
#[derive(Debug, Error)]
pub enum RpcError {
    /// Listener could not be bound
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Transport failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Frame could not be encoded or decoded
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// Peer closed the connection mid-call
    #[error("Connection closed")]
    ConnectionClosed,

    /// The remote side answered with an error
    #[error("{code}: {message}")]
    Remote { code: String, message: String },
}

impl RpcError {
    /// Whether the remote side reported a missing item
    pub fn is_not_found(&self) -> bool {
        matches!(self, RpcError::Remote { code, .. } if code == "NOT_FOUND")
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::InvalidFrame(err.to_string())
    }
}
