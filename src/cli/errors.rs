//! CLI-specific error types
//!
//! Every CLI error ends the process with a non-zero status.

use std::fmt;

use crate::app::AppError;
use crate::config::ConfigError;
use crate::runtime::RuntimeError;

/// CLI error codes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CliErrorCode {
    /// Configuration file error
    ConfigError,
    /// Startup failed
    BootFailed,
    /// Worker process failed
    WorkerFailed,
    /// I/O error (stdout)
    IoError,
}

impl CliErrorCode {
    /// Get the error code string
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConfigError => "AEROFN_CLI_CONFIG_ERROR",
            Self::BootFailed => "AEROFN_CLI_BOOT_FAILED",
            Self::WorkerFailed => "AEROFN_CLI_WORKER_FAILED",
            Self::IoError => "AEROFN_CLI_IO_ERROR",
        }
    }
}

/// CLI error
#[derive(Debug)]
pub struct CliError {
    code: CliErrorCode,
    message: String,
}

impl CliError {
    pub fn new(code: CliErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::ConfigError, msg)
    }

    pub fn boot_failed(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::BootFailed, msg)
    }

    pub fn worker_failed(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::WorkerFailed, msg)
    }

    pub fn io_error(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::IoError, msg)
    }

    pub fn code(&self) -> &CliErrorCode {
        &self.code
    }

    pub fn code_str(&self) -> &'static str {
        self.code.code()
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code.code(), self.message)
    }
}

impl std::error::Error for CliError {}

impl From<ConfigError> for CliError {
    fn from(e: ConfigError) -> Self {
        Self::config_error(e.to_string())
    }
}

impl From<AppError> for CliError {
    fn from(e: AppError) -> Self {
        Self::boot_failed(e.to_string())
    }
}

impl From<RuntimeError> for CliError {
    fn from(e: RuntimeError) -> Self {
        Self::worker_failed(e.to_string())
    }
}

impl From<std::io::Error> for CliError {
    fn from(e: std::io::Error) -> Self {
        Self::io_error(e.to_string())
    }
}

/// CLI result type
pub type CliResult<T> = Result<T, CliError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_carries_code() {
        let err = CliError::config_error("scheduler.max_concurrency must be > 0");
        assert_eq!(err.code(), &CliErrorCode::ConfigError);
        assert_eq!(
            err.to_string(),
            "AEROFN_CLI_CONFIG_ERROR: scheduler.max_concurrency must be > 0"
        );
    }

    #[test]
    fn test_from_runtime_error() {
        let err: CliError = RuntimeError::MissingEnv("AEROFN_WORKER_ID").into();
        assert_eq!(err.code_str(), "AEROFN_CLI_WORKER_FAILED");
    }
}
