//! Error types for the protocol server.

use devbox_core::ProviderError;
use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by tool invocation.
#[derive(Debug, Error)]
pub enum ToolError {
    /// No handler is registered under this name.
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    /// Parameters did not match the tool's schema.
    #[error("invalid parameters for {tool}: {message}")]
    InvalidParams {
        /// Tool that rejected the parameters
        tool: String,
        /// What was wrong
        message: String,
    },

    /// The provider rejected or failed the operation.
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// The tool ran and failed.
    #[error("{0}")]
    Execution(String),

    /// The tool did not finish within the request timeout.
    #[error("{tool} timed out after {timeout_ms}ms")]
    Timeout {
        /// Tool that timed out
        tool: String,
        /// Request timeout in milliseconds
        timeout_ms: u64,
    },
}

impl ToolError {
    /// Build an invalid-parameters error.
    pub fn invalid(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidParams {
            tool: tool.into(),
            message: message.into(),
        }
    }
}

/// Errors from the auth token lifecycle.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The user's home directory could not be determined.
    #[error("home directory not found; set DEVBOX_TOKEN_PATH")]
    HomeDirUnavailable,

    /// Reading or writing the token file failed.
    #[error("token file {path}: {source}")]
    Io {
        /// File or directory involved
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },
}

/// Configuration validation error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("network mode requires a non-zero port")]
    InvalidPort,

    #[error("{0} must be greater than zero")]
    ZeroTimeout(&'static str),

    #[error("{0} must be at least 1")]
    ZeroLimit(&'static str),

    #[error("network mode requires a host to bind")]
    MissingHost,
}
