//! Error types for devbox-core.

use crate::instance::{InstanceId, InstanceStatus, ProviderType};
use thiserror::Error;

/// Result type alias for devbox-core operations.
pub type Result<T> = std::result::Result<T, ProviderError>;

/// Errors that can occur during provider and instance operations.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Instance configuration is missing or has an invalid field.
    ///
    /// Raised before any backend call; names exactly one field.
    #[error("invalid instance configuration: {message}")]
    Validation {
        /// Dotted path of the offending field (e.g. `resources.cpu.cores`)
        field: &'static str,
        /// Human-readable message naming the field
        message: String,
    },

    /// The requested provider type has no registered constructor.
    #[error("provider not registered: {0}")]
    NotRegistered(ProviderType),

    /// A default provider was requested but the registry is empty.
    #[error("no providers registered")]
    NoProvidersRegistered,

    /// A live instance with this name already exists or is being created.
    #[error("instance name already in use: {0}")]
    DuplicateName(String),

    /// Instance not found.
    #[error("instance not found: {0}")]
    NotFound(InstanceId),

    /// Status change not allowed by the instance state machine.
    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition {
        /// Current status
        from: InstanceStatus,
        /// Requested status
        to: InstanceStatus,
    },

    /// Operation needs a running instance.
    #[error("instance {id} is {status}, expected running")]
    NotRunning {
        /// Instance id
        id: InstanceId,
        /// Current status
        status: InstanceStatus,
    },

    /// The backend command ran and reported failure.
    #[error("{operation} failed: {stderr}")]
    BackendCommand {
        /// Lifecycle operation that failed (e.g. `create`)
        operation: &'static str,
        /// Stderr reported by the backend
        stderr: String,
    },

    /// The backend engine cannot be reached.
    #[error("container engine unavailable: {0}")]
    EngineUnavailable(String),

    /// Operation not supported by this provider.
    #[error("operation not supported: {0}")]
    Unsupported(&'static str),

    /// Provider construction or initialization failed.
    #[error("provider initialization failed: {0}")]
    Initialization(String),

    /// Instance store failure.
    #[error("instance store error: {0}")]
    Store(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProviderError {
    /// Build a validation error for a missing field.
    pub(crate) fn missing(field: &'static str) -> Self {
        Self::Validation {
            field,
            message: format!("{field} is required"),
        }
    }

    /// The offending field, for validation errors.
    pub fn field(&self) -> Option<&'static str> {
        match self {
            Self::Validation { field, .. } => Some(field),
            _ => None,
        }
    }
}
