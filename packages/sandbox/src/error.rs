// ABOUTME: Error taxonomy shared by the orchestrator, session manager and gateway
// ABOUTME: Maps storage and provider failures onto the lifecycle error kinds callers match on

use thiserror::Error;

use crate::policy::PolicyViolation;
use crate::providers::ProviderError;
use crate::storage::StorageError;

/// Main error type for sandbox and session operations
#[derive(Error, Debug)]
pub enum SandboxError {
    /// A sandbox or session record does not exist
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// The operation is illegal in the record's current lifecycle state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The security policy rejected a container creation request
    #[error(transparent)]
    PolicyViolation(#[from] PolicyViolation),

    /// Malformed request input such as non-positive resource limits
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// A live record with the same identity already exists
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The container engine call failed
    #[error("Engine failure: {0}")]
    EngineFailure(#[from] ProviderError),

    /// Database error
    #[error("Storage error: {0}")]
    Storage(StorageError),

    /// The service is draining and accepts no new lifecycle operations
    #[error("Service is shutting down")]
    ShuttingDown,
}

impl SandboxError {
    pub fn sandbox_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "Sandbox",
            id: id.into(),
        }
    }

    pub fn session_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "Session",
            id: id.into(),
        }
    }
}

impl From<StorageError> for SandboxError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound { kind, id } => Self::NotFound { kind, id },
            StorageError::Duplicate(message) => Self::Conflict(message),
            other => Self::Storage(other),
        }
    }
}

/// Type alias for Results that return SandboxError
pub type Result<T> = std::result::Result<T, SandboxError>;
