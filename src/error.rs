//! Error types for aegis-core

use thiserror::Error;

/// Errors that can occur in the security core
#[derive(Debug, Error)]
pub enum SecurityError {
    /// Malformed input to an operation
    #[error("Validation error: {0}")]
    Validation(String),

    /// Checksum or AEAD authentication failure
    ///
    /// Fatal for the record it was raised for — callers must never
    /// substitute partial or default data after this error.
    #[error("Integrity error: {0}")]
    Integrity(String),

    /// Tenant has no resolvable key for the given key id
    #[error("Key not found for tenant '{tenant_id}': {key_id}")]
    KeyNotFound {
        tenant_id: String,
        key_id: String,
    },

    /// Backup, table, or record absent
    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation completed with some parts skipped
    #[error("Partial failure: {completed} completed, {failed} failed")]
    PartialFailure {
        completed: usize,
        failed: usize,
    },

    /// Store or network hiccup — eligible for retry by the caller
    #[error("Transient error: {0}")]
    Transient(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem failure (archive reads/writes)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SecurityError {
    /// Whether the caller may safely retry the failed operation
    pub fn is_transient(&self) -> bool {
        matches!(self, SecurityError::Transient(_))
    }
}

/// Result type alias for security operations
pub type Result<T> = std::result::Result<T, SecurityError>;
