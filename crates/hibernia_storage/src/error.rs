//! Error types for statement execution.

use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur while executing statements.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    /// A primary key, foreign key or not-null constraint was violated.
    #[error("constraint violation [{constraint}]: {message}")]
    ConstraintViolation {
        /// Name of the violated constraint.
        constraint: String,
        /// Description of the violation.
        message: String,
    },

    /// The database could not be reached.
    #[error("connectivity failure: {0}")]
    Connectivity(String),

    /// The connection has been closed.
    #[error("connection is closed")]
    Closed,
}

impl StorageError {
    /// Creates a constraint violation error.
    pub fn constraint(constraint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConstraintViolation {
            constraint: constraint.into(),
            message: message.into(),
        }
    }
}
