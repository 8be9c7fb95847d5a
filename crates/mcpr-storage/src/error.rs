//! Storage errors.

use thiserror::Error;

/// Result alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Failures the store can surface.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StorageError {
    /// The referenced row does not exist.
    #[error("not found: {entity}")]
    NotFound {
        /// Entity kind that was missing.
        entity: &'static str,
    },

    /// A uniqueness constraint was violated.
    #[error("conflict: {reason}")]
    Conflict {
        /// What collided.
        reason: String,
    },
}
