//! Registry error types.

use thiserror::Error;

/// Registry operation errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// A decrement targeted a missing row or would drop the count below zero.
    ///
    /// Non-fatal on CDC paths (treated as an already-applied duplicate);
    /// fatal anywhere counts are supposed to be exact.
    #[error("reference underflow for key: {0}")]
    Underflow(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for registry operations.
pub type RegistryResult<T> = std::result::Result<T, RegistryError>;
