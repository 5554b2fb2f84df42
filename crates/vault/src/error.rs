//! Vault error types.

use thiserror::Error;

/// Vault operation errors.
#[derive(Debug, Error)]
pub enum VaultError {
    /// A deletion record for `(operation_id, s3_key)` already exists.
    #[error("vault conflict: record for ({operation_id}, {s3_key}) already exists")]
    Conflict {
        operation_id: String,
        s3_key: String,
    },

    /// The record was already marked restored.
    #[error("already restored: ({operation_id}, {s3_key})")]
    AlreadyRestored {
        operation_id: String,
        s3_key: String,
    },

    #[error("not found: {0}")]
    NotFound(String),

    /// The record carries no backup blob (audit-only deletions).
    #[error("no backup blob for key: {0}")]
    NoBlob(String),

    #[error("unknown codec tag: {0}")]
    UnknownCodec(String),

    #[error("compression error: {0}")]
    Compression(std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for vault operations.
pub type VaultResult<T> = std::result::Result<T, VaultError>;
