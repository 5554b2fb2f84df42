//! Engine error types.

use thiserror::Error;

/// Errors surfaced by the GC engine.
///
/// Per-object failures never appear here; they are collected into the cycle
/// or restore result. These are the infrastructure and coordination faults
/// that abort a whole operation.
#[derive(Debug, Error)]
pub enum GcError {
    /// A cycle is already in flight on this process.
    #[error("a GC cycle is already running")]
    CycleBusy,

    #[error("operation not found: {0}")]
    OperationNotFound(String),

    /// Per-object restore failure: blob missing, hash mismatch, or upload
    /// failure. Collected into the restore result, never fatal.
    #[error("restore error: {0}")]
    Restore(String),

    #[error("storage error: {0}")]
    Storage(#[from] gleaner_storage::StorageError),

    #[error("registry error: {0}")]
    Registry(#[from] gleaner_registry::RegistryError),

    #[error("vault error: {0}")]
    Vault(#[from] gleaner_vault::VaultError),

    #[error("verification error: {0}")]
    Verify(#[from] gleaner_cdc::CdcError),
}

/// Result type for engine operations.
pub type EngineResult<T> = std::result::Result<T, GcError>;
