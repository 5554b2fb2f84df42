//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration validation failed:\n  - {}", .0.join("\n  - "))]
    Config(Vec<String>),

    #[error("invalid mode: {0:?} (expected 'dry_run', 'audit_only', or 'execute')")]
    InvalidMode(String),

    #[error("invalid CDC backend: {0:?} (expected 'postgres' or 'mysql', or leave unset)")]
    InvalidCdcBackend(String),

    #[error("invalid schedule: {0:?} (expected HH:MM in UTC)")]
    InvalidSchedule(String),

    #[error("invalid operation id: {0}")]
    InvalidOperationId(String),

    #[error("invalid hash: {0}")]
    InvalidHash(String),
}

impl Error {
    /// Wrap a single validation message as a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(vec![message.into()])
    }
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
