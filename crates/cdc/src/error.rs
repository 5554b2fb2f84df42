//! CDC error types.

use thiserror::Error;

/// CDC operation errors.
#[derive(Debug, Error)]
pub enum CdcError {
    /// The replication stream broke; the ingester reconnects with backoff.
    #[error("stream error: {0}")]
    Stream(String),

    /// An event could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// The logical replication slot does not exist. The operator must create
    /// it; this is fatal at startup.
    #[error("replication slot {0:?} does not exist (create it with pg_create_logical_replication_slot)")]
    MissingSlot(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("registry error: {0}")]
    Registry(#[from] gleaner_registry::RegistryError),

    #[error("postgres error: {0}")]
    Postgres(#[from] sqlx::Error),

    #[error("mysql error: {0}")]
    MySql(#[from] mysql_async::Error),
}

impl CdcError {
    /// Fatal errors stop the ingester instead of triggering reconnect.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::MissingSlot(_) | Self::Config(_))
    }
}

/// Result type for CDC operations.
pub type CdcResult<T> = std::result::Result<T, CdcError>;
