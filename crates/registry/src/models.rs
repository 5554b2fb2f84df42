//! Registry row and delta types.

use time::OffsetDateTime;

/// One row of the `refs` table.
#[derive(Clone, Debug, sqlx::FromRow)]
pub struct RefEntry {
    pub s3_key: String,
    pub ref_count: i64,
    pub first_seen: OffsetDateTime,
    pub last_seen: OffsetDateTime,
}

/// Direction of a reference delta.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeltaOp {
    Increment,
    Decrement,
}

/// A single +1/-1 reference change decoded from a CDC row event.
///
/// The originating `(table, column)` rides along for debug logging only;
/// the registry stores counts, not provenance.
#[derive(Clone, Debug)]
pub struct RefDelta {
    pub key: String,
    pub op: DeltaOp,
    pub table: String,
    pub column: String,
}

impl RefDelta {
    pub fn increment(key: impl Into<String>, table: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            op: DeltaOp::Increment,
            table: table.into(),
            column: column.into(),
        }
    }

    pub fn decrement(key: impl Into<String>, table: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            op: DeltaOp::Decrement,
            table: table.into(),
            column: column.into(),
        }
    }
}

/// Persisted CDC stream position.
///
/// Only durable once the deltas up to this position have committed in the
/// same transaction (see [`crate::SqliteRegistry::apply_batch`]).
#[derive(Clone, Debug, PartialEq, Eq, sqlx::FromRow)]
pub struct Checkpoint {
    /// Stream name (one per CDC backend instance).
    pub stream: String,
    /// Opaque cursor: Postgres LSN string or MySQL `file:pos:server_id`.
    pub cursor: String,
    /// Monotonically advancing sequence number.
    pub seq: i64,
    pub updated_at: OffsetDateTime,
}

/// Aggregate registry statistics.
#[derive(Clone, Debug, Default, serde::Serialize)]
pub struct RegistryStats {
    pub total_keys: u64,
    pub referenced_keys: u64,
    pub orphaned_keys: u64,
    pub total_references: u64,
}
