//! Vault row types.

use time::OffsetDateTime;

/// One GC or restore operation as recorded in the audit trail.
#[derive(Clone, Debug, serde::Serialize, sqlx::FromRow)]
pub struct OperationRow {
    pub operation_id: String,
    pub mode: String,
    pub config_digest: String,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub finished_at: Option<OffsetDateTime>,
    /// Aggregate counters as JSON, written at close.
    pub counters: Option<String>,
    /// Terminal error for cycles that failed on infrastructure faults.
    pub error: Option<String>,
}

/// One deleted object. Primary key `(operation_id, s3_key)`.
///
/// Immutable after insert except for the restore mark, which transitions
/// `restored_at` / `restore_operation_id` from null exactly once.
#[derive(Clone, Debug, sqlx::FromRow)]
pub struct DeletionRecord {
    pub operation_id: String,
    pub s3_key: String,
    pub original_size: i64,
    pub stored_size: i64,
    /// Codec tag; pairs with the blob file extension.
    pub codec: String,
    /// Hex SHA-256 of the pre-compression bytes; empty for audit-only records.
    pub content_hash: String,
    /// Blob path relative to the vault root; empty for audit-only records.
    pub blob_path: String,
    pub deleted_at: OffsetDateTime,
    pub restored_at: Option<OffsetDateTime>,
    pub restore_operation_id: Option<String>,
}

impl DeletionRecord {
    /// Whether this record carries a restorable backup blob.
    pub fn has_blob(&self) -> bool {
        !self.blob_path.is_empty()
    }
}

/// Aggregate vault statistics.
#[derive(Clone, Debug, Default, serde::Serialize)]
pub struct VaultStats {
    pub total_operations: u64,
    /// Operation counts keyed by mode (`dry_run`, `audit_only`, `execute`).
    pub operations_by_mode: std::collections::BTreeMap<String, u64>,
    pub total_deletions: u64,
    pub restored_deletions: u64,
    pub total_original_bytes: u64,
    pub total_stored_bytes: u64,
    pub avg_compression_ratio: f64,
}
