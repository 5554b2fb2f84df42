//! SQLite-backed audit store.

use crate::error::{VaultError, VaultResult};
use crate::models::{DeletionRecord, OperationRow, VaultStats};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use time::OffsetDateTime;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS operations (
    operation_id TEXT PRIMARY KEY,
    mode TEXT NOT NULL,
    config_digest TEXT NOT NULL,
    started_at TEXT NOT NULL,
    finished_at TEXT,
    counters TEXT,
    error TEXT
);

CREATE INDEX IF NOT EXISTS idx_operations_started_at ON operations(started_at);

CREATE TABLE IF NOT EXISTS deletions (
    operation_id TEXT NOT NULL,
    s3_key TEXT NOT NULL,
    original_size INTEGER NOT NULL,
    stored_size INTEGER NOT NULL,
    codec TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    blob_path TEXT NOT NULL,
    deleted_at TEXT NOT NULL,
    restored_at TEXT,
    restore_operation_id TEXT,
    PRIMARY KEY (operation_id, s3_key),
    FOREIGN KEY (operation_id) REFERENCES operations(operation_id)
);

CREATE INDEX IF NOT EXISTS idx_deletions_s3_key ON deletions(s3_key);
CREATE INDEX IF NOT EXISTS idx_deletions_deleted_at ON deletions(deleted_at);
"#;

/// Last-cycle summary for the status endpoint.
#[derive(Clone, Debug, Default, serde::Serialize)]
pub struct StatusSummary {
    pub total_runs: u64,
    pub total_deleted: u64,
    pub total_restored: u64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_run_at: Option<OffsetDateTime>,
}

/// SQLite-backed audit store.
///
/// Writes are serialized behind a single pooled connection. Rows have no
/// UPDATE path other than the restore mark, which is guarded by
/// `restored_at IS NULL` in its WHERE clause.
pub struct SqliteVault {
    pool: Pool<Sqlite>,
}

impl SqliteVault {
    /// Open (or create) the audit database at the given path.
    pub async fn open(path: impl AsRef<Path>) -> VaultResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            // The audit trail is the deletion evidence; pay for full fsync.
            .synchronous(sqlx::sqlite::SqliteSynchronous::Full)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;

        sqlx::query(SCHEMA_SQL).execute(&pool).await?;

        Ok(Self { pool })
    }

    /// Record the start of an operation.
    pub async fn begin_operation(
        &self,
        operation_id: &str,
        mode: &str,
        config_digest: &str,
    ) -> VaultResult<()> {
        sqlx::query(
            "INSERT INTO operations (operation_id, mode, config_digest, started_at) VALUES (?, ?, ?, ?)",
        )
        .bind(operation_id)
        .bind(mode)
        .bind(config_digest)
        .bind(OffsetDateTime::now_utc())
        .execute(&self.pool)
        .await
        .map_err(|e| map_unique_violation(e, operation_id, ""))?;

        tracing::info!(operation_id = %operation_id, mode = %mode, "operation opened");
        Ok(())
    }

    /// Close an operation with its aggregate counters and optional error.
    pub async fn end_operation(
        &self,
        operation_id: &str,
        counters_json: &str,
        error: Option<&str>,
    ) -> VaultResult<()> {
        let result = sqlx::query(
            "UPDATE operations SET finished_at = ?, counters = ?, error = ? WHERE operation_id = ?",
        )
        .bind(OffsetDateTime::now_utc())
        .bind(counters_json)
        .bind(error)
        .bind(operation_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(VaultError::NotFound(format!("operation {operation_id}")));
        }
        Ok(())
    }

    /// Insert a deletion record.
    ///
    /// Fails with [`VaultError::Conflict`] if `(operation_id, s3_key)` already
    /// exists, which also makes duplicate listing entries idempotent.
    pub async fn record_deletion(&self, record: &DeletionRecord) -> VaultResult<()> {
        sqlx::query(
            r#"
            INSERT INTO deletions (
                operation_id, s3_key, original_size, stored_size, codec,
                content_hash, blob_path, deleted_at, restored_at, restore_operation_id
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, NULL, NULL)
            "#,
        )
        .bind(&record.operation_id)
        .bind(&record.s3_key)
        .bind(record.original_size)
        .bind(record.stored_size)
        .bind(&record.codec)
        .bind(&record.content_hash)
        .bind(&record.blob_path)
        .bind(record.deleted_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_unique_violation(e, &record.operation_id, &record.s3_key))?;

        Ok(())
    }

    /// The most recent not-yet-restored record for a key.
    pub async fn lookup_by_key(&self, s3_key: &str) -> VaultResult<Option<DeletionRecord>> {
        let row = sqlx::query_as::<_, DeletionRecord>(
            r#"
            SELECT * FROM deletions
            WHERE s3_key = ? AND restored_at IS NULL
            ORDER BY deleted_at DESC, operation_id DESC
            LIMIT 1
            "#,
        )
        .bind(s3_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// All records of an operation, optionally including restored ones.
    pub async fn lookup_by_operation(
        &self,
        operation_id: &str,
        include_restored: bool,
    ) -> VaultResult<Vec<DeletionRecord>> {
        let rows = if include_restored {
            sqlx::query_as::<_, DeletionRecord>(
                "SELECT * FROM deletions WHERE operation_id = ? ORDER BY s3_key",
            )
            .bind(operation_id)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query_as::<_, DeletionRecord>(
                "SELECT * FROM deletions WHERE operation_id = ? AND restored_at IS NULL ORDER BY s3_key",
            )
            .bind(operation_id)
            .fetch_all(&self.pool)
            .await?
        };
        Ok(rows)
    }

    /// Mark a record restored, exactly once.
    ///
    /// The `restored_at IS NULL` guard is the immutability enforcement: a
    /// second call matches zero rows and fails with `AlreadyRestored`.
    pub async fn mark_restored(
        &self,
        operation_id: &str,
        s3_key: &str,
        restore_operation_id: &str,
    ) -> VaultResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE deletions
            SET restored_at = ?, restore_operation_id = ?
            WHERE operation_id = ? AND s3_key = ? AND restored_at IS NULL
            "#,
        )
        .bind(OffsetDateTime::now_utc())
        .bind(restore_operation_id)
        .bind(operation_id)
        .bind(s3_key)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(());
        }

        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM deletions WHERE operation_id = ? AND s3_key = ?)",
        )
        .bind(operation_id)
        .bind(s3_key)
        .fetch_one(&self.pool)
        .await?;

        if exists {
            Err(VaultError::AlreadyRestored {
                operation_id: operation_id.to_string(),
                s3_key: s3_key.to_string(),
            })
        } else {
            Err(VaultError::NotFound(format!("({operation_id}, {s3_key})")))
        }
    }

    /// Fetch one operation row.
    pub async fn get_operation(&self, operation_id: &str) -> VaultResult<Option<OperationRow>> {
        let row = sqlx::query_as::<_, OperationRow>(
            "SELECT * FROM operations WHERE operation_id = ?",
        )
        .bind(operation_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// List operations newest-first with an optional mode filter.
    pub async fn list_operations(
        &self,
        limit: u32,
        offset: u64,
        mode: Option<&str>,
    ) -> VaultResult<Vec<OperationRow>> {
        let rows = if let Some(mode) = mode {
            sqlx::query_as::<_, OperationRow>(
                "SELECT * FROM operations WHERE mode = ? ORDER BY operation_id DESC LIMIT ? OFFSET ?",
            )
            .bind(mode)
            .bind(limit)
            .bind(offset as i64)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query_as::<_, OperationRow>(
                "SELECT * FROM operations ORDER BY operation_id DESC LIMIT ? OFFSET ?",
            )
            .bind(limit)
            .bind(offset as i64)
            .fetch_all(&self.pool)
            .await?
        };
        Ok(rows)
    }

    /// Summary for the status endpoint.
    pub async fn status_summary(&self) -> VaultResult<StatusSummary> {
        let (total_runs, last_run_at): (i64, Option<OffsetDateTime>) =
            sqlx::query_as("SELECT COUNT(*), MAX(started_at) FROM operations")
                .fetch_one(&self.pool)
                .await?;

        let (total_deleted, total_restored): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COUNT(restored_at) FROM deletions",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(StatusSummary {
            total_runs: total_runs as u64,
            total_deleted: total_deleted as u64,
            total_restored: total_restored as u64,
            last_run_at,
        })
    }

    /// Aggregate vault statistics.
    pub async fn stats(&self) -> VaultResult<VaultStats> {
        let total_operations: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM operations")
            .fetch_one(&self.pool)
            .await?;

        let by_mode: Vec<(String, i64)> =
            sqlx::query_as("SELECT mode, COUNT(*) FROM operations GROUP BY mode")
                .fetch_all(&self.pool)
                .await?;
        let operations_by_mode = by_mode
            .into_iter()
            .map(|(mode, count)| (mode, count.max(0) as u64))
            .collect();

        let (total_deletions, restored, original_bytes, stored_bytes): (
            i64,
            i64,
            Option<i64>,
            Option<i64>,
        ) = sqlx::query_as(
            r#"
            SELECT COUNT(*), COUNT(restored_at), SUM(original_size), SUM(stored_size)
            FROM deletions
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let avg_compression_ratio: Option<f64> = sqlx::query_scalar(
            r#"
            SELECT AVG(CAST(original_size AS REAL) / stored_size)
            FROM deletions
            WHERE stored_size > 0
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(VaultStats {
            total_operations: total_operations as u64,
            operations_by_mode,
            total_deletions: total_deletions as u64,
            restored_deletions: restored as u64,
            total_original_bytes: original_bytes.unwrap_or(0).max(0) as u64,
            total_stored_bytes: stored_bytes.unwrap_or(0).max(0) as u64,
            avg_compression_ratio: avg_compression_ratio.unwrap_or(0.0),
        })
    }

    /// Check database connectivity.
    pub async fn health_check(&self) -> VaultResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// Map SQLite unique-constraint failures to the vault conflict error.
fn map_unique_violation(err: sqlx::Error, operation_id: &str, s3_key: &str) -> VaultError {
    if let sqlx::Error::Database(ref db_err) = err
        && db_err.message().contains("UNIQUE constraint")
    {
        return VaultError::Conflict {
            operation_id: operation_id.to_string(),
            s3_key: s3_key.to_string(),
        };
    }
    VaultError::Database(err)
}
