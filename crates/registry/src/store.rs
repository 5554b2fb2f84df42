//! SQLite-backed reference registry.

use crate::error::{RegistryError, RegistryResult};
use crate::models::{Checkpoint, DeltaOp, RefDelta, RefEntry, RegistryStats};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use time::OffsetDateTime;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS refs (
    s3_key TEXT PRIMARY KEY,
    ref_count INTEGER NOT NULL DEFAULT 0,
    first_seen TEXT NOT NULL,
    last_seen TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_refs_ref_count ON refs(ref_count);

CREATE TABLE IF NOT EXISTS cdc_checkpoints (
    stream TEXT PRIMARY KEY,
    cursor TEXT NOT NULL,
    seq INTEGER NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

/// SQLite-based reference registry.
///
/// Writes are serialized behind a single pooled connection; readers see
/// snapshot-consistent state through SQLite's WAL mode.
pub struct SqliteRegistry {
    pool: Pool<Sqlite>,
}

impl SqliteRegistry {
    /// Open (or create) the registry database at the given path.
    pub async fn open(path: impl AsRef<Path>) -> RegistryResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            // Prevent transient "database is locked" errors under concurrent access.
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            // A single connection keeps CDC delta batches strictly ordered and
            // avoids SQLite writer contention.
            .max_connections(1)
            .connect_with(opts)
            .await?;

        sqlx::query(SCHEMA_SQL).execute(&pool).await?;

        Ok(Self { pool })
    }

    /// Atomically raise a key's count by one, creating the row if absent.
    pub async fn increment(&self, key: &str, table: &str, column: &str) -> RegistryResult<()> {
        let now = OffsetDateTime::now_utc();
        sqlx::query(
            r#"
            INSERT INTO refs (s3_key, ref_count, first_seen, last_seen)
            VALUES (?, 1, ?, ?)
            ON CONFLICT(s3_key) DO UPDATE SET
                ref_count = ref_count + 1,
                last_seen = excluded.last_seen
            "#,
        )
        .bind(key)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        tracing::debug!(key = %key, table = %table, column = %column, "reference incremented");
        Ok(())
    }

    /// Atomically lower a key's count by one.
    ///
    /// Fails with [`RegistryError::Underflow`] if the row is missing or the
    /// count is already zero; the row itself is never deleted.
    pub async fn decrement(&self, key: &str, table: &str, column: &str) -> RegistryResult<()> {
        let now = OffsetDateTime::now_utc();
        let result = sqlx::query(
            "UPDATE refs SET ref_count = ref_count - 1, last_seen = ? WHERE s3_key = ? AND ref_count > 0",
        )
        .bind(now)
        .bind(key)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RegistryError::Underflow(key.to_string()));
        }

        tracing::debug!(key = %key, table = %table, column = %column, "reference decremented");
        Ok(())
    }

    /// Current count for a key; 0 for missing rows.
    pub async fn count_of(&self, key: &str) -> RegistryResult<u64> {
        let count: Option<i64> =
            sqlx::query_scalar("SELECT ref_count FROM refs WHERE s3_key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(count.unwrap_or(0).max(0) as u64)
    }

    /// Fetch a full registry row, if present.
    pub async fn entry(&self, key: &str) -> RegistryResult<Option<RefEntry>> {
        let row = sqlx::query_as::<_, RefEntry>("SELECT * FROM refs WHERE s3_key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    /// Apply an ordered batch of deltas and persist the stream checkpoint in
    /// one transaction.
    ///
    /// This is the sole durability contract the CDC ingester relies on:
    /// either every delta and the checkpoint commit, or none do, so a retry
    /// from the prior checkpoint is always safe. Decrement underflows inside
    /// a batch are skipped as already-applied duplicates (replay after a
    /// partial stream re-read), not errors.
    pub async fn apply_batch(
        &self,
        deltas: &[RefDelta],
        checkpoint: &Checkpoint,
    ) -> RegistryResult<()> {
        let now = OffsetDateTime::now_utc();
        let mut tx = self.pool.begin().await?;

        for delta in deltas {
            match delta.op {
                DeltaOp::Increment => {
                    sqlx::query(
                        r#"
                        INSERT INTO refs (s3_key, ref_count, first_seen, last_seen)
                        VALUES (?, 1, ?, ?)
                        ON CONFLICT(s3_key) DO UPDATE SET
                            ref_count = ref_count + 1,
                            last_seen = excluded.last_seen
                        "#,
                    )
                    .bind(&delta.key)
                    .bind(now)
                    .bind(now)
                    .execute(&mut *tx)
                    .await?;
                }
                DeltaOp::Decrement => {
                    let result = sqlx::query(
                        "UPDATE refs SET ref_count = ref_count - 1, last_seen = ? WHERE s3_key = ? AND ref_count > 0",
                    )
                    .bind(now)
                    .bind(&delta.key)
                    .execute(&mut *tx)
                    .await?;

                    if result.rows_affected() == 0 {
                        tracing::warn!(
                            key = %delta.key,
                            table = %delta.table,
                            column = %delta.column,
                            "decrement underflow in CDC batch, treating as duplicate"
                        );
                    }
                }
            }
        }

        sqlx::query(
            r#"
            INSERT INTO cdc_checkpoints (stream, cursor, seq, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(stream) DO UPDATE SET
                cursor = excluded.cursor,
                seq = excluded.seq,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&checkpoint.stream)
        .bind(&checkpoint.cursor)
        .bind(checkpoint.seq)
        .bind(checkpoint.updated_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Replace counts for every supplied key in one transaction.
    ///
    /// Keys not present in `entries` are left untouched. Used by the
    /// full-scan rebuild, which computes absolute counts.
    pub async fn rebuild<I>(&self, entries: I) -> RegistryResult<u64>
    where
        I: IntoIterator<Item = (String, u64)>,
    {
        let now = OffsetDateTime::now_utc();
        let mut tx = self.pool.begin().await?;
        let mut replaced = 0u64;

        for (key, count) in entries {
            sqlx::query(
                r#"
                INSERT INTO refs (s3_key, ref_count, first_seen, last_seen)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(s3_key) DO UPDATE SET
                    ref_count = excluded.ref_count,
                    last_seen = excluded.last_seen
                "#,
            )
            .bind(&key)
            .bind(count as i64)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            replaced += 1;
        }

        tx.commit().await?;
        tracing::info!(keys = replaced, "registry rebuild applied");
        Ok(replaced)
    }

    /// Load the persisted checkpoint for a stream.
    pub async fn checkpoint(&self, stream: &str) -> RegistryResult<Option<Checkpoint>> {
        let row = sqlx::query_as::<_, Checkpoint>(
            "SELECT * FROM cdc_checkpoints WHERE stream = ?",
        )
        .bind(stream)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Aggregate registry statistics.
    pub async fn stats(&self) -> RegistryResult<RegistryStats> {
        let (total, referenced, references): (i64, i64, Option<i64>) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*),
                COUNT(*) FILTER (WHERE ref_count > 0),
                SUM(ref_count)
            FROM refs
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(RegistryStats {
            total_keys: total as u64,
            referenced_keys: referenced as u64,
            orphaned_keys: (total - referenced) as u64,
            total_references: references.unwrap_or(0).max(0) as u64,
        })
    }

    /// Prune zero-count rows not seen within the given number of days.
    pub async fn cleanup_zero_refs(&self, older_than_days: u32) -> RegistryResult<u64> {
        let cutoff = OffsetDateTime::now_utc() - time::Duration::days(older_than_days as i64);
        let result =
            sqlx::query("DELETE FROM refs WHERE ref_count = 0 AND last_seen < ?")
                .bind(cutoff)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    /// Check database connectivity.
    pub async fn health_check(&self) -> RegistryResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn open_registry() -> (tempfile::TempDir, SqliteRegistry) {
        let temp = tempdir().unwrap();
        let registry = SqliteRegistry::open(temp.path().join("registry.db"))
            .await
            .unwrap();
        (temp, registry)
    }

    fn checkpoint(cursor: &str, seq: i64) -> Checkpoint {
        Checkpoint {
            stream: "pg".to_string(),
            cursor: cursor.to_string(),
            seq,
            updated_at: OffsetDateTime::now_utc(),
        }
    }

    #[tokio::test]
    async fn increment_creates_and_counts() {
        let (_temp, registry) = open_registry().await;
        assert_eq!(registry.count_of("k").await.unwrap(), 0);

        registry.increment("k", "users", "avatar_url").await.unwrap();
        registry.increment("k", "users", "avatar_url").await.unwrap();
        assert_eq!(registry.count_of("k").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn decrement_to_zero_keeps_row() {
        let (_temp, registry) = open_registry().await;
        registry.increment("k", "users", "avatar_url").await.unwrap();
        registry.decrement("k", "users", "avatar_url").await.unwrap();

        assert_eq!(registry.count_of("k").await.unwrap(), 0);
        let entry = registry.entry("k").await.unwrap().unwrap();
        assert_eq!(entry.ref_count, 0);
    }

    #[tokio::test]
    async fn decrement_underflow_fails() {
        let (_temp, registry) = open_registry().await;
        assert!(matches!(
            registry.decrement("missing", "users", "avatar_url").await,
            Err(RegistryError::Underflow(_))
        ));

        registry.increment("k", "users", "avatar_url").await.unwrap();
        registry.decrement("k", "users", "avatar_url").await.unwrap();
        assert!(matches!(
            registry.decrement("k", "users", "avatar_url").await,
            Err(RegistryError::Underflow(_))
        ));
    }

    #[tokio::test]
    async fn apply_batch_commits_deltas_and_checkpoint_together() {
        let (_temp, registry) = open_registry().await;
        let deltas = vec![
            RefDelta::increment("a", "users", "avatar_url"),
            RefDelta::increment("b", "users", "avatar_url"),
            RefDelta::decrement("a", "users", "avatar_url"),
        ];

        registry.apply_batch(&deltas, &checkpoint("0/1A2B3C", 1)).await.unwrap();

        assert_eq!(registry.count_of("a").await.unwrap(), 0);
        assert_eq!(registry.count_of("b").await.unwrap(), 1);

        let cp = registry.checkpoint("pg").await.unwrap().unwrap();
        assert_eq!(cp.cursor, "0/1A2B3C");
        assert_eq!(cp.seq, 1);
    }

    #[tokio::test]
    async fn apply_batch_swallows_underflow_as_duplicate() {
        let (_temp, registry) = open_registry().await;
        let deltas = vec![
            RefDelta::decrement("never-seen", "users", "avatar_url"),
            RefDelta::increment("k", "users", "avatar_url"),
        ];

        registry.apply_batch(&deltas, &checkpoint("0/1", 1)).await.unwrap();

        assert_eq!(registry.count_of("never-seen").await.unwrap(), 0);
        assert_eq!(registry.count_of("k").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn reapplying_a_batch_after_replay_converges() {
        // A crash between apply_batch calls replays the stream from the last
        // committed checkpoint; the decrement-as-duplicate rule makes the
        // replayed prefix idempotent for deletes of now-zero keys.
        let (_temp, registry) = open_registry().await;

        let batch = vec![
            RefDelta::increment("k", "users", "avatar_url"),
            RefDelta::decrement("k", "users", "avatar_url"),
        ];
        registry.apply_batch(&batch, &checkpoint("0/1", 1)).await.unwrap();

        // Replay of only the tail decrement (duplicate after crash).
        let replay = vec![RefDelta::decrement("k", "users", "avatar_url")];
        registry.apply_batch(&replay, &checkpoint("0/1", 1)).await.unwrap();

        assert_eq!(registry.count_of("k").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn rebuild_replaces_only_observed_keys() {
        let (_temp, registry) = open_registry().await;
        registry.increment("stale", "users", "avatar_url").await.unwrap();
        registry.increment("stale", "users", "avatar_url").await.unwrap();
        registry.increment("untouched", "users", "avatar_url").await.unwrap();

        registry
            .rebuild(vec![("stale".to_string(), 1), ("new".to_string(), 3)])
            .await
            .unwrap();

        assert_eq!(registry.count_of("stale").await.unwrap(), 1);
        assert_eq!(registry.count_of("new").await.unwrap(), 3);
        assert_eq!(registry.count_of("untouched").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn stats_counts_referenced_and_orphaned() {
        let (_temp, registry) = open_registry().await;
        registry.increment("a", "users", "avatar_url").await.unwrap();
        registry.increment("a", "users", "avatar_url").await.unwrap();
        registry.increment("b", "users", "avatar_url").await.unwrap();
        registry.decrement("b", "users", "avatar_url").await.unwrap();

        let stats = registry.stats().await.unwrap();
        assert_eq!(stats.total_keys, 2);
        assert_eq!(stats.referenced_keys, 1);
        assert_eq!(stats.orphaned_keys, 1);
        assert_eq!(stats.total_references, 2);
    }

    #[tokio::test]
    async fn cleanup_removes_only_old_zero_rows() {
        let (_temp, registry) = open_registry().await;
        registry.increment("live", "users", "avatar_url").await.unwrap();
        registry.increment("dead", "users", "avatar_url").await.unwrap();
        registry.decrement("dead", "users", "avatar_url").await.unwrap();

        // Nothing is old enough yet.
        assert_eq!(registry.cleanup_zero_refs(30).await.unwrap(), 0);
        // With a zero-day cutoff the dead row qualifies immediately.
        assert_eq!(registry.cleanup_zero_refs(0).await.unwrap(), 1);
        assert!(registry.entry("dead").await.unwrap().is_none());
        assert!(registry.entry("live").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn checkpoint_missing_stream_is_none() {
        let (_temp, registry) = open_registry().await;
        assert!(registry.checkpoint("mysql").await.unwrap().is_none());
    }
}
