//! Live database reference verification.
//!
//! The GC cycle's last safety gate: before acting on a candidate, every
//! watched `(table, column)` pair is probed with an indexed point query. A
//! key referenced by a committed row at this moment is never deleted in the
//! cycle, whether or not the registry has caught up.

use crate::error::{CdcError, CdcResult};
use async_trait::async_trait;
use gleaner_core::config::{CdcBackend, WatchedTables};
use mysql_async::prelude::Queryable;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Checks whether an object key is referenced by any watched column.
#[async_trait]
pub trait ReferenceVerifier: Send + Sync {
    /// Returns the first `(table, column)` holding the key, or `None`.
    async fn find_reference(&self, key: &str) -> CdcResult<Option<(String, String)>>;

    /// Verify database connectivity.
    async fn health_check(&self) -> CdcResult<()>;
}

enum VerifierPool {
    Postgres(PgPool),
    MySql(mysql_async::Pool),
}

/// SQL-backed verifier issuing `SELECT 1 FROM {table} WHERE {column} = ? LIMIT 1`.
pub struct SqlVerifier {
    pool: VerifierPool,
    tables: WatchedTables,
}

impl SqlVerifier {
    /// Connect to the DSN for the given backend.
    ///
    /// Table and column names come from configuration, not user input, but
    /// they are interpolated into SQL, so they are validated as plain
    /// identifiers here.
    pub async fn connect(
        backend: CdcBackend,
        url: &str,
        tables: WatchedTables,
    ) -> CdcResult<Self> {
        for (table, columns) in &tables {
            validate_identifier(table)?;
            for column in columns {
                validate_identifier(column)?;
            }
        }

        let pool = match backend {
            CdcBackend::Postgres => {
                let pool = PgPoolOptions::new().max_connections(4).connect(url).await?;
                VerifierPool::Postgres(pool)
            }
            CdcBackend::Mysql => {
                let opts = mysql_async::Opts::from_url(url)
                    .map_err(|e| CdcError::Config(format!("invalid MySQL DSN: {e}")))?;
                VerifierPool::MySql(mysql_async::Pool::new(opts))
            }
        };

        Ok(Self { pool, tables })
    }
}

impl SqlVerifier {
    /// Count every live reference per key with a full scan of the watched
    /// columns.
    ///
    /// Feeds [`gleaner_registry::SqliteRegistry::rebuild`]: the result maps
    /// each non-empty column value to the number of rows holding it, summed
    /// across all watched pairs.
    pub async fn scan_reference_counts(
        &self,
    ) -> CdcResult<std::collections::HashMap<String, u64>> {
        let mut counts: std::collections::HashMap<String, u64> = std::collections::HashMap::new();

        for (table, columns) in &self.tables {
            for column in columns {
                let rows: Vec<(String, i64)> = match &self.pool {
                    VerifierPool::Postgres(pool) => {
                        sqlx::query_as(&format!(
                            "SELECT {column}, COUNT(*) FROM {table} \
                             WHERE {column} IS NOT NULL AND {column} <> '' \
                             GROUP BY {column}"
                        ))
                        .fetch_all(pool)
                        .await?
                    }
                    VerifierPool::MySql(pool) => {
                        let mut conn = pool.get_conn().await?;
                        conn.exec(
                            format!(
                                "SELECT {column}, COUNT(*) FROM {table} \
                                 WHERE {column} IS NOT NULL AND {column} <> '' \
                                 GROUP BY {column}"
                            ),
                            (),
                        )
                        .await?
                    }
                };

                for (key, count) in rows {
                    *counts.entry(key).or_insert(0) += count.max(0) as u64;
                }
            }
        }

        Ok(counts)
    }
}

/// Rebuild the registry from a full scan of the watched columns.
///
/// Counts are absolute: observed keys are replaced, unobserved registry rows
/// are left untouched. Returns the number of keys written.
pub async fn rebuild_from_scan(
    verifier: &SqlVerifier,
    registry: &gleaner_registry::SqliteRegistry,
) -> CdcResult<u64> {
    let counts = verifier.scan_reference_counts().await?;
    let total_keys = counts.len() as u64;
    registry.rebuild(counts).await?;
    tracing::info!(keys = total_keys, "registry rebuilt from full scan");
    Ok(total_keys)
}

#[async_trait]
impl ReferenceVerifier for SqlVerifier {
    async fn find_reference(&self, key: &str) -> CdcResult<Option<(String, String)>> {
        for (table, columns) in &self.tables {
            for column in columns {
                let found = match &self.pool {
                    VerifierPool::Postgres(pool) => {
                        let row: Option<i32> = sqlx::query_scalar(&format!(
                            "SELECT 1 FROM {table} WHERE {column} = $1 LIMIT 1"
                        ))
                        .bind(key)
                        .fetch_optional(pool)
                        .await?;
                        row.is_some()
                    }
                    VerifierPool::MySql(pool) => {
                        let mut conn = pool.get_conn().await?;
                        let row: Option<i32> = conn
                            .exec_first(
                                format!("SELECT 1 FROM {table} WHERE {column} = ? LIMIT 1"),
                                (key,),
                            )
                            .await?;
                        row.is_some()
                    }
                };

                if found {
                    return Ok(Some((table.clone(), column.clone())));
                }
            }
        }
        Ok(None)
    }

    async fn health_check(&self) -> CdcResult<()> {
        match &self.pool {
            VerifierPool::Postgres(pool) => {
                sqlx::query("SELECT 1").execute(pool).await?;
            }
            VerifierPool::MySql(pool) => {
                let mut conn = pool.get_conn().await?;
                conn.query_drop("SELECT 1").await?;
            }
        }
        Ok(())
    }
}

fn validate_identifier(name: &str) -> CdcResult<()> {
    let valid = !name.is_empty()
        && !name.starts_with(|c: char| c.is_ascii_digit())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(CdcError::Config(format!(
            "invalid SQL identifier in watched tables: {name:?}"
        )))
    }
}
