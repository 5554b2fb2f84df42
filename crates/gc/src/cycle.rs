//! The GC cycle orchestrator.

use crate::error::{EngineResult, GcError};
use futures::StreamExt;
use gleaner_cdc::ReferenceVerifier;
use gleaner_core::config::{GcConfig, GcMode};
use gleaner_core::ids::OperationId;
use gleaner_core::report::{CycleStatus, GcResult};
use gleaner_registry::SqliteRegistry;
use gleaner_storage::{ObjectEntry, ObjectStore, StorageError};
use gleaner_vault::{BlobStore, Codec, DeletionRecord, SqliteVault, VaultError, compress};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Dependency reachability for the health endpoint.
#[derive(Clone, Debug, serde::Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub vault_accessible: bool,
    pub store_reachable: bool,
    /// `None` in scan-only mode (no CDC database configured).
    pub cdc_connected: Option<bool>,
}

/// The garbage collection engine.
///
/// Owns every collaborator a cycle touches. Cycles never overlap on one
/// process: the in-memory cycle lock turns a concurrent run into
/// [`GcError::CycleBusy`] without side effects.
pub struct GcEngine {
    config: GcConfig,
    storage: Arc<dyn ObjectStore>,
    registry: Arc<SqliteRegistry>,
    vault: Arc<SqliteVault>,
    blobs: BlobStore,
    verifier: Option<Arc<dyn ReferenceVerifier>>,
    cycle_lock: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
}

impl GcEngine {
    pub fn new(
        config: GcConfig,
        storage: Arc<dyn ObjectStore>,
        registry: Arc<SqliteRegistry>,
        vault: Arc<SqliteVault>,
        blobs: BlobStore,
        verifier: Option<Arc<dyn ReferenceVerifier>>,
    ) -> Self {
        Self {
            config,
            storage,
            registry,
            vault,
            blobs,
            verifier,
            cycle_lock: tokio::sync::Mutex::new(()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &GcConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SqliteRegistry> {
        &self.registry
    }

    pub fn vault(&self) -> &Arc<SqliteVault> {
        &self.vault
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    pub fn object_store(&self) -> &Arc<dyn ObjectStore> {
        &self.storage
    }

    /// Cancel any in-flight cycle; used at process shutdown.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Probe each dependency for the health endpoint.
    pub async fn health(&self) -> HealthReport {
        let vault_accessible = self.vault.health_check().await.is_ok();
        let store_reachable = self.storage.health_check().await.is_ok();
        let cdc_connected = match &self.verifier {
            Some(verifier) => Some(verifier.health_check().await.is_ok()),
            None => None,
        };
        let healthy = vault_accessible && store_reachable && cdc_connected.unwrap_or(true);

        HealthReport {
            status: if healthy { "ok" } else { "degraded" },
            vault_accessible,
            store_reachable,
            cdc_connected,
        }
    }

    /// Run one complete GC cycle.
    ///
    /// `deadline` bounds wall-clock time; on expiry in-flight object actions
    /// finish, no new candidates are dequeued, and the result closes with
    /// `status = cancelled`.
    pub async fn run_cycle(&self, deadline: Option<Duration>) -> EngineResult<GcResult> {
        let _guard = self.cycle_lock.try_lock().map_err(|_| GcError::CycleBusy)?;

        let token = self.shutdown.child_token();
        let timer = deadline.map(|d| {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(d).await;
                token.cancel();
            })
        });

        let operation_id = OperationId::generate().to_string();
        let started = Instant::now();

        tracing::info!(
            operation_id = %operation_id,
            mode = %self.config.mode,
            "GC cycle started"
        );

        self.vault
            .begin_operation(&operation_id, self.config.mode.as_str(), &self.config.digest())
            .await?;

        let result = Mutex::new(GcResult::begin(operation_id.clone(), self.config.mode));
        let outcome = self.run_pipeline(&operation_id, &token, &result).await;

        if let Some(timer) = timer {
            timer.abort();
        }

        let mut result = result.into_inner().expect("cycle result lock poisoned");
        result.duration_seconds = started.elapsed().as_secs_f64();
        result.status = if token.is_cancelled() {
            CycleStatus::Cancelled
        } else {
            CycleStatus::Completed
        };

        let counters = serde_json::json!({
            "status": result.status,
            "total_scanned": result.total_scanned,
            "candidates_found": result.candidates_found,
            "verified_orphans": result.verified_orphans,
            "deleted_count": result.deleted_count,
            "backed_up_count": result.backed_up_count,
            "errors": result.errors.len() as u64 + result.errors_truncated,
        })
        .to_string();

        match outcome {
            Ok(()) => {
                self.vault.end_operation(&operation_id, &counters, None).await?;
                tracing::info!(
                    operation_id = %operation_id,
                    status = ?result.status,
                    scanned = result.total_scanned,
                    deleted = result.deleted_count,
                    duration_secs = result.duration_seconds,
                    "GC cycle finished"
                );
                Ok(result)
            }
            Err(e) => {
                tracing::error!(operation_id = %operation_id, error = %e, "GC cycle failed");
                if let Err(close_err) = self
                    .vault
                    .end_operation(&operation_id, &counters, Some(&e.to_string()))
                    .await
                {
                    tracing::warn!(
                        operation_id = %operation_id,
                        error = %close_err,
                        "failed to close operation after cycle failure"
                    );
                }
                Err(e)
            }
        }
    }

    /// Lister feeding a bounded queue drained by the worker pool.
    async fn run_pipeline(
        &self,
        operation_id: &str,
        token: &CancellationToken,
        result: &Mutex<GcResult>,
    ) -> EngineResult<()> {
        let workers = self.config.workers.max(1);
        let (tx, rx) = mpsc::channel::<ObjectEntry>(2 * workers);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let lister_token = token.clone();
        let lister = async move {
            let tx = tx; // moved in, dropped on completion to close the queue
            let mut pages = self.storage.list_pages("", self.config.list_page_size);

            'listing: while let Some(page) = pages.next().await {
                let page = page?;
                for entry in page.entries {
                    result.lock().expect("cycle result lock poisoned").total_scanned += 1;

                    if self.config.is_excluded(&entry.key) {
                        tracing::debug!(key = %entry.key, "skipped: excluded prefix");
                        continue;
                    }

                    // Retention gate, fail-closed: a missing timestamp means
                    // the object is treated as too young.
                    match entry.last_modified {
                        None => {
                            tracing::debug!(key = %entry.key, "skipped: no last_modified");
                            continue;
                        }
                        Some(modified)
                            if OffsetDateTime::now_utc() - modified < self.config.retention() =>
                        {
                            continue;
                        }
                        Some(_) => {}
                    }

                    tokio::select! {
                        _ = lister_token.cancelled() => break 'listing,
                        sent = tx.send(entry) => {
                            if sent.is_err() {
                                break 'listing;
                            }
                        }
                    }
                }
            }
            Ok::<(), GcError>(())
        };

        let worker_futures: Vec<_> = (0..workers)
            .map(|_| {
                let rx = Arc::clone(&rx);
                let token = token.clone();
                async move {
                    loop {
                        let entry = tokio::select! {
                            _ = token.cancelled() => None,
                            entry = async { rx.lock().await.recv().await } => entry,
                        };
                        let Some(entry) = entry else { break };
                        if let Err(e) = self.process_entry(operation_id, entry, result).await {
                            // Unblock the lister and siblings; the cycle is over.
                            token.cancel();
                            return Err(e);
                        }
                    }
                    Ok::<(), GcError>(())
                }
            })
            .collect();

        let (lister_outcome, worker_outcomes) =
            futures::join!(lister, futures::future::join_all(worker_futures));

        lister_outcome?;
        for outcome in worker_outcomes {
            outcome?;
        }
        Ok(())
    }

    /// Verify one queued entry and act on it per the configured mode.
    ///
    /// Per-object failures land in the result; only infrastructure faults
    /// (registry or vault unavailable) propagate and abort the cycle.
    async fn process_entry(
        &self,
        operation_id: &str,
        entry: ObjectEntry,
        result: &Mutex<GcResult>,
    ) -> EngineResult<()> {
        let key = entry.key.clone();

        // Registry filter.
        if self.registry.count_of(&key).await? > 0 {
            return Ok(());
        }
        result.lock().expect("cycle result lock poisoned").candidates_found += 1;

        // Live database re-verification: the linearization point. A key
        // referenced by a committed row right now is never deleted this
        // cycle, even if its CDC delta has not been applied yet.
        if let Some(verifier) = &self.verifier {
            match verifier.find_reference(&key).await {
                Ok(Some((table, column))) => {
                    tracing::warn!(
                        key = %key,
                        table = %table,
                        column = %column,
                        "registry stale: key is referenced in the database"
                    );
                    self.registry.increment(&key, &table, &column).await?;
                    let mut result = result.lock().expect("cycle result lock poisoned");
                    result.record_error(format!("registry_stale({key})"));
                    result.skipped_keys.push(key);
                    return Ok(());
                }
                Ok(None) => {}
                Err(e) => {
                    // Verification unavailable: fail closed for this object.
                    let mut result = result.lock().expect("cycle result lock poisoned");
                    result.record_error(format!("{key}: verification failed: {e}"));
                    result.skipped_keys.push(key);
                    return Ok(());
                }
            }
        }

        {
            let mut result = result.lock().expect("cycle result lock poisoned");
            result.verified_orphans += 1;
            result.orphan_keys.push(key.clone());
        }

        match self.config.mode {
            GcMode::DryRun => Ok(()),
            GcMode::AuditOnly => self.audit_only(operation_id, &entry).await,
            GcMode::Execute => self.backup_and_delete(operation_id, &entry, result).await,
        }
    }

    /// Audit-only action: a vault record with no blob and no delete.
    async fn audit_only(&self, operation_id: &str, entry: &ObjectEntry) -> EngineResult<()> {
        let record = DeletionRecord {
            operation_id: operation_id.to_string(),
            s3_key: entry.key.clone(),
            original_size: entry.size as i64,
            stored_size: 0,
            codec: Codec::None.as_str().to_string(),
            content_hash: String::new(),
            blob_path: String::new(),
            deleted_at: OffsetDateTime::now_utc(),
            restored_at: None,
            restore_operation_id: None,
        };

        match self.vault.record_deletion(&record).await {
            Ok(()) => Ok(()),
            Err(VaultError::Conflict { .. }) => {
                tracing::debug!(key = %entry.key, "duplicate listing entry dropped");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Execute action: download, compress, blob, record, then delete.
    ///
    /// Success is acknowledged only after the delete returns OK. Any failure
    /// before the delete aborts this object and leaves the bucket untouched.
    async fn backup_and_delete(
        &self,
        operation_id: &str,
        entry: &ObjectEntry,
        result: &Mutex<GcResult>,
    ) -> EngineResult<()> {
        let key = &entry.key;
        let record_failure = |message: String| {
            let mut result = result.lock().expect("cycle result lock poisoned");
            result.record_error(message);
        };

        let data = match self.storage.get(key).await {
            Ok(data) => data,
            Err(StorageError::NotFound(_)) => {
                tracing::debug!(key = %key, "listed object vanished before backup");
                return Ok(());
            }
            Err(e) => {
                record_failure(format!("{key}: download failed: {e}"));
                return Ok(());
            }
        };

        let codec = Codec::Zstd;
        let backup = match compress(codec, &data).await {
            Ok(backup) => backup,
            Err(e) => {
                record_failure(format!("{key}: compression failed: {e}"));
                return Ok(());
            }
        };

        let blob_path = match self.blobs.write(operation_id, key, codec, &backup.data).await {
            Ok(path) => path,
            Err(e) => {
                record_failure(format!("{key}: backup write failed: {e}"));
                return Ok(());
            }
        };

        let record = DeletionRecord {
            operation_id: operation_id.to_string(),
            s3_key: key.clone(),
            original_size: data.len() as i64,
            stored_size: backup.stored_size as i64,
            codec: codec.as_str().to_string(),
            content_hash: backup.content_hash.to_hex(),
            blob_path: blob_path.clone(),
            deleted_at: OffsetDateTime::now_utc(),
            restored_at: None,
            restore_operation_id: None,
        };

        match self.vault.record_deletion(&record).await {
            Ok(()) => {}
            Err(VaultError::Conflict { .. }) => {
                // Duplicate listing entry; the first worker owns this key.
                tracing::debug!(key = %key, "duplicate listing entry dropped");
                return Ok(());
            }
            Err(e) => {
                // The audit record is the deletion evidence; if the vault
                // cannot take it, the cycle cannot safely continue.
                self.blobs.remove(&blob_path).await;
                return Err(e.into());
            }
        }

        result.lock().expect("cycle result lock poisoned").backed_up_count += 1;

        match self.storage.delete(key).await {
            Ok(()) => {
                tracing::info!(
                    key = %key,
                    blob = %blob_path,
                    original_size = record.original_size,
                    stored_size = record.stored_size,
                    "object backed up and deleted"
                );
                let mut result = result.lock().expect("cycle result lock poisoned");
                result.deleted_count += 1;
                result.deleted_keys.push(key.clone());
                Ok(())
            }
            Err(e) => {
                // Record and blob stay behind with restored_at = null for
                // later reconciliation; the object itself is untouched.
                record_failure(format!("{key}: delete failed after backup: {e}"));
                Ok(())
            }
        }
    }
}
