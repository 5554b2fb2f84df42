//! Point-in-time restore from the vault.

use crate::cycle::GcEngine;
use crate::error::{EngineResult, GcError};
use gleaner_core::hash::ContentHash;
use gleaner_core::ids::OperationId;
use gleaner_core::report::RestoreResult;
use gleaner_vault::{Codec, DeletionRecord, VaultError, decompress};
use std::str::FromStr;
use tokio::time::Instant;

impl GcEngine {
    /// Restore every not-yet-restored record of an operation.
    ///
    /// Restore is per-object: a partial run leaves already-restored rows
    /// marked and later records untouched, so re-invoking is idempotent.
    /// With `skip_existing`, keys already present in the bucket are skipped
    /// without being marked restored.
    pub async fn restore_operation(
        &self,
        operation_id: &str,
        dry_run: bool,
        skip_existing: bool,
    ) -> EngineResult<RestoreResult> {
        if self.vault().get_operation(operation_id).await?.is_none() {
            return Err(GcError::OperationNotFound(operation_id.to_string()));
        }

        let started = Instant::now();
        let restore_operation_id = OperationId::generate().to_string();
        let mut result = RestoreResult::begin(
            operation_id.to_string(),
            restore_operation_id.clone(),
            dry_run,
        );

        tracing::info!(
            operation_id = %operation_id,
            restore_operation_id = %restore_operation_id,
            dry_run = dry_run,
            "restore started"
        );

        let records = self.vault().lookup_by_operation(operation_id, false).await?;
        for record in records {
            if skip_existing && self.storage_has(&record.s3_key).await {
                result.skipped_count += 1;
                result.skipped_keys.push(record.s3_key.clone());
                tracing::debug!(key = %record.s3_key, "restore skipped: object exists");
                continue;
            }

            self.restore_record(&record, dry_run, &restore_operation_id, &mut result)
                .await;
        }

        result.duration_seconds = started.elapsed().as_secs_f64();
        tracing::info!(
            operation_id = %operation_id,
            restored = result.restored_count,
            failed = result.failed_count,
            skipped = result.skipped_count,
            dry_run = dry_run,
            "restore finished"
        );
        Ok(result)
    }

    /// Restore the most recent not-yet-restored record for a single key.
    pub async fn restore_key(&self, s3_key: &str, dry_run: bool) -> EngineResult<RestoreResult> {
        let started = Instant::now();
        let restore_operation_id = OperationId::generate().to_string();

        let record = self.vault().lookup_by_key(s3_key).await?;
        let Some(record) = record else {
            let mut result = RestoreResult::begin(
                restore_operation_id.clone(),
                restore_operation_id,
                dry_run,
            );
            result
                .errors
                .push(format!("no unrestored deletion record for key: {s3_key}"));
            return Ok(result);
        };

        let mut result = RestoreResult::begin(
            record.operation_id.clone(),
            restore_operation_id.clone(),
            dry_run,
        );

        self.restore_record(&record, dry_run, &restore_operation_id, &mut result)
            .await;

        result.duration_seconds = started.elapsed().as_secs_f64();
        Ok(result)
    }

    async fn storage_has(&self, key: &str) -> bool {
        // A probe failure counts as absent; the restore itself will surface
        // any real storage fault per object.
        self.object_store().exists(key).await.unwrap_or(false)
    }

    /// Replay one vault record into the bucket and mark it restored.
    async fn restore_record(
        &self,
        record: &DeletionRecord,
        dry_run: bool,
        restore_operation_id: &str,
        result: &mut RestoreResult,
    ) {
        let key = &record.s3_key;

        match self.replay_record(record, dry_run, restore_operation_id).await {
            Ok(ReplayOutcome::Restored) => {
                result.restored_count += 1;
                result.restored_keys.push(key.clone());
            }
            Ok(ReplayOutcome::AlreadyRestored) => {
                result.skipped_count += 1;
                result.skipped_keys.push(key.clone());
            }
            Err(e) => {
                result.failed_count += 1;
                result.failed_keys.push(key.clone());
                result.errors.push(format!("{key}: {e}"));
                tracing::error!(key = %key, error = %e, "restore failed for object");
            }
        }
    }

    async fn replay_record(
        &self,
        record: &DeletionRecord,
        dry_run: bool,
        restore_operation_id: &str,
    ) -> EngineResult<ReplayOutcome> {
        if !record.has_blob() {
            // Audit-only records carry no backup; there is nothing to replay.
            return Err(GcError::Restore(format!(
                "no backup blob for key (audit-only record): {}",
                record.s3_key
            )));
        }

        if dry_run {
            return Ok(ReplayOutcome::Restored);
        }

        let codec = Codec::from_str(&record.codec)?;
        let stored = self.blobs().read(&record.blob_path).await?;
        let original = decompress(codec, &stored).await?;

        // Integrity gate: the blob must decompress to exactly the bytes that
        // were hashed at deletion time.
        let actual = ContentHash::compute(&original).to_hex();
        if actual != record.content_hash {
            return Err(GcError::Restore(format!(
                "content hash mismatch: expected {}, got {}",
                record.content_hash, actual
            )));
        }

        self.object_store().put(&record.s3_key, original).await?;

        match self
            .vault()
            .mark_restored(&record.operation_id, &record.s3_key, restore_operation_id)
            .await
        {
            Ok(()) => {
                tracing::info!(
                    key = %record.s3_key,
                    operation_id = %record.operation_id,
                    "object restored"
                );
                Ok(ReplayOutcome::Restored)
            }
            Err(VaultError::AlreadyRestored { .. }) => Ok(ReplayOutcome::AlreadyRestored),
            Err(e) => Err(e.into()),
        }
    }
}

enum ReplayOutcome {
    Restored,
    AlreadyRestored,
}
