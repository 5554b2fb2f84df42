//! Result reports for GC cycles and restore operations.

use crate::config::GcMode;
use serde::{Deserialize, Serialize};

/// Terminal state of a GC cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleStatus {
    /// The cycle ran to completion (per-object failures may still appear in `errors`).
    Completed,
    /// The cycle stopped at its deadline or during shutdown; counters are partial.
    Cancelled,
}

/// Result of one garbage collection cycle.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GcResult {
    pub operation_id: String,
    pub mode: GcMode,
    pub status: CycleStatus,
    /// Keys seen in the bucket listing.
    pub total_scanned: u64,
    /// Keys that passed retention, exclusion, and the registry filter.
    pub candidates_found: u64,
    /// Candidates that also passed live database re-verification.
    pub verified_orphans: u64,
    pub deleted_count: u64,
    pub backed_up_count: u64,
    /// Per-object failures, capped at [`crate::MAX_REPORTED_ERRORS`] entries.
    pub errors: Vec<String>,
    /// Failures beyond the cap, counted only.
    pub errors_truncated: u64,
    pub duration_seconds: f64,
    /// Keys verified as orphans this cycle, whatever the mode.
    pub orphan_keys: Vec<String>,
    pub deleted_keys: Vec<String>,
    pub skipped_keys: Vec<String>,
}

impl GcResult {
    /// Start an empty report for a cycle.
    pub fn begin(operation_id: String, mode: GcMode) -> Self {
        Self {
            operation_id,
            mode,
            status: CycleStatus::Completed,
            total_scanned: 0,
            candidates_found: 0,
            verified_orphans: 0,
            deleted_count: 0,
            backed_up_count: 0,
            errors: Vec::new(),
            errors_truncated: 0,
            duration_seconds: 0.0,
            orphan_keys: Vec::new(),
            deleted_keys: Vec::new(),
            skipped_keys: Vec::new(),
        }
    }

    /// Record a per-object failure, counting past the cap instead of growing.
    pub fn record_error(&mut self, message: String) {
        if self.errors.len() < crate::MAX_REPORTED_ERRORS {
            self.errors.push(message);
        } else {
            self.errors_truncated += 1;
        }
    }
}

/// Result of a restore operation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RestoreResult {
    /// The GC operation the restore targeted (equals `restore_operation_id`
    /// for single-key restores with no source operation context).
    pub operation_id: String,
    /// Fresh id allocated for this restore run, recorded on each touched row.
    pub restore_operation_id: String,
    pub dry_run: bool,
    pub restored_count: u64,
    pub failed_count: u64,
    pub skipped_count: u64,
    pub errors: Vec<String>,
    pub restored_keys: Vec<String>,
    pub failed_keys: Vec<String>,
    pub skipped_keys: Vec<String>,
    pub duration_seconds: f64,
}

impl RestoreResult {
    pub fn begin(operation_id: String, restore_operation_id: String, dry_run: bool) -> Self {
        Self {
            operation_id,
            restore_operation_id,
            dry_run,
            restored_count: 0,
            failed_count: 0,
            skipped_count: 0,
            errors: Vec::new(),
            restored_keys: Vec::new(),
            failed_keys: Vec::new(),
            skipped_keys: Vec::new(),
            duration_seconds: 0.0,
        }
    }
}
