//! Metrics aggregation over the vault and registry.

use crate::cycle::GcEngine;
use crate::error::EngineResult;
use gleaner_registry::RegistryStats;
use gleaner_vault::{StatusSummary, VaultStats};

/// Aggregate metrics for the admin surface.
#[derive(Clone, Debug, serde::Serialize)]
pub struct GcMetrics {
    pub total_runs: u64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_run_at: Option<time::OffsetDateTime>,
    pub total_deleted: u64,
    pub total_restored: u64,
    pub vault_size_bytes: u64,
    pub vault: VaultStats,
    pub registry: RegistryStats,
}

impl GcEngine {
    /// Last-cycle summary for the status endpoint.
    pub async fn status(&self) -> EngineResult<StatusSummary> {
        Ok(self.vault().status_summary().await?)
    }

    /// Aggregates from the vault and registry.
    pub async fn metrics(&self) -> EngineResult<GcMetrics> {
        let summary = self.vault().status_summary().await?;
        let vault = self.vault().stats().await?;
        let registry = self.registry().stats().await?;
        let vault_size_bytes = self.blobs().disk_usage().await?;

        Ok(GcMetrics {
            total_runs: summary.total_runs,
            last_run_at: summary.last_run_at,
            total_deleted: summary.total_deleted,
            total_restored: summary.total_restored,
            vault_size_bytes,
            vault,
            registry,
        })
    }
}
