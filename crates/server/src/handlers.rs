//! Admin endpoint handlers.

use crate::error::{ApiError, ApiResult};
use crate::metrics::record_cycle_result;
use crate::state::AppState;
use axum::Json;
use axum::extract::{Path, Query, State};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use gleaner_core::report::{GcResult, RestoreResult};
use gleaner_gc::{GcMetrics, HealthReport};
use gleaner_vault::OperationRow;
use serde::{Deserialize, Serialize};

/// GET /admin/s3gc/health - liveness and dependency reachability.
pub async fn health(State(state): State<AppState>) -> Json<HealthReport> {
    Json(state.engine.health().await)
}

/// Last-cycle summary plus the configured mode.
#[derive(Serialize)]
pub struct StatusResponse {
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_run_at: Option<time::OffsetDateTime>,
    pub total_runs: u64,
    pub total_deleted: u64,
    pub mode: String,
    pub bucket: String,
    pub retention_days: u32,
}

/// GET /admin/s3gc/status
pub async fn status(State(state): State<AppState>) -> ApiResult<Json<StatusResponse>> {
    let summary = state.engine.status().await?;
    Ok(Json(StatusResponse {
        last_run_at: summary.last_run_at,
        total_runs: summary.total_runs,
        total_deleted: summary.total_deleted,
        mode: state.config.gc.mode.to_string(),
        bucket: state.config.gc.bucket.clone(),
        retention_days: state.config.gc.retention_days,
    }))
}

/// GET /admin/s3gc/metrics - aggregates from vault and registry.
pub async fn metrics(State(state): State<AppState>) -> ApiResult<Json<GcMetrics>> {
    Ok(Json(state.engine.metrics().await?))
}

/// GET /admin/s3gc/config - redacted configuration snapshot.
pub async fn config(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(state.config.gc.redacted())
}

/// POST /admin/s3gc/run - trigger one GC cycle.
pub async fn run_cycle(State(state): State<AppState>) -> ApiResult<Json<GcResult>> {
    let result = state.engine.run_cycle(None).await?;
    record_cycle_result(&result);
    Ok(Json(result))
}

#[derive(Deserialize)]
pub struct OperationsQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
    pub cursor: Option<String>,
}

fn default_limit() -> u32 {
    50
}

#[derive(Serialize)]
pub struct OperationsResponse {
    pub items: Vec<OperationRow>,
    pub next_cursor: Option<String>,
}

fn decode_cursor(cursor: &str) -> ApiResult<u64> {
    let bytes = BASE64
        .decode(cursor)
        .map_err(|_| ApiError::BadRequest("invalid cursor".to_string()))?;
    let text = String::from_utf8(bytes)
        .map_err(|_| ApiError::BadRequest("invalid cursor".to_string()))?;
    text.parse()
        .map_err(|_| ApiError::BadRequest("invalid cursor".to_string()))
}

fn encode_cursor(offset: u64) -> String {
    BASE64.encode(offset.to_string())
}

/// GET /admin/s3gc/operations - paginated operation listing, newest first.
pub async fn list_operations(
    State(state): State<AppState>,
    Query(query): Query<OperationsQuery>,
) -> ApiResult<Json<OperationsResponse>> {
    let limit = query.limit.clamp(1, 500);
    let offset = match &query.cursor {
        Some(cursor) => decode_cursor(cursor)?,
        None => 0,
    };

    // Fetch one extra row to learn whether another page exists.
    let mut items = state
        .engine
        .vault()
        .list_operations(limit + 1, offset, None)
        .await
        .map_err(gleaner_gc::GcError::from)?;

    let next_cursor = if items.len() as u32 > limit {
        items.truncate(limit as usize);
        Some(encode_cursor(offset + limit as u64))
    } else {
        None
    };

    Ok(Json(OperationsResponse { items, next_cursor }))
}

#[derive(Deserialize)]
pub struct RestoreOperationQuery {
    #[serde(default = "default_true")]
    pub dry_run: bool,
    #[serde(default = "default_true")]
    pub skip_existing: bool,
}

#[derive(Deserialize)]
pub struct RestoreKeyQuery {
    pub s3_key: String,
    #[serde(default = "default_true")]
    pub dry_run: bool,
}

fn default_true() -> bool {
    true
}

/// POST /admin/s3gc/restore/{operation_id} - restore a whole operation.
pub async fn restore_operation(
    State(state): State<AppState>,
    Path(operation_id): Path<String>,
    Query(query): Query<RestoreOperationQuery>,
) -> ApiResult<Json<RestoreResult>> {
    let result = state
        .engine
        .restore_operation(&operation_id, query.dry_run, query.skip_existing)
        .await?;
    Ok(Json(result))
}

/// POST /admin/s3gc/restore-key - restore the latest record for one key.
pub async fn restore_key(
    State(state): State<AppState>,
    Query(query): Query<RestoreKeyQuery>,
) -> ApiResult<Json<RestoreResult>> {
    let result = state.engine.restore_key(&query.s3_key, query.dry_run).await?;
    Ok(Json(result))
}
