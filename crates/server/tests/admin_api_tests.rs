//! Admin API tests over an in-memory engine.

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use bytes::Bytes;
use gleaner_core::config::{AppConfig, GcMode};
use gleaner_gc::GcEngine;
use gleaner_registry::SqliteRegistry;
use gleaner_server::{AppState, create_router};
use gleaner_storage::{MemoryBackend, ObjectStore};
use http_body_util::BodyExt;
use std::sync::Arc;
use tempfile::TempDir;
use time::OffsetDateTime;
use tower::ServiceExt;

const API_KEY: &str = "test-admin-key";

struct TestServer {
    router: Router,
    storage: Arc<MemoryBackend>,
    _temp: TempDir,
}

impl TestServer {
    async fn new(mode: GcMode) -> Self {
        let temp = tempfile::tempdir().expect("failed to create temp directory");
        let storage = Arc::new(MemoryBackend::new());
        let registry = Arc::new(
            SqliteRegistry::open(temp.path().join("registry.db"))
                .await
                .expect("failed to open registry"),
        );
        let (vault, blobs) = gleaner_vault::open(temp.path().join("vault"))
            .await
            .expect("failed to open vault");

        let mut config = AppConfig::for_testing();
        config.gc.mode = mode;
        config.gc.vault_path = temp.path().join("vault");

        let engine = Arc::new(GcEngine::new(
            config.gc.clone(),
            storage.clone(),
            registry,
            Arc::new(vault),
            blobs,
            None,
        ));

        let state = AppState::new(config, engine);
        Self {
            router: create_router(state),
            storage,
            _temp: temp,
        }
    }

    async fn request(&self, method: &str, uri: &str, auth: Option<&str>) -> (StatusCode, serde_json::Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = auth {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        let request = builder.body(Body::empty()).expect("failed to build request");

        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("request failed");
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("failed to read body")
            .to_bytes();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).expect("response was not JSON")
        };
        (status, json)
    }

    fn put_aged(&self, key: &str, data: &[u8], days: i64) {
        self.storage.put_with_modified(
            key,
            Bytes::copy_from_slice(data),
            OffsetDateTime::now_utc() - time::Duration::days(days),
        );
    }
}

#[tokio::test]
async fn missing_token_is_unauthorized() {
    let server = TestServer::new(GcMode::DryRun).await;
    let (status, body) = server.request("GET", "/admin/s3gc/status", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["kind"], "unauthorized");
}

#[tokio::test]
async fn wrong_token_is_unauthorized() {
    let server = TestServer::new(GcMode::DryRun).await;
    let (status, _) = server
        .request("GET", "/admin/s3gc/status", Some("not-the-key"))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn health_reports_dependencies() {
    let server = TestServer::new(GcMode::DryRun).await;
    let (status, body) = server
        .request("GET", "/admin/s3gc/health", Some(API_KEY))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["vault_accessible"], true);
    assert_eq!(body["store_reachable"], true);
    assert!(body["cdc_connected"].is_null());
}

#[tokio::test]
async fn run_cycle_returns_result_and_status_updates() {
    let server = TestServer::new(GcMode::DryRun).await;
    server.put_aged("orphan.bin", b"data", 30);

    let (status, body) = server
        .request("POST", "/admin/s3gc/run", Some(API_KEY))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["mode"], "dry_run");
    assert_eq!(body["status"], "completed");
    assert_eq!(body["total_scanned"], 1);
    assert_eq!(body["verified_orphans"], 1);
    assert_eq!(body["deleted_count"], 0);
    assert_eq!(body["operation_id"].as_str().unwrap().len(), 26);

    let (status, body) = server
        .request("GET", "/admin/s3gc/status", Some(API_KEY))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total_runs"], 1);
    assert_eq!(body["mode"], "dry_run");
    assert!(!body["last_run_at"].is_null());
}

#[tokio::test]
async fn config_endpoint_is_redacted() {
    let server = TestServer::new(GcMode::DryRun).await;
    let (status, body) = server
        .request("GET", "/admin/s3gc/config", Some(API_KEY))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["bucket"], "test-bucket");
    assert_eq!(body["mode"], "dry_run");
    // The admin key never appears in the config snapshot.
    assert!(body.get("admin").is_none());
    assert!(body.get("api_key").is_none());
}

#[tokio::test]
async fn metrics_endpoint_aggregates() {
    let server = TestServer::new(GcMode::Execute).await;
    server.put_aged("orphan.bin", b"some payload", 30);

    server.request("POST", "/admin/s3gc/run", Some(API_KEY)).await;

    let (status, body) = server
        .request("GET", "/admin/s3gc/metrics", Some(API_KEY))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total_runs"], 1);
    assert_eq!(body["total_deleted"], 1);
    assert_eq!(body["vault"]["total_deletions"], 1);
    assert_eq!(body["vault"]["operations_by_mode"]["execute"], 1);
    assert!(body["vault_size_bytes"].as_u64().unwrap() > 0);
}

#[tokio::test]
async fn operations_listing_paginates_with_cursor() {
    let server = TestServer::new(GcMode::DryRun).await;
    for _ in 0..3 {
        let (status, _) = server
            .request("POST", "/admin/s3gc/run", Some(API_KEY))
            .await;
        assert_eq!(status, StatusCode::OK);
    }

    let (status, body) = server
        .request("GET", "/admin/s3gc/operations?limit=2", Some(API_KEY))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["items"].as_array().unwrap().len(), 2);
    let cursor = body["next_cursor"].as_str().unwrap().to_string();

    let (status, body) = server
        .request(
            "GET",
            &format!("/admin/s3gc/operations?limit=2&cursor={cursor}"),
            Some(API_KEY),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["items"].as_array().unwrap().len(), 1);
    assert!(body["next_cursor"].is_null());
}

#[tokio::test]
async fn invalid_cursor_is_bad_request() {
    let server = TestServer::new(GcMode::DryRun).await;
    let (status, body) = server
        .request(
            "GET",
            "/admin/s3gc/operations?cursor=%25%25not-base64",
            Some(API_KEY),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["kind"], "bad_request");
}

#[tokio::test]
async fn restore_unknown_operation_is_not_found() {
    let server = TestServer::new(GcMode::Execute).await;
    let (status, body) = server
        .request(
            "POST",
            "/admin/s3gc/restore/01ARZ3NDEKTSV4RRFFQ69G5FAV?dry_run=false",
            Some(API_KEY),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["kind"], "not_found");
}

#[tokio::test]
async fn delete_and_restore_through_the_api() {
    let server = TestServer::new(GcMode::Execute).await;
    server.put_aged("orphan.bin", b"original bytes", 30);

    let (status, run) = server
        .request("POST", "/admin/s3gc/run", Some(API_KEY))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(run["deleted_count"], 1);
    assert!(!server.storage.exists("orphan.bin").await.unwrap());

    let operation_id = run["operation_id"].as_str().unwrap();
    let (status, restore) = server
        .request(
            "POST",
            &format!("/admin/s3gc/restore/{operation_id}?dry_run=false&skip_existing=false"),
            Some(API_KEY),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(restore["restored_count"], 1);
    assert_eq!(restore["dry_run"], false);

    let data = server.storage.get("orphan.bin").await.unwrap();
    assert_eq!(data.as_ref(), b"original bytes");
}

#[tokio::test]
async fn restore_key_without_record_reports_error_list() {
    let server = TestServer::new(GcMode::Execute).await;
    let (status, body) = server
        .request(
            "POST",
            "/admin/s3gc/restore-key?s3_key=ghost.bin&dry_run=false",
            Some(API_KEY),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["restored_count"], 0);
    assert_eq!(body["errors"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn prometheus_metrics_are_unauthenticated() {
    let server = TestServer::new(GcMode::DryRun).await;
    let request = Request::builder()
        .method("GET")
        .uri("/metrics")
        .body(Body::empty())
        .unwrap();
    let response = server.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
