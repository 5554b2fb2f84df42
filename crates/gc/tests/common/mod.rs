//! Shared test harness for engine tests.

use async_trait::async_trait;
use bytes::Bytes;
use gleaner_cdc::{CdcError, ReferenceVerifier};
use gleaner_core::config::{GcConfig, GcMode, WatchedTables};
use gleaner_gc::GcEngine;
use gleaner_registry::SqliteRegistry;
use gleaner_storage::MemoryBackend;
use gleaner_vault::{BlobStore, SqliteVault};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use time::OffsetDateTime;

/// Everything an engine test needs, with handles kept for inspection.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub struct Harness {
    pub storage: Arc<MemoryBackend>,
    pub registry: Arc<SqliteRegistry>,
    pub vault: Arc<SqliteVault>,
    pub blobs: BlobStore,
    _temp: TempDir,
}

#[allow(dead_code)]
impl Harness {
    pub async fn new() -> Self {
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

        Self {
            storage,
            registry: registry.clone(),
            vault: Arc::new(vault),
            blobs,
            _temp: temp,
        }
    }

    /// Build an engine over the harness stores.
    pub fn engine(
        &self,
        mode: GcMode,
        retention_days: u32,
        exclude_prefixes: &[&str],
        verifier: Option<Arc<dyn ReferenceVerifier>>,
    ) -> GcEngine {
        let mut tables = WatchedTables::new();
        tables.insert("users".to_string(), vec!["avatar_url".to_string()]);

        let config = GcConfig {
            bucket: "test-bucket".to_string(),
            region: "us-east-1".to_string(),
            tables,
            mode,
            retention_days,
            exclude_prefixes: exclude_prefixes.iter().map(|p| p.to_string()).collect(),
            vault_path: std::path::PathBuf::from("unused"),
            cdc_backend: None,
            cdc_connection_url: None,
            schedule: None,
            workers: 4,
            list_page_size: 100,
        };

        GcEngine::new(
            config,
            self.storage.clone(),
            self.registry.clone(),
            self.vault.clone(),
            self.blobs.clone(),
            verifier,
        )
    }

    /// Insert an object whose listing age is `days` days.
    pub fn put_aged(&self, key: &str, data: &[u8], days: i64) {
        self.storage.put_with_modified(
            key,
            Bytes::copy_from_slice(data),
            OffsetDateTime::now_utc() - time::Duration::days(days),
        );
    }

    /// Simulate an applied CDC insert for a key.
    pub async fn reference(&self, key: &str) {
        self.registry
            .increment(key, "users", "avatar_url")
            .await
            .expect("failed to increment");
    }
}

/// Verifier backed by an in-memory set of referenced keys.
#[allow(dead_code)]
#[derive(Default)]
pub struct FakeVerifier {
    referenced: Mutex<HashSet<String>>,
    /// Artificial latency per probe, for overlap and deadline tests.
    pub delay: Option<Duration>,
}

#[allow(dead_code)]
impl FakeVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            referenced: Mutex::new(HashSet::new()),
            delay: Some(delay),
        }
    }

    pub fn insert(&self, key: &str) {
        self.referenced
            .lock()
            .expect("verifier lock poisoned")
            .insert(key.to_string());
    }
}

#[async_trait]
impl ReferenceVerifier for FakeVerifier {
    async fn find_reference(&self, key: &str) -> Result<Option<(String, String)>, CdcError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let found = self
            .referenced
            .lock()
            .expect("verifier lock poisoned")
            .contains(key);
        Ok(found.then(|| ("users".to_string(), "avatar_url".to_string())))
    }

    async fn health_check(&self) -> Result<(), CdcError> {
        Ok(())
    }
}
