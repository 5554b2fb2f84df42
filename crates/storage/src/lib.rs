//! Object storage abstraction and backends for gleaner.
//!
//! This crate provides:
//! - The [`ObjectStore`] trait the GC pipeline runs against
//! - Paginated bucket listings carrying per-object modification times
//! - Backends: S3-compatible (production), local filesystem (dev), in-memory (tests)

pub mod backends;
pub mod error;
pub mod traits;

pub use backends::filesystem::FilesystemBackend;
pub use backends::memory::MemoryBackend;
pub use backends::s3::S3Backend;
pub use error::{StorageError, StorageResult};
pub use traits::{ListingPage, ObjectEntry, ObjectMeta, ObjectStore, PageStream};

use gleaner_core::config::AppConfig;
use std::sync::Arc;

/// Create the production object store from configuration.
pub async fn from_config(config: &AppConfig) -> StorageResult<Arc<dyn ObjectStore>> {
    let backend = S3Backend::new(&config.gc.bucket, &config.gc.region, &config.s3).await?;
    Ok(Arc::new(backend))
}
