//! Storage trait definitions.

use crate::error::StorageResult;
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;

/// A boxed stream of listing pages.
pub type PageStream<'a> = Pin<Box<dyn Stream<Item = StorageResult<ListingPage>> + Send + 'a>>;

/// Metadata about a stored object.
#[derive(Clone, Debug)]
pub struct ObjectMeta {
    /// Object size in bytes.
    pub size: u64,
    /// Last modification time as reported by the store, if available.
    pub last_modified: Option<time::OffsetDateTime>,
}

/// One object as it appears in a bucket listing.
///
/// The listing carries `last_modified` because the GC retention gate is
/// decided from listing data alone, without a per-key HEAD round trip.
#[derive(Clone, Debug)]
pub struct ObjectEntry {
    pub key: String,
    pub size: u64,
    pub last_modified: Option<time::OffsetDateTime>,
}

/// A single page of listing results.
#[derive(Clone, Debug, Default)]
pub struct ListingPage {
    pub entries: Vec<ObjectEntry>,
}

/// Object store abstraction over the bucket being collected.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Check if an object exists.
    async fn exists(&self, key: &str) -> StorageResult<bool>;

    /// Get an object's metadata without fetching content.
    async fn head(&self, key: &str) -> StorageResult<ObjectMeta>;

    /// Get an object's content.
    async fn get(&self, key: &str) -> StorageResult<Bytes>;

    /// Put an object.
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()>;

    /// Delete an object. Returns `NotFound` if the object does not exist.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// List objects under a prefix as a stream of pages.
    ///
    /// Pages stream without materializing the full listing; order follows the
    /// backend's native listing order.
    fn list_pages<'a>(&'a self, prefix: &str, page_size: usize) -> PageStream<'a>;

    /// Static identifier for the backend type, used in metrics and logging.
    fn backend_name(&self) -> &'static str;

    /// Verify backend connectivity.
    ///
    /// The default implementation returns Ok(()), suitable for backends that
    /// don't require connectivity verification.
    async fn health_check(&self) -> StorageResult<()> {
        Ok(())
    }
}
