//! In-memory storage backend for tests.
//!
//! Supports overriding an object's `last_modified`, which the retention-gate
//! tests need and real backends cannot provide.

use crate::error::{StorageError, StorageResult};
use crate::traits::{ListingPage, ObjectEntry, ObjectMeta, ObjectStore, PageStream};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Mutex;
use time::OffsetDateTime;

#[derive(Clone)]
struct StoredObject {
    data: Bytes,
    last_modified: Option<OffsetDateTime>,
}

/// In-memory object store keyed by exact object key.
#[derive(Default)]
pub struct MemoryBackend {
    objects: Mutex<BTreeMap<String, StoredObject>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an object with an explicit `last_modified` timestamp.
    pub fn put_with_modified(&self, key: &str, data: Bytes, last_modified: OffsetDateTime) {
        self.objects.lock().expect("memory store lock poisoned").insert(
            key.to_string(),
            StoredObject {
                data,
                last_modified: Some(last_modified),
            },
        );
    }

    /// Insert an object whose listing entry has no `last_modified` at all.
    pub fn put_without_modified(&self, key: &str, data: Bytes) {
        self.objects.lock().expect("memory store lock poisoned").insert(
            key.to_string(),
            StoredObject {
                data,
                last_modified: None,
            },
        );
    }

    /// Number of stored objects.
    pub fn len(&self) -> usize {
        self.objects.lock().expect("memory store lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, StoredObject>> {
        self.objects.lock().expect("memory store lock poisoned")
    }
}

#[async_trait]
impl ObjectStore for MemoryBackend {
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        Ok(self.lock().contains_key(key))
    }

    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        let objects = self.lock();
        let object = objects
            .get(key)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        Ok(ObjectMeta {
            size: object.data.len() as u64,
            last_modified: object.last_modified,
        })
    }

    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        let objects = self.lock();
        objects
            .get(key)
            .map(|o| o.data.clone())
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        self.lock().insert(
            key.to_string(),
            StoredObject {
                data,
                last_modified: Some(OffsetDateTime::now_utc()),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.lock()
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    fn list_pages<'a>(&'a self, prefix: &str, page_size: usize) -> PageStream<'a> {
        let entries: Vec<ObjectEntry> = self
            .lock()
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, object)| ObjectEntry {
                key: key.clone(),
                size: object.data.len() as u64,
                last_modified: object.last_modified,
            })
            .collect();

        let pages: Vec<StorageResult<ListingPage>> = entries
            .chunks(page_size.max(1))
            .map(|chunk| {
                Ok(ListingPage {
                    entries: chunk.to_vec(),
                })
            })
            .collect();

        Box::pin(futures::stream::iter(pages))
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn modified_override_is_visible_in_listing() {
        let backend = MemoryBackend::new();
        let aged = OffsetDateTime::now_utc() - time::Duration::days(30);
        backend.put_with_modified("old", Bytes::from_static(b"x"), aged);

        let mut stream = backend.list_pages("", 10);
        let page = stream.next().await.unwrap().unwrap();
        assert_eq!(page.entries[0].last_modified, Some(aged));
    }

    #[tokio::test]
    async fn delete_missing_is_not_found() {
        let backend = MemoryBackend::new();
        assert!(matches!(
            backend.delete("gone").await,
            Err(StorageError::NotFound(_))
        ));
    }
}
