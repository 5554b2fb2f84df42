//! Local filesystem storage backend.
//!
//! Intended for development and tests; the production target is S3.

use crate::error::{StorageError, StorageResult};
use crate::traits::{ListingPage, ObjectEntry, ObjectMeta, ObjectStore, PageStream};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::instrument;

/// Local filesystem object store.
pub struct FilesystemBackend {
    root: PathBuf,
}

impl FilesystemBackend {
    /// Create a new filesystem backend.
    pub async fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    /// Get the full path for a key, with path traversal protection.
    fn key_path(&self, key: &str) -> StorageResult<PathBuf> {
        if key.is_empty() || key.contains("..") || key.starts_with('/') || key.starts_with('\\') {
            return Err(StorageError::InvalidKey(format!(
                "path traversal not allowed: {key}"
            )));
        }
        for component in Path::new(key).components() {
            match component {
                std::path::Component::Normal(_) => {}
                _ => {
                    return Err(StorageError::InvalidKey(format!(
                        "contains unsafe path component: {key}"
                    )));
                }
            }
        }
        Ok(self.root.join(key))
    }

    fn map_not_found(key: &str, err: std::io::Error) -> StorageError {
        if err.kind() == std::io::ErrorKind::NotFound {
            StorageError::NotFound(key.to_string())
        } else {
            StorageError::Io(err)
        }
    }

    /// Recursively collect all object entries under the root, sorted by key.
    fn walk_sync(root: &Path) -> std::io::Result<Vec<ObjectEntry>> {
        let mut entries = Vec::new();
        let mut stack = vec![root.to_path_buf()];
        while let Some(dir) = stack.pop() {
            for entry in std::fs::read_dir(&dir)? {
                let entry = entry?;
                let path = entry.path();
                let file_type = entry.file_type()?;
                if file_type.is_dir() {
                    stack.push(path);
                } else if file_type.is_file() {
                    let metadata = entry.metadata()?;
                    let key = path
                        .strip_prefix(root)
                        .unwrap_or(&path)
                        .to_string_lossy()
                        .replace('\\', "/");
                    entries.push(ObjectEntry {
                        key,
                        size: metadata.len(),
                        last_modified: metadata.modified().ok().map(|t| t.into()),
                    });
                }
            }
        }
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }
}

#[async_trait]
impl ObjectStore for FilesystemBackend {
    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        let path = self.key_path(key)?;
        fs::try_exists(&path).await.map_err(StorageError::Io)
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        let path = self.key_path(key)?;
        let metadata = fs::metadata(&path)
            .await
            .map_err(|e| Self::map_not_found(key, e))?;

        Ok(ObjectMeta {
            size: metadata.len(),
            last_modified: metadata.modified().ok().map(|t| t.into()),
        })
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        let path = self.key_path(key)?;
        let data = fs::read(&path)
            .await
            .map_err(|e| Self::map_not_found(key, e))?;
        Ok(Bytes::from(data))
    }

    #[instrument(skip(self, data), fields(backend = "filesystem", size = data.len()))]
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        let path = self.key_path(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, &data).await.map_err(StorageError::Io)
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn delete(&self, key: &str) -> StorageResult<()> {
        let path = self.key_path(key)?;
        fs::remove_file(&path)
            .await
            .map_err(|e| Self::map_not_found(key, e))
    }

    fn list_pages<'a>(&'a self, prefix: &str, page_size: usize) -> PageStream<'a> {
        let root = self.root.clone();
        let prefix = prefix.to_string();

        let stream = async_stream::try_stream! {
            let entries = tokio::task::spawn_blocking(move || Self::walk_sync(&root))
                .await
                .map_err(|e| StorageError::Io(std::io::Error::other(format!("spawn_blocking failed: {e}"))))?
                .map_err(StorageError::Io)?;

            let matching: Vec<ObjectEntry> = entries
                .into_iter()
                .filter(|e| e.key.starts_with(&prefix))
                .collect();

            for chunk in matching.chunks(page_size.max(1)) {
                yield ListingPage { entries: chunk.to_vec() };
            }
        };

        Box::pin(stream)
    }

    fn backend_name(&self) -> &'static str {
        "filesystem"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tempfile::tempdir;

    #[tokio::test]
    async fn put_get_delete_roundtrip() {
        let temp = tempdir().unwrap();
        let backend = FilesystemBackend::new(temp.path()).await.unwrap();

        backend
            .put("avatars/alice.jpg", Bytes::from_static(b"jpeg"))
            .await
            .unwrap();
        assert!(backend.exists("avatars/alice.jpg").await.unwrap());
        assert_eq!(
            backend.get("avatars/alice.jpg").await.unwrap(),
            Bytes::from_static(b"jpeg")
        );

        let meta = backend.head("avatars/alice.jpg").await.unwrap();
        assert_eq!(meta.size, 4);
        assert!(meta.last_modified.is_some());

        backend.delete("avatars/alice.jpg").await.unwrap();
        assert!(matches!(
            backend.get("avatars/alice.jpg").await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn rejects_path_traversal() {
        let temp = tempdir().unwrap();
        let backend = FilesystemBackend::new(temp.path()).await.unwrap();
        assert!(matches!(
            backend.get("../escape").await,
            Err(StorageError::InvalidKey(_))
        ));
        assert!(matches!(
            backend.get("/absolute").await,
            Err(StorageError::InvalidKey(_))
        ));
    }

    #[tokio::test]
    async fn listing_paginates_sorted() {
        let temp = tempdir().unwrap();
        let backend = FilesystemBackend::new(temp.path()).await.unwrap();
        for i in 0..5 {
            backend
                .put(&format!("k{i}"), Bytes::from_static(b"x"))
                .await
                .unwrap();
        }

        let mut keys = Vec::new();
        let mut pages = 0;
        let mut stream = backend.list_pages("", 2);
        while let Some(page) = stream.next().await {
            let page = page.unwrap();
            pages += 1;
            keys.extend(page.entries.into_iter().map(|e| e.key));
        }
        assert_eq!(keys, vec!["k0", "k1", "k2", "k3", "k4"]);
        assert_eq!(pages, 3);
    }

    #[tokio::test]
    async fn listing_filters_by_prefix() {
        let temp = tempdir().unwrap();
        let backend = FilesystemBackend::new(temp.path()).await.unwrap();
        backend.put("a/1", Bytes::from_static(b"x")).await.unwrap();
        backend.put("b/1", Bytes::from_static(b"x")).await.unwrap();

        let mut stream = backend.list_pages("a/", 100);
        let page = stream.next().await.unwrap().unwrap();
        assert_eq!(page.entries.len(), 1);
        assert_eq!(page.entries[0].key, "a/1");
    }
}
