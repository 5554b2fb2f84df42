//! Content-addressed backup blob store.
//!
//! Layout: `vault_root/backups/<operation_id>/<sha256(key)>.<codec>`.
//! Filenames are unique per `(operation_id, key)` so no locking is needed.

use crate::compress::Codec;
use crate::error::{VaultError, VaultResult};
use bytes::Bytes;
use gleaner_core::hash::key_digest;
use std::path::{Path, PathBuf};
use tokio::fs;

/// Subdirectory of the vault root holding backup blobs.
const BACKUPS_DIR: &str = "backups";

/// Blob store rooted at the vault directory.
#[derive(Clone, Debug)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn new(vault_root: impl AsRef<Path>) -> Self {
        Self {
            root: vault_root.as_ref().to_path_buf(),
        }
    }

    /// Blob path for a key, relative to the vault root.
    pub fn relative_path(&self, operation_id: &str, key: &str, codec: Codec) -> String {
        format!(
            "{BACKUPS_DIR}/{operation_id}/{}.{}",
            key_digest(key),
            codec.extension()
        )
    }

    fn absolute(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }

    /// Write a blob, creating the operation directory as needed.
    ///
    /// Returns the stored path relative to the vault root.
    pub async fn write(
        &self,
        operation_id: &str,
        key: &str,
        codec: Codec,
        data: &[u8],
    ) -> VaultResult<String> {
        let relative = self.relative_path(operation_id, key, codec);
        let path = self.absolute(&relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, data).await?;
        tracing::debug!(key = %key, blob = %relative, size = data.len(), "backup blob written");
        Ok(relative)
    }

    /// Read a blob by its stored relative path.
    pub async fn read(&self, relative: &str) -> VaultResult<Bytes> {
        if relative.is_empty() {
            return Err(VaultError::NoBlob(relative.to_string()));
        }
        let data = fs::read(self.absolute(relative)).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                VaultError::NotFound(format!("blob missing: {relative}"))
            } else {
                VaultError::Io(e)
            }
        })?;
        Ok(Bytes::from(data))
    }

    /// Whether a blob exists at the stored relative path.
    pub async fn exists(&self, relative: &str) -> VaultResult<bool> {
        if relative.is_empty() {
            return Ok(false);
        }
        Ok(fs::try_exists(self.absolute(relative)).await?)
    }

    /// Best-effort removal, used when a backup aborts before the delete.
    pub async fn remove(&self, relative: &str) {
        if relative.is_empty() {
            return;
        }
        if let Err(e) = fs::remove_file(self.absolute(relative)).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(blob = %relative, error = %e, "failed to remove orphaned backup blob");
        }
    }

    /// Total size in bytes of everything under the vault root.
    pub async fn disk_usage(&self) -> VaultResult<u64> {
        let root = self.root.clone();
        let total = tokio::task::spawn_blocking(move || -> std::io::Result<u64> {
            let mut total = 0u64;
            let mut stack = vec![root];
            while let Some(dir) = stack.pop() {
                let entries = match std::fs::read_dir(&dir) {
                    Ok(entries) => entries,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(e) => return Err(e),
                };
                for entry in entries {
                    let entry = entry?;
                    let file_type = entry.file_type()?;
                    if file_type.is_dir() {
                        stack.push(entry.path());
                    } else if file_type.is_file() {
                        total += entry.metadata()?.len();
                    }
                }
            }
            Ok(total)
        })
        .await
        .map_err(|e| VaultError::Io(std::io::Error::other(format!("spawn_blocking failed: {e}"))))??;
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn write_read_roundtrip() {
        let temp = tempdir().unwrap();
        let blobs = BlobStore::new(temp.path());

        let relative = blobs
            .write("01ARZ3NDEKTSV4RRFFQ69G5FAV", "avatars/bob.jpg", Codec::Zstd, b"data")
            .await
            .unwrap();
        assert!(relative.starts_with("backups/01ARZ3NDEKTSV4RRFFQ69G5FAV/"));
        assert!(relative.ends_with(".zst"));

        assert!(blobs.exists(&relative).await.unwrap());
        assert_eq!(blobs.read(&relative).await.unwrap().as_ref(), b"data");
    }

    #[tokio::test]
    async fn read_missing_blob_is_not_found() {
        let temp = tempdir().unwrap();
        let blobs = BlobStore::new(temp.path());
        assert!(matches!(
            blobs.read("backups/op/none.zst").await,
            Err(VaultError::NotFound(_))
        ));
        assert!(matches!(blobs.read("").await, Err(VaultError::NoBlob(_))));
    }

    #[tokio::test]
    async fn disk_usage_sums_files() {
        let temp = tempdir().unwrap();
        let blobs = BlobStore::new(temp.path());
        blobs.write("op", "a", Codec::None, b"1234").await.unwrap();
        blobs.write("op", "b", Codec::None, b"56").await.unwrap();
        assert_eq!(blobs.disk_usage().await.unwrap(), 6);
    }
}
