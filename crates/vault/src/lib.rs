//! Immutable audit vault for gleaner.
//!
//! The vault is the evidence trail of every deletion:
//! - An append-only audit database (operations and deletion records)
//! - Content-addressed backup blobs alongside it on disk
//! - A streaming compressor with a declared codec tag
//!
//! Records are never updated after the initial write, with one exception:
//! marking a record restored, exactly once.

pub mod blobs;
pub mod compress;
pub mod error;
pub mod models;
pub mod store;

pub use blobs::BlobStore;
pub use compress::{Codec, CompressedBackup, compress, decompress};
pub use error::{VaultError, VaultResult};
pub use models::{DeletionRecord, OperationRow, VaultStats};
pub use store::{SqliteVault, StatusSummary};

use std::path::Path;

/// Name of the audit database inside the vault root.
pub const AUDIT_DB_FILE: &str = "audit.db";

/// Open the audit store and blob store under one vault root.
pub async fn open(vault_root: impl AsRef<Path>) -> VaultResult<(SqliteVault, BlobStore)> {
    let root = vault_root.as_ref();
    tokio::fs::create_dir_all(root).await?;
    let store = SqliteVault::open(root.join(AUDIT_DB_FILE)).await?;
    let blobs = BlobStore::new(root);
    Ok((store, blobs))
}
