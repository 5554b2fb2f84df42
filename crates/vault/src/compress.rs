//! Backup compression with a declared codec tag.
//!
//! The codec is stored on every vault record (and as the blob file
//! extension) so the vault can evolve codecs without breaking restore.

use crate::error::{VaultError, VaultResult};
use async_compression::tokio::write::{ZstdDecoder, ZstdEncoder};
use bytes::Bytes;
use gleaner_core::hash::ContentHash;
use std::str::FromStr;
use tokio::io::AsyncWriteExt;

/// Backup codec tag.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    /// Stored bytes are the original bytes.
    None,
    /// Zstd compression (default).
    #[default]
    Zstd,
}

impl Codec {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Zstd => "zstd",
        }
    }

    /// Blob file extension for this codec.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::None => "raw",
            Self::Zstd => "zst",
        }
    }
}

impl std::fmt::Display for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Codec {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self, VaultError> {
        match s {
            "none" => Ok(Self::None),
            "zstd" => Ok(Self::Zstd),
            other => Err(VaultError::UnknownCodec(other.to_string())),
        }
    }
}

/// Result of compressing object bytes for backup.
pub struct CompressedBackup {
    /// The bytes to store in the blob.
    pub data: Bytes,
    /// Stored (post-compression) size.
    pub stored_size: u64,
    /// SHA-256 of the *pre-compression* bytes, used for restore verification.
    pub content_hash: ContentHash,
}

/// Compress object bytes with the given codec.
pub async fn compress(codec: Codec, data: &[u8]) -> VaultResult<CompressedBackup> {
    let content_hash = ContentHash::compute(data);

    let stored = match codec {
        Codec::None => Bytes::copy_from_slice(data),
        Codec::Zstd => {
            let mut encoder =
                ZstdEncoder::with_quality(Vec::new(), async_compression::Level::Default);
            encoder
                .write_all(data)
                .await
                .map_err(VaultError::Compression)?;
            encoder.shutdown().await.map_err(VaultError::Compression)?;
            Bytes::from(encoder.into_inner())
        }
    };

    Ok(CompressedBackup {
        stored_size: stored.len() as u64,
        data: stored,
        content_hash,
    })
}

/// Decompress backup bytes with the codec recorded at backup time.
pub async fn decompress(codec: Codec, data: &[u8]) -> VaultResult<Bytes> {
    match codec {
        Codec::None => Ok(Bytes::copy_from_slice(data)),
        Codec::Zstd => {
            let mut decoder = ZstdDecoder::new(Vec::new());
            decoder
                .write_all(data)
                .await
                .map_err(VaultError::Compression)?;
            decoder.shutdown().await.map_err(VaultError::Compression)?;
            Ok(Bytes::from(decoder.into_inner()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn zstd_roundtrip_preserves_bytes_and_hash() {
        let data = b"repetitive payload repetitive payload repetitive payload".repeat(64);
        let backup = compress(Codec::Zstd, &data).await.unwrap();
        assert!(backup.stored_size < data.len() as u64);
        assert_eq!(backup.content_hash, ContentHash::compute(&data));

        let restored = decompress(Codec::Zstd, &backup.data).await.unwrap();
        assert_eq!(restored.as_ref(), &data[..]);
        assert_eq!(ContentHash::compute(&restored), backup.content_hash);
    }

    #[tokio::test]
    async fn none_codec_stores_verbatim() {
        let data = b"small object";
        let backup = compress(Codec::None, data).await.unwrap();
        assert_eq!(backup.data.as_ref(), data);
        assert_eq!(backup.stored_size, data.len() as u64);

        let restored = decompress(Codec::None, &backup.data).await.unwrap();
        assert_eq!(restored.as_ref(), data);
    }

    #[test]
    fn codec_tag_roundtrip() {
        assert_eq!("zstd".parse::<Codec>().unwrap(), Codec::Zstd);
        assert_eq!("none".parse::<Codec>().unwrap(), Codec::None);
        assert!("lz4".parse::<Codec>().is_err());
        assert_eq!(Codec::Zstd.extension(), "zst");
    }
}
