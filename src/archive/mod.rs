//! Content-addressed archive of raw article bytes.
//!
//! Blob names are a deterministic, reversible encoding of the article identifier, so the
//! existence of a blob doubles as evidence that its identifier was already downloaded.

mod fs;

pub use fs::FsBlobArchive;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::acquisition::{AcquisitionError, ByteStream};

const BLOB_EXTENSION: &str = ".pdf";
/// Longest name [`blob_name_for`] emits, well under common 255-byte filename limits.
pub const MAX_BLOB_NAME: usize = 200;
const HASHED_PREFIX_LEN: usize = 128;
const HASH_MARKER: &str = "~~";

/// Errors raised by archive backends.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// No blob is stored under the requested name.
    #[error("blob not found: {0}")]
    NotFound(String),
    /// The name is not a single safe path component.
    #[error("invalid blob name: {0}")]
    InvalidName(String),
    /// The byte source failed before the write could be committed.
    #[error("byte source failed: {0}")]
    Source(#[from] AcquisitionError),
    /// Underlying storage failure.
    #[error("archive I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of a committed [`BlobStore::put_stream`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    /// Name the blob was committed under.
    pub name: String,
    /// Number of bytes written.
    pub size: u64,
    /// Hex SHA-256 digest of the content.
    pub sha256: String,
}

/// Durable object store keyed by blob name.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Whether a blob exists, without reading its content.
    async fn exists(&self, name: &str) -> Result<bool, ArchiveError>;

    /// Write `source` under `name`. Nothing becomes visible unless the whole stream succeeds.
    async fn put_stream(&self, name: &str, source: ByteStream) -> Result<StoredBlob, ArchiveError>;

    /// Full blob contents.
    async fn get(&self, name: &str) -> Result<Vec<u8>, ArchiveError>;

    /// Committed blob names starting with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, ArchiveError>;

    /// Remove a blob; missing names are not an error.
    async fn delete(&self, name: &str) -> Result<(), ArchiveError>;
}

/// Deterministic, filesystem-safe blob name for an article identifier.
///
/// Bytes outside `[A-Za-z0-9._-]` (including `~`) become `~XX`, so distinct identifiers
/// never share a name: `10.1002/advs.1` → `10.1002~2Fadvs.1.pdf`.
///
/// When the encoding would exceed [`MAX_BLOB_NAME`], the name becomes a readable prefix of
/// the encoding followed by `~~` and the SHA-256 of the identifier. Such names are still
/// unique per identifier but [`id_for_blob_name`] cannot decode them.
pub fn blob_name_for(id: &str) -> String {
    let mut encoded = String::with_capacity(id.len());
    for byte in id.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'.' | b'_' | b'-') {
            encoded.push(byte as char);
        } else {
            encoded.push('~');
            encoded.push_str(&format!("{byte:02X}"));
        }
    }
    if encoded.len() + BLOB_EXTENSION.len() <= MAX_BLOB_NAME {
        encoded.push_str(BLOB_EXTENSION);
        return encoded;
    }

    encoded.truncate(escape_boundary(&encoded, HASHED_PREFIX_LEN));
    let digest = hex::encode(Sha256::digest(id.as_bytes()));
    format!("{encoded}{HASH_MARKER}{digest}{BLOB_EXTENSION}")
}

// Largest cut at or below `limit` that does not split a `~XX` escape.
fn escape_boundary(encoded: &str, limit: usize) -> usize {
    let bytes = encoded.as_bytes();
    let mut cut = limit.min(bytes.len());
    for back in 1..=2 {
        if cut >= back && bytes[cut - back] == b'~' {
            cut -= back;
            break;
        }
    }
    cut
}

/// Recover the article identifier from a blob name produced by [`blob_name_for`].
///
/// Returns `None` for hashed long-identifier names and for anything not produced by
/// [`blob_name_for`].
pub fn id_for_blob_name(name: &str) -> Option<String> {
    let encoded = name.strip_suffix(BLOB_EXTENSION)?;
    if encoded.contains(HASH_MARKER) {
        return None;
    }
    let mut bytes = Vec::with_capacity(encoded.len());
    let mut iter = encoded.bytes();
    while let Some(byte) = iter.next() {
        if byte == b'~' {
            let hi = iter.next()?;
            let lo = iter.next()?;
            let pair = [hi, lo];
            let hex = std::str::from_utf8(&pair).ok()?;
            bytes.push(u8::from_str_radix(hex, 16).ok()?);
        } else {
            bytes.push(byte);
        }
    }
    String::from_utf8(bytes).ok()
}

pub(crate) fn validate_name(name: &str) -> Result<(), ArchiveError> {
    let unsafe_name = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0']);
    if unsafe_name {
        Err(ArchiveError::InvalidName(name.to_string()))
    } else {
        Ok(())
    }
}
