//! Helpers for identifying chunks and shaping their stored payloads.

use serde::Deserialize;
use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::chunking::{Chunk, ChunkOrigin};

/// Stable identity of a chunk within the index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkKey {
    /// Hex SHA-256 of the source identifier and chunk text.
    pub fingerprint: String,
    /// Point identifier derived from the leading digest bytes.
    pub point_id: Uuid,
}

/// Derive the key for a chunk; identical chunks of the same article always share a key.
pub fn chunk_key(source_id: &str, text: &str) -> ChunkKey {
    let mut hasher = Sha256::new();
    hasher.update(source_id.as_bytes());
    hasher.update(b"\n");
    hasher.update(text.as_bytes());
    let digest = hasher.finalize();

    let mut leading = [0u8; 16];
    leading.copy_from_slice(&digest[..16]);
    ChunkKey {
        fingerprint: hex::encode(digest),
        point_id: Uuid::from_bytes(leading),
    }
}

/// Payload stored alongside each vector.
pub(crate) fn build_payload(chunk: &Chunk, fingerprint: &str, indexed_at: &str) -> Value {
    json!({
        "text": chunk.text,
        "fingerprint": fingerprint,
        "indexed_at": indexed_at,
        "metadata": {
            "source_id": chunk.origin.source_id,
            "page_numbers": chunk.origin.page_numbers,
            "heading": chunk.origin.heading,
        }
    })
}

#[derive(Deserialize)]
struct StoredPayload {
    text: String,
    metadata: ChunkOrigin,
}

/// Recover chunk text and provenance from a stored payload.
pub(crate) fn parse_payload(payload: Map<String, Value>) -> Result<(String, ChunkOrigin), String> {
    let stored: StoredPayload =
        serde_json::from_value(Value::Object(payload)).map_err(|e| e.to_string())?;
    Ok((stored.text, stored.metadata))
}

/// Current timestamp formatted for payload storage.
pub(crate) fn current_timestamp_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}
