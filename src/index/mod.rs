//! Vector index of embedded chunks.
//!
//! [`EmbeddingIndexer`] pairs an [`EmbeddingClient`] with a [`VectorStore`]. Every chunk is
//! keyed by a fingerprint of its article and text, so appending the same chunk twice replaces
//! the earlier point instead of duplicating it.

mod payload;
mod qdrant;

pub use payload::{ChunkKey, chunk_key};
pub use qdrant::QdrantStore;

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::StatusCode;
use thiserror::Error;
use uuid::Uuid;

use crate::chunking::{Chunk, ChunkOrigin, TokenCounter, whitespace_token_counter};
use crate::embedding::{EmbeddingClient, EmbeddingClientError};

/// Most chunks sent in one embedding request.
const EMBEDDING_BATCH_SIZE: usize = 64;
/// Default token ceiling for one embedding request, below the hosted 300k-token cap.
pub const EMBEDDING_BATCH_TOKENS: usize = 200_000;

/// How a batch is applied to the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IngestionMode {
    /// Drop every existing row, then write the batch.
    Overwrite,
    /// Add the batch, replacing rows with the same fingerprint.
    #[default]
    Append,
}

impl FromStr for IngestionMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "overwrite" => Ok(Self::Overwrite),
            "append" => Ok(Self::Append),
            _ => Err(()),
        }
    }
}

impl fmt::Display for IngestionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Overwrite => "overwrite",
            Self::Append => "append",
        })
    }
}

/// Errors raised by the index and its stores.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Base URL failed to parse or normalize.
    #[error("Invalid index URL: {0}")]
    InvalidUrl(String),
    /// HTTP layer failed before receiving a response.
    #[error("Index request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// The store responded with an unexpected status code.
    #[error("Unexpected index response ({status}): {body}")]
    UnexpectedStatus {
        /// HTTP status returned by the store.
        status: StatusCode,
        /// Body payload associated with the failing response.
        body: String,
    },
    /// A vector does not match the declared schema dimension.
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Dimension declared by the schema.
        expected: usize,
        /// Dimension of the offending vector.
        actual: usize,
    },
    /// The embedding backend failed.
    #[error(transparent)]
    Embedding(#[from] EmbeddingClientError),
    /// A stored row could not be decoded.
    #[error("malformed index row: {0}")]
    MalformedRow(String),
}

/// Embedded chunk ready to be written.
#[derive(Debug, Clone)]
pub struct IndexedChunk {
    /// Point identifier derived from the fingerprint.
    pub id: Uuid,
    /// Hex SHA-256 fingerprint of article and text.
    pub fingerprint: String,
    /// Embedding vector.
    pub vector: Vec<f32>,
    /// Chunk text and provenance.
    pub chunk: Chunk,
}

/// Nearest-neighbour match returned by a query.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexHit {
    /// Point identifier.
    pub id: String,
    /// Similarity score; higher is closer.
    pub score: f32,
    /// Stored chunk text.
    pub text: String,
    /// Stored chunk provenance.
    pub origin: ChunkOrigin,
}

/// Storage backend for embedded chunks.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Create the table with the given vector dimension when it does not exist yet.
    async fn ensure_schema(&self, dimension: usize) -> Result<(), IndexError>;

    /// Swap the whole table for `rows`. On error the previous contents stay queryable.
    async fn replace(&self, dimension: usize, rows: Vec<IndexedChunk>) -> Result<(), IndexError>;

    /// Insert or replace rows keyed by [`IndexedChunk::id`].
    async fn upsert(&self, rows: Vec<IndexedChunk>) -> Result<(), IndexError>;

    /// Nearest `k` rows to `vector`, best first.
    async fn query(&self, vector: Vec<f32>, k: usize) -> Result<Vec<IndexHit>, IndexError>;
}

/// Embeds chunks and writes them to a [`VectorStore`].
pub struct EmbeddingIndexer {
    embedder: Arc<dyn EmbeddingClient>,
    store: Arc<dyn VectorStore>,
    dimension: usize,
    counter: TokenCounter,
    max_batch_tokens: usize,
}

impl EmbeddingIndexer {
    /// Combine an embedder and a store; the embedder's dimension becomes the schema dimension.
    pub fn new(embedder: Arc<dyn EmbeddingClient>, store: Arc<dyn VectorStore>) -> Self {
        let dimension = embedder.dimension();
        Self {
            embedder,
            store,
            dimension,
            counter: whitespace_token_counter(),
            max_batch_tokens: EMBEDDING_BATCH_TOKENS,
        }
    }

    /// Measure request sizes with the embedding model's tokenizer instead of word counts.
    pub fn with_token_counter(mut self, counter: TokenCounter) -> Self {
        self.counter = counter;
        self
    }

    /// Cap the summed tokens of one embedding request. A single chunk is always sent.
    pub fn with_max_batch_tokens(mut self, max_batch_tokens: usize) -> Self {
        self.max_batch_tokens = max_batch_tokens.max(1);
        self
    }

    /// Vector dimension of the schema.
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Declare the table schema (text, vector of the configured dimension, provenance).
    pub async fn define_schema(&self) -> Result<(), IndexError> {
        if self.dimension == 0 {
            return Err(IndexError::DimensionMismatch {
                expected: 1,
                actual: 0,
            });
        }
        self.store.ensure_schema(self.dimension).await
    }

    /// Embed and write a batch, returning the number of rows written.
    ///
    /// Chunks repeated within the batch are written once. Embedding requests are split by both
    /// chunk count and summed tokens. In [`IngestionMode::Overwrite`] the table is replaced only
    /// after every embedding succeeded.
    pub async fn upsert_batch(
        &self,
        chunks: Vec<Chunk>,
        mode: IngestionMode,
    ) -> Result<usize, IndexError> {
        let mut seen = HashSet::new();
        let keyed: Vec<(ChunkKey, Chunk)> = chunks
            .into_iter()
            .filter_map(|chunk| {
                let key = chunk_key(&chunk.origin.source_id, &chunk.text);
                seen.insert(key.point_id).then_some((key, chunk))
            })
            .collect();

        let mut rows = Vec::with_capacity(keyed.len());
        for batch in self.embedding_batches(&keyed) {
            let texts = batch.iter().map(|(_, chunk)| chunk.text.clone()).collect();
            let vectors = self.embedder.generate_embeddings(texts).await?;
            if vectors.len() != batch.len() {
                return Err(EmbeddingClientError::GenerationFailed(format!(
                    "expected {} vectors, received {}",
                    batch.len(),
                    vectors.len()
                ))
                .into());
            }
            for ((key, chunk), vector) in batch.iter().zip(vectors) {
                self.check_dimension(&vector)?;
                rows.push(IndexedChunk {
                    id: key.point_id,
                    fingerprint: key.fingerprint.clone(),
                    vector,
                    chunk: chunk.clone(),
                });
            }
        }

        let written = rows.len();
        match mode {
            IngestionMode::Overwrite => self.store.replace(self.dimension, rows).await?,
            IngestionMode::Append if written > 0 => self.store.upsert(rows).await?,
            IngestionMode::Append => {}
        }
        tracing::info!(%mode, rows = written, "Index batch written");
        Ok(written)
    }

    /// Nearest `k` chunks to a query vector.
    pub async fn query(&self, vector: Vec<f32>, k: usize) -> Result<Vec<IndexHit>, IndexError> {
        self.check_dimension(&vector)?;
        if k == 0 {
            return Ok(Vec::new());
        }
        self.store.query(vector, k).await
    }

    /// Embed `text` and return its nearest `k` chunks.
    pub async fn query_text(&self, text: &str, k: usize) -> Result<Vec<IndexHit>, IndexError> {
        let mut vectors = self
            .embedder
            .generate_embeddings(vec![text.to_string()])
            .await?;
        let vector = vectors.pop().ok_or_else(|| {
            EmbeddingClientError::GenerationFailed("no vector returned for query".into())
        })?;
        self.query(vector, k).await
    }

    fn embedding_batches<'a>(&self, keyed: &'a [(ChunkKey, Chunk)]) -> Vec<&'a [(ChunkKey, Chunk)]> {
        let mut batches = Vec::new();
        let mut start = 0;
        let mut tokens = 0;
        for (index, (_, chunk)) in keyed.iter().enumerate() {
            let cost = (self.counter)(&chunk.text);
            let full = index - start >= EMBEDDING_BATCH_SIZE || tokens + cost > self.max_batch_tokens;
            if index > start && full {
                batches.push(&keyed[start..index]);
                start = index;
                tokens = 0;
            }
            tokens += cost;
        }
        if start < keyed.len() {
            batches.push(&keyed[start..]);
        }
        batches
    }

    fn check_dimension(&self, vector: &[f32]) -> Result<(), IndexError> {
        if vector.len() == self.dimension {
            Ok(())
        } else {
            Err(IndexError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashingEmbedder;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct RecordingStore {
        rows: Mutex<Vec<IndexedChunk>>,
        replacements: Mutex<usize>,
    }

    #[async_trait]
    impl VectorStore for RecordingStore {
        async fn ensure_schema(&self, _dimension: usize) -> Result<(), IndexError> {
            Ok(())
        }

        async fn replace(
            &self,
            _dimension: usize,
            rows: Vec<IndexedChunk>,
        ) -> Result<(), IndexError> {
            *self.rows.lock().await = rows;
            *self.replacements.lock().await += 1;
            Ok(())
        }

        async fn upsert(&self, rows: Vec<IndexedChunk>) -> Result<(), IndexError> {
            let mut stored = self.rows.lock().await;
            for row in rows {
                stored.retain(|existing| existing.id != row.id);
                stored.push(row);
            }
            Ok(())
        }

        async fn query(&self, _vector: Vec<f32>, k: usize) -> Result<Vec<IndexHit>, IndexError> {
            Ok(self
                .rows
                .lock()
                .await
                .iter()
                .take(k)
                .map(|row| IndexHit {
                    id: row.id.to_string(),
                    score: 1.0,
                    text: row.chunk.text.clone(),
                    origin: row.chunk.origin.clone(),
                })
                .collect())
        }
    }

    struct WrongDimension;

    #[async_trait]
    impl EmbeddingClient for WrongDimension {
        fn dimension(&self) -> usize {
            4
        }

        async fn generate_embeddings(
            &self,
            texts: Vec<String>,
        ) -> Result<Vec<Vec<f32>>, EmbeddingClientError> {
            Ok(texts.iter().map(|_| vec![0.5; 3]).collect())
        }
    }

    /// Hashing embedder that remembers how many texts each request carried.
    #[derive(Default)]
    struct RequestLog {
        sizes: std::sync::Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl EmbeddingClient for RequestLog {
        fn dimension(&self) -> usize {
            8
        }

        async fn generate_embeddings(
            &self,
            texts: Vec<String>,
        ) -> Result<Vec<Vec<f32>>, EmbeddingClientError> {
            self.sizes.lock().unwrap().push(texts.len());
            HashingEmbedder::new(8).generate_embeddings(texts).await
        }
    }

    fn chunk(source: &str, text: &str) -> Chunk {
        Chunk {
            text: text.into(),
            origin: ChunkOrigin {
                source_id: source.into(),
                page_numbers: Some(vec![1]),
                heading: None,
            },
        }
    }

    fn indexer(store: Arc<RecordingStore>) -> EmbeddingIndexer {
        EmbeddingIndexer::new(Arc::new(HashingEmbedder::new(8)), store)
    }

    #[test]
    fn ingestion_mode_parses_case_insensitively() {
        assert_eq!("Overwrite".parse::<IngestionMode>(), Ok(IngestionMode::Overwrite));
        assert_eq!(" append ".parse::<IngestionMode>(), Ok(IngestionMode::Append));
        assert_eq!("merge".parse::<IngestionMode>(), Err(()));
    }

    #[tokio::test]
    async fn appending_the_same_chunks_twice_does_not_duplicate() {
        let store = Arc::new(RecordingStore::default());
        let indexer = indexer(store.clone());
        let batch = vec![chunk("10.1/a", "alpha"), chunk("10.1/a", "beta")];

        assert_eq!(indexer.upsert_batch(batch.clone(), IngestionMode::Append).await.unwrap(), 2);
        indexer.upsert_batch(batch, IngestionMode::Append).await.unwrap();
        assert_eq!(store.rows.lock().await.len(), 2);
    }

    #[tokio::test]
    async fn duplicates_within_a_batch_are_written_once() {
        let store = Arc::new(RecordingStore::default());
        let written = indexer(store.clone())
            .upsert_batch(
                vec![chunk("10.1/a", "alpha"), chunk("10.1/a", "alpha"), chunk("10.1/b", "alpha")],
                IngestionMode::Append,
            )
            .await
            .unwrap();
        assert_eq!(written, 2);
    }

    #[tokio::test]
    async fn overwrite_replaces_previous_rows() {
        let store = Arc::new(RecordingStore::default());
        let indexer = indexer(store.clone());
        indexer
            .upsert_batch(vec![chunk("10.1/old", "stale")], IngestionMode::Append)
            .await
            .unwrap();
        indexer
            .upsert_batch(vec![chunk("10.1/new", "fresh")], IngestionMode::Overwrite)
            .await
            .unwrap();

        let rows = store.rows.lock().await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].chunk.origin.source_id, "10.1/new");
        assert_eq!(*store.replacements.lock().await, 1);
    }

    #[tokio::test]
    async fn dimension_mismatch_is_rejected_before_writing() {
        let store = Arc::new(RecordingStore::default());
        let indexer = EmbeddingIndexer::new(Arc::new(WrongDimension), store.clone());
        let error = indexer
            .upsert_batch(vec![chunk("10.1/a", "alpha")], IngestionMode::Overwrite)
            .await
            .unwrap_err();

        assert!(matches!(
            error,
            IndexError::DimensionMismatch {
                expected: 4,
                actual: 3
            }
        ));
        assert_eq!(*store.replacements.lock().await, 0);
        assert!(indexer.query(vec![0.0; 2], 3).await.is_err());
    }

    #[tokio::test]
    async fn query_text_returns_stored_provenance() {
        let store = Arc::new(RecordingStore::default());
        let indexer = indexer(store);
        indexer
            .upsert_batch(vec![chunk("10.1/a", "graphene")], IngestionMode::Append)
            .await
            .unwrap();

        let hits = indexer.query_text("graphene", 5).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].origin.source_id, "10.1/a");
        assert!(indexer.query_text("graphene", 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn embedding_requests_respect_the_token_ceiling() {
        let embedder = Arc::new(RequestLog::default());
        let indexer = EmbeddingIndexer::new(embedder.clone(), Arc::new(RecordingStore::default()))
            .with_token_counter(whitespace_token_counter())
            .with_max_batch_tokens(5);
        let batch = vec![
            chunk("10.1/a", "a b c"),
            chunk("10.1/a", "d e"),
            chunk("10.1/a", "f g h"),
            chunk("10.1/a", "one two three four five six seven"),
            chunk("10.1/a", "i"),
        ];

        let written = indexer.upsert_batch(batch, IngestionMode::Append).await.unwrap();
        assert_eq!(written, 5);
        // An oversized chunk still travels, alone.
        assert_eq!(*embedder.sizes.lock().unwrap(), vec![2, 1, 1, 1]);
    }

    #[tokio::test]
    async fn embedding_requests_are_capped_by_count() {
        let embedder = Arc::new(RequestLog::default());
        let indexer = EmbeddingIndexer::new(embedder.clone(), Arc::new(RecordingStore::default()));
        let batch = (0..EMBEDDING_BATCH_SIZE * 2 + 2)
            .map(|n| chunk("10.1/a", &format!("word{n}")))
            .collect();

        indexer.upsert_batch(batch, IngestionMode::Append).await.unwrap();
        assert_eq!(
            *embedder.sizes.lock().unwrap(),
            vec![EMBEDDING_BATCH_SIZE, EMBEDDING_BATCH_SIZE, 2]
        );
    }
}
