//! Construct pipeline components from [`Config`].
//!
//! Every failure here is a setup failure and aborts the run before any article is touched.

use std::sync::Arc;

use super::{Orchestrator, PipelineComponents, PipelineError};
use crate::acquisition::SourceAcquirer;
use crate::archive::FsBlobArchive;
use crate::chunking::{ChunkerConfig, DocumentChunker, build_token_counter, determine_max_tokens};
use crate::config::{Config, MetadataBackend};
use crate::document::PdfTextConverter;
use crate::embedding::build_embedding_client;
use crate::index::{EmbeddingIndexer, QdrantStore};
use crate::metadata::{JsonMetadataStore, MetadataStore, SqliteMetadataStore};

/// Open the configured metadata backend and initialize its schema.
pub async fn open_metadata_store(config: &Config) -> Result<Arc<dyn MetadataStore>, PipelineError> {
    let store: Arc<dyn MetadataStore> = match config.metadata_backend {
        MetadataBackend::Sqlite => Arc::new(SqliteMetadataStore::open(&config.metadata_path).await?),
        MetadataBackend::Json => Arc::new(JsonMetadataStore::new(&config.metadata_path)),
    };
    store.init_schema().await?;
    tracing::info!(
        backend = ?config.metadata_backend,
        path = %config.metadata_path.display(),
        "Metadata store ready"
    );
    Ok(store)
}

/// Open the blob archive directory.
pub async fn open_archive(config: &Config) -> Result<Arc<FsBlobArchive>, PipelineError> {
    Ok(Arc::new(FsBlobArchive::open(&config.archive_dir).await?))
}

/// Build the embedder and Qdrant-backed indexer.
///
/// Embedding requests are sized with the same tokenizer the chunker uses.
pub fn build_indexer(config: &Config) -> Result<EmbeddingIndexer, PipelineError> {
    let embedder = build_embedding_client(config)?;
    let store = QdrantStore::new(
        &config.qdrant_url,
        config.qdrant_api_key.clone(),
        &config.qdrant_collection_name,
    )?;
    let counter = build_token_counter(config.embedding_provider, &config.embedding_model)?;
    Ok(EmbeddingIndexer::new(embedder, Arc::new(store)).with_token_counter(counter))
}

fn build_chunker(config: &Config) -> Result<DocumentChunker, PipelineError> {
    let max_tokens = determine_max_tokens(config.chunk_max_tokens, &config.embedding_model);
    let counter = build_token_counter(config.embedding_provider, &config.embedding_model)?;
    tracing::debug!(max_tokens, merge_peers = config.chunk_merge_peers, "Chunker configured");
    Ok(DocumentChunker::new(
        ChunkerConfig {
            max_tokens,
            merge_peers: config.chunk_merge_peers,
        },
        counter,
    )?)
}

/// Wire a production orchestrator: HTTP acquisition, filesystem archive, configured metadata
/// backend, lopdf conversion and Qdrant indexing.
pub async fn orchestrator_from_config(config: &Config) -> Result<Orchestrator, PipelineError> {
    let components = PipelineComponents {
        source: Arc::new(SourceAcquirer::from_config(config)?),
        archive: open_archive(config).await?,
        metadata: open_metadata_store(config).await?,
        converter: Arc::new(PdfTextConverter::new()),
        chunker: build_chunker(config)?,
        indexer: build_indexer(config)?,
    };
    Ok(Orchestrator::new(components, config.ingestion_mode))
}
