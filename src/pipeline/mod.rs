//! Pipeline composition: search → fetch → archive → convert/chunk → index → record.
//!
//! The [`Orchestrator`] owns no hidden state. Every run re-derives each article's progress
//! from the metadata store and the blob archive, so an interrupted run can simply be started
//! again:
//!
//! - recorded in the metadata store → skipped as already known;
//! - blob archived but not recorded → resumed from `Archived` without another download;
//! - otherwise → the full pipeline.
//!
//! Articles are processed one at a time in search order. A failing stage halts only that
//! article; the failure is kept in the [`RunReport`].

mod report;
mod setup;

pub use report::{ArticleOutcome, ArticleState, RunReport, SkipReason, Stage, StageFailure};
pub use setup::{build_indexer, open_archive, open_metadata_store, orchestrator_from_config};

use std::collections::HashSet;
use std::sync::Arc;

use thiserror::Error;

use crate::acquisition::{AcquisitionError, ArticleSource};
use crate::archive::{ArchiveError, BlobStore, blob_name_for};
use crate::chunking::{Chunk, ChunkingError, DocumentChunker};
use crate::document::DocumentConverter;
use crate::embedding::EmbeddingClientError;
use crate::index::{EmbeddingIndexer, IndexError, IngestionMode};
use crate::metadata::{ArticleMetadata, InsertOutcome, MetadataError, MetadataStore};
use crate::metrics::{MetricsSnapshot, PipelineMetrics};

/// Failures that stop a run (or its setup) as a whole.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Metadata store could not be opened or initialized.
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    /// Blob archive could not be opened.
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    /// Search failed or acquisition clients could not be built.
    #[error(transparent)]
    Acquisition(#[from] AcquisitionError),
    /// Index schema could not be declared.
    #[error(transparent)]
    Index(#[from] IndexError),
    /// Embedding client could not be built.
    #[error(transparent)]
    Embedding(#[from] EmbeddingClientError),
    /// Chunker could not be built.
    #[error(transparent)]
    Chunking(#[from] ChunkingError),
}

/// Collaborators wired into an [`Orchestrator`].
pub struct PipelineComponents {
    /// Search and download.
    pub source: Arc<dyn ArticleSource>,
    /// Raw article storage.
    pub archive: Arc<dyn BlobStore>,
    /// Ledger of processed articles.
    pub metadata: Arc<dyn MetadataStore>,
    /// PDF to structured document conversion.
    pub converter: Arc<dyn DocumentConverter>,
    /// Structure-aware splitter.
    pub chunker: DocumentChunker,
    /// Embedding and vector storage.
    pub indexer: EmbeddingIndexer,
}

/// Drives candidate articles through the pipeline.
pub struct Orchestrator {
    source: Arc<dyn ArticleSource>,
    archive: Arc<dyn BlobStore>,
    metadata: Arc<dyn MetadataStore>,
    converter: Arc<dyn DocumentConverter>,
    chunker: DocumentChunker,
    indexer: EmbeddingIndexer,
    mode: IngestionMode,
    metrics: PipelineMetrics,
}

/// Article that reached `Chunked` and waits for the overwrite rebuild.
struct Staged {
    outcome: usize,
    article: ArticleMetadata,
    chunks: Vec<Chunk>,
}

impl Orchestrator {
    /// Wire the components together.
    pub fn new(components: PipelineComponents, mode: IngestionMode) -> Self {
        Self {
            source: components.source,
            archive: components.archive,
            metadata: components.metadata,
            converter: components.converter,
            chunker: components.chunker,
            indexer: components.indexer,
            mode,
            metrics: PipelineMetrics::new(),
        }
    }

    /// Ingestion mode used by [`run`](Self::run).
    pub fn mode(&self) -> IngestionMode {
        self.mode
    }

    /// Cumulative counters across every run of this orchestrator.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Initialize the metadata schema and the index schema. Safe to repeat.
    pub async fn prepare(&self) -> Result<(), PipelineError> {
        self.metadata.init_schema().await?;
        self.indexer.define_schema().await?;
        Ok(())
    }

    /// Search for `query` and process up to `limit` candidates.
    ///
    /// Only setup and search failures are returned as errors; per-article failures are
    /// reported in the [`RunReport`].
    pub async fn run(&self, query: &str, limit: usize) -> Result<RunReport, PipelineError> {
        self.prepare().await?;
        let candidates = self.source.search(query, limit).await?;
        tracing::info!(query, limit, candidates = candidates.len(), mode = %self.mode, "Starting pipeline run");

        let mut outcomes: Vec<ArticleOutcome> = Vec::with_capacity(candidates.len());
        let mut staged = Vec::new();
        let mut seen = HashSet::new();
        let mut malformed = 0usize;

        for candidate in candidates {
            let shown_id = candidate.display_id().to_string();
            let article = match candidate.into_article() {
                Ok(article) => article,
                Err(error) => {
                    malformed += 1;
                    tracing::warn!(doi = %shown_id, error = %error, "Skipping malformed search record");
                    continue;
                }
            };

            let mut outcome = ArticleOutcome {
                id: article.id.clone(),
                state: ArticleState::Completed,
                chunks: 0,
            };
            if !seen.insert(article.id.clone()) {
                tracing::info!(doi = %article.id, "Duplicate search result, skipping");
                self.metrics.record_skip();
                outcome.state = ArticleState::Skipped {
                    reason: SkipReason::AlreadyKnown,
                };
                outcomes.push(outcome);
                continue;
            }

            match self.process(&article).await {
                Ok(Progress::Skipped) => {
                    outcome.state = ArticleState::Skipped {
                        reason: SkipReason::AlreadyKnown,
                    };
                }
                Ok(Progress::Recorded { chunks }) => outcome.chunks = chunks,
                Ok(Progress::Chunked { chunks }) => {
                    outcome.chunks = chunks.len();
                    staged.push(Staged {
                        outcome: outcomes.len(),
                        article,
                        chunks,
                    });
                }
                Err(failure) => {
                    self.metrics.record_failure();
                    tracing::warn!(doi = %outcome.id, stage = %failure.stage, error = %failure.message, "Article failed");
                    outcome.state = ArticleState::Failed(failure);
                }
            }
            outcomes.push(outcome);
        }

        if !staged.is_empty() {
            self.rebuild_index(staged, &mut outcomes).await;
        }
        self.metadata.flush().await?;
        // Leave the publisher cooldown fully elapsed before returning.
        self.source.settle().await;

        let report = RunReport {
            query: query.to_string(),
            mode: self.mode,
            outcomes,
            malformed,
            metrics: self.metrics.snapshot(),
        };
        tracing::info!(
            query,
            completed = report.completed(),
            skipped = report.skipped(),
            failed = report.failed(),
            malformed,
            "Pipeline run finished"
        );
        Ok(report)
    }

    async fn process(&self, article: &ArticleMetadata) -> Result<Progress, StageFailure> {
        let id = article.id.as_str();
        let known = self
            .metadata
            .contains(id)
            .await
            .map_err(|e| StageFailure::new(Stage::Discovered, e))?;
        if known {
            tracing::info!(doi = id, "Already recorded, skipping");
            self.metrics.record_skip();
            return Ok(Progress::Skipped);
        }

        let blob = blob_name_for(id);
        let archived = self
            .archive
            .exists(&blob)
            .await
            .map_err(|e| StageFailure::new(Stage::Discovered, e))?;
        if archived {
            tracing::info!(doi = id, blob = %blob, "Blob already archived, resuming without fetch");
        } else {
            let stream = self
                .source
                .fetch(id)
                .await
                .map_err(|e| StageFailure::new(Stage::Fetched, e))?;
            let stored = self
                .archive
                .put_stream(&blob, stream)
                .await
                .map_err(|e| StageFailure::new(Stage::Archived, e))?;
            self.metrics.record_fetch();
            tracing::info!(doi = id, blob = %stored.name, size = stored.size, sha256 = %stored.sha256, "Article archived");
        }

        let chunks = self.chunk_archived(id, &blob).await?;
        if self.mode == IngestionMode::Overwrite {
            return Ok(Progress::Chunked { chunks });
        }

        let written = self
            .indexer
            .upsert_batch(chunks, IngestionMode::Append)
            .await
            .map_err(|e| StageFailure::new(Stage::Indexed, e))?;
        self.metrics.record_chunks(written as u64);
        self.record(article).await?;
        Ok(Progress::Recorded { chunks: written })
    }

    async fn chunk_archived(&self, id: &str, blob: &str) -> Result<Vec<Chunk>, StageFailure> {
        let bytes = self
            .archive
            .get(blob)
            .await
            .map_err(|e| StageFailure::new(Stage::Chunked, e))?;
        let document = self
            .converter
            .convert(id, &bytes)
            .await
            .map_err(|e| StageFailure::new(Stage::Chunked, e))?;
        let chunks = self
            .chunker
            .chunk(&document)
            .map_err(|e| StageFailure::new(Stage::Chunked, e))?;
        tracing::debug!(doi = id, chunks = chunks.len(), "Article chunked");
        Ok(chunks)
    }

    async fn record(&self, article: &ArticleMetadata) -> Result<(), StageFailure> {
        match self.metadata.insert_if_absent(article).await {
            Ok(InsertOutcome::Inserted) => {
                self.metrics.record_article();
                tracing::info!(doi = %article.id, "Article recorded");
                Ok(())
            }
            Ok(InsertOutcome::AlreadyExists) => {
                tracing::info!(doi = %article.id, "Article already recorded");
                Ok(())
            }
            Err(error) => Err(StageFailure::new(Stage::Recorded, error)),
        }
    }

    /// Replace the index with every recorded article plus the newly chunked ones.
    async fn rebuild_index(&self, staged: Vec<Staged>, outcomes: &mut [ArticleOutcome]) {
        let mut batch = match self.recorded_corpus().await {
            Ok(chunks) => chunks,
            Err(failure) => {
                self.fail_staged(&staged, &failure, outcomes);
                return;
            }
        };
        for entry in &staged {
            batch.extend(entry.chunks.iter().cloned());
        }

        match self.indexer.upsert_batch(batch, IngestionMode::Overwrite).await {
            Ok(written) => {
                self.metrics.record_chunks(written as u64);
                for entry in staged {
                    if let Err(failure) = self.record(&entry.article).await {
                        self.metrics.record_failure();
                        outcomes[entry.outcome].state = ArticleState::Failed(failure);
                    }
                }
            }
            Err(error) => {
                let failure = StageFailure::new(Stage::Indexed, error);
                self.fail_staged(&staged, &failure, outcomes);
            }
        }
    }

    async fn recorded_corpus(&self) -> Result<Vec<Chunk>, StageFailure> {
        let recorded = self
            .metadata
            .list_all()
            .await
            .map_err(|e| StageFailure::new(Stage::Indexed, e))?;
        let mut chunks = Vec::new();
        for article in recorded {
            let blob = blob_name_for(&article.id);
            match self.chunk_archived(&article.id, &blob).await {
                Ok(article_chunks) => chunks.extend(article_chunks),
                Err(failure) => {
                    tracing::warn!(doi = %article.id, error = %failure.message, "Recorded article left out of rebuild");
                }
            }
        }
        Ok(chunks)
    }

    fn fail_staged(&self, staged: &[Staged], failure: &StageFailure, outcomes: &mut [ArticleOutcome]) {
        tracing::error!(error = %failure.message, articles = staged.len(), "Index rebuild failed");
        for entry in staged {
            self.metrics.record_failure();
            outcomes[entry.outcome].state = ArticleState::Failed(failure.clone());
        }
    }
}

enum Progress {
    Skipped,
    Chunked { chunks: Vec<Chunk> },
    Recorded { chunks: usize },
}
