use std::fmt;

use serde::Serialize;

use crate::index::IngestionMode;
use crate::metrics::MetricsSnapshot;

/// Pipeline states an article moves through, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Returned by search and normalized.
    Discovered,
    /// Publisher download started.
    Fetched,
    /// Bytes committed to the blob archive.
    Archived,
    /// Converted and split into chunks.
    Chunked,
    /// Chunks written to the embedding index.
    Indexed,
    /// Metadata row persisted.
    Recorded,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Discovered => "discovered",
            Self::Fetched => "fetched",
            Self::Archived => "archived",
            Self::Chunked => "chunked",
            Self::Indexed => "indexed",
            Self::Recorded => "recorded",
        })
    }
}

/// Why an article was not processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// A previous run already recorded it, or it repeats earlier in this run.
    AlreadyKnown,
}

/// The stage an article failed to reach, and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageFailure {
    /// State the article was moving into when the failure happened.
    pub stage: Stage,
    /// Rendered error.
    pub message: String,
}

impl StageFailure {
    pub(crate) fn new(stage: Stage, error: impl fmt::Display) -> Self {
        Self {
            stage,
            message: error.to_string(),
        }
    }
}

/// Terminal state of one article in a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ArticleState {
    /// Reached `Recorded`.
    Completed,
    /// Not processed.
    Skipped {
        /// Why it was skipped.
        reason: SkipReason,
    },
    /// Halted on a stage failure; other articles were unaffected.
    Failed(StageFailure),
}

/// Outcome for one discovered article.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArticleOutcome {
    /// Article identifier.
    pub id: String,
    /// Where the article ended up.
    #[serde(flatten)]
    pub state: ArticleState,
    /// Chunks produced for the article (zero unless it was chunked).
    pub chunks: usize,
}

/// Summary of one [`Orchestrator::run`](super::Orchestrator::run).
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Search keyword.
    pub query: String,
    /// Ingestion mode used for indexing.
    #[serde(serialize_with = "serialize_display")]
    pub mode: IngestionMode,
    /// One entry per well-formed candidate, in search order.
    pub outcomes: Vec<ArticleOutcome>,
    /// Candidates dropped because required fields were missing.
    pub malformed: usize,
    /// Counter snapshot taken at the end of the run.
    pub metrics: MetricsSnapshot,
}

impl RunReport {
    /// Articles that reached `Recorded` in this run.
    pub fn completed(&self) -> usize {
        self.count(|state| matches!(state, ArticleState::Completed))
    }

    /// Articles skipped as already known.
    pub fn skipped(&self) -> usize {
        self.count(|state| matches!(state, ArticleState::Skipped { .. }))
    }

    /// Articles that halted on a failure.
    pub fn failed(&self) -> usize {
        self.count(|state| matches!(state, ArticleState::Failed(_)))
    }

    fn count(&self, predicate: impl Fn(&ArticleState) -> bool) -> usize {
        self.outcomes
            .iter()
            .filter(|outcome| predicate(&outcome.state))
            .count()
    }
}

fn serialize_display<S: serde::Serializer>(
    value: &IngestionMode,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_str(value)
}
