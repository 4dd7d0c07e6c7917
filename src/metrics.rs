use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe counters describing pipeline activity.
#[derive(Default)]
pub struct PipelineMetrics {
    articles_fetched: AtomicU64,
    articles_skipped: AtomicU64,
    articles_failed: AtomicU64,
    articles_recorded: AtomicU64,
    chunks_indexed: AtomicU64,
}

impl PipelineMetrics {
    /// Create an empty metrics accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a completed publisher download.
    pub fn record_fetch(&self) {
        self.articles_fetched.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a candidate that was already processed by an earlier run.
    pub fn record_skip(&self) {
        self.articles_skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an article whose pipeline halted on a stage failure.
    pub fn record_failure(&self) {
        self.articles_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a newly persisted article row.
    pub fn record_article(&self) {
        self.articles_recorded.fetch_add(1, Ordering::Relaxed);
    }

    /// Record chunks written to the embedding index.
    pub fn record_chunks(&self, chunk_count: u64) {
        self.chunks_indexed
            .fetch_add(chunk_count, Ordering::Relaxed);
    }

    /// Return a snapshot of the current counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            articles_fetched: self.articles_fetched.load(Ordering::Relaxed),
            articles_skipped: self.articles_skipped.load(Ordering::Relaxed),
            articles_failed: self.articles_failed.load(Ordering::Relaxed),
            articles_recorded: self.articles_recorded.load(Ordering::Relaxed),
            chunks_indexed: self.chunks_indexed.load(Ordering::Relaxed),
        }
    }
}

/// Immutable view of pipeline counters used for reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct MetricsSnapshot {
    /// Publisher downloads completed.
    pub articles_fetched: u64,
    /// Candidates skipped because they were already known.
    pub articles_skipped: u64,
    /// Articles that failed at some stage.
    pub articles_failed: u64,
    /// Articles newly recorded in the metadata store.
    pub articles_recorded: u64,
    /// Chunks upserted into the embedding index.
    pub chunks_indexed: u64,
}
