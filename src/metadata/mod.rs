//! Durable dedup ledger of acquired articles.
//!
//! Every backend guarantees at most one record per article identifier. Inserting a record
//! whose identifier is already present leaves the store untouched and reports
//! [`InsertOutcome::AlreadyExists`] so callers can tell "nothing to do" apart from a failure.

mod json;
mod sqlite;

pub use json::JsonMetadataStore;
pub use sqlite::SqliteMetadataStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One acquired article, keyed by its external identifier (typically a DOI).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArticleMetadata {
    /// Globally unique article identifier.
    pub id: String,
    /// Article title; never empty.
    pub title: String,
    /// Resolvable locator for the article landing page.
    pub url: String,
    /// Publication venue; empty when unknown.
    pub container_title: String,
    /// Publication date formatted as `YYYY-MM-DD`.
    pub publication_date: String,
}

/// Result of [`MetadataStore::insert_if_absent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// A new row was written.
    Inserted,
    /// A row with the same identifier already existed; nothing changed.
    AlreadyExists,
}

/// Errors raised by metadata backends.
#[derive(Debug, Error)]
pub enum MetadataError {
    /// SQLite rejected a statement or the connection failed.
    #[error("metadata database error: {0}")]
    Database(#[from] sqlx::Error),
    /// Reading or writing the master-list file failed.
    #[error("metadata file error: {0}")]
    Io(#[from] std::io::Error),
    /// The master-list file is not valid JSON.
    #[error("metadata file is malformed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Persistent ledger of processed articles.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Create (or load) the backing table. Safe to call on every start.
    async fn init_schema(&self) -> Result<(), MetadataError>;

    /// Insert `record` unless its identifier is already present.
    async fn insert_if_absent(
        &self,
        record: &ArticleMetadata,
    ) -> Result<InsertOutcome, MetadataError>;

    /// Whether an identifier is already recorded.
    async fn contains(&self, id: &str) -> Result<bool, MetadataError>;

    /// Case-insensitive substring match on titles, ordered by identifier.
    async fn find_by_title_substring(
        &self,
        text: &str,
    ) -> Result<Vec<ArticleMetadata>, MetadataError>;

    /// Records whose publication date falls within the inclusive bounds.
    ///
    /// A missing bound leaves that side open.
    async fn find_by_date_range(
        &self,
        start: Option<&str>,
        end: Option<&str>,
    ) -> Result<Vec<ArticleMetadata>, MetadataError>;

    /// Every record, ordered by identifier.
    async fn list_all(&self) -> Result<Vec<ArticleMetadata>, MetadataError>;

    /// Persist any buffered state. Backends that write through return immediately.
    async fn flush(&self) -> Result<(), MetadataError> {
        Ok(())
    }
}

pub(crate) fn within_dates(date: &str, start: Option<&str>, end: Option<&str>) -> bool {
    start.is_none_or(|start| date >= start) && end.is_none_or(|end| date <= end)
}

#[cfg(test)]
pub(crate) fn sample_article(id: &str, title: &str, date: &str) -> ArticleMetadata {
    ArticleMetadata {
        id: id.to_string(),
        title: title.to_string(),
        url: format!("https://doi.org/{id}"),
        container_title: "Advanced Materials".to_string(),
        publication_date: date.to_string(),
    }
}
