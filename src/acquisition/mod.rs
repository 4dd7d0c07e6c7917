//! External acquisition: bibliographic search and rate-limited publisher downloads.

mod crossref;
mod publisher;
mod throttle;

pub use crossref::{CandidateRecord, CreatedStamp, SearchClient};
pub use publisher::PublisherClient;
pub use throttle::{Cooldown, CooldownPermit};

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::Stream;
use reqwest::StatusCode;
use thiserror::Error;

use crate::config::Config;

/// Streaming body of a downloaded article.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, AcquisitionError>> + Send>>;

/// Errors raised while searching for or downloading articles.
#[derive(Debug, Error)]
pub enum AcquisitionError {
    /// Timeout, connection reset, or interrupted body; the caller may retry later.
    #[error("transient network failure: {0}")]
    Transient(#[source] reqwest::Error),
    /// Any other HTTP client failure (request construction, decoding).
    #[error("HTTP request failed: {0}")]
    Http(#[source] reqwest::Error),
    /// Remote service answered with a non-success status.
    #[error("remote rejected request ({status}): {body}")]
    Rejected {
        /// HTTP status returned by the service.
        status: StatusCode,
        /// Body text associated with the failing response.
        body: String,
    },
    /// A search result lacked a field required to build a record.
    #[error("malformed search record: {0}")]
    MalformedRecord(String),
    /// A configured base URL could not be parsed.
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    /// Downloads were requested without a publisher client token.
    #[error("publisher client token is not configured")]
    MissingToken,
}

impl AcquisitionError {
    /// Classify a reqwest failure as transient or permanent.
    pub(crate) fn from_reqwest(error: reqwest::Error) -> Self {
        if error.is_timeout() || error.is_connect() || error.is_body() || error.is_request() {
            Self::Transient(error)
        } else {
            Self::Http(error)
        }
    }

    /// Whether a caller-level retry with backoff is reasonable.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Remote status code, when the failure carries one.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Rejected { status, .. } => Some(*status),
            Self::Transient(err) | Self::Http(err) => err.status(),
            _ => None,
        }
    }
}

/// Source of candidate articles and their raw bytes.
#[async_trait]
pub trait ArticleSource: Send + Sync {
    /// Keyword search capped at `limit` results, in service order.
    async fn search(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<CandidateRecord>, AcquisitionError>;

    /// Stream the article bytes for `id`.
    async fn fetch(&self, id: &str) -> Result<ByteStream, AcquisitionError>;

    /// Wait until the rate-limited endpoint may be called again.
    async fn settle(&self) {}
}

/// Search service plus publisher download client behind one [`ArticleSource`].
pub struct SourceAcquirer {
    search: SearchClient,
    publisher: PublisherClient,
}

impl SourceAcquirer {
    /// Compose explicit clients.
    pub fn new(search: SearchClient, publisher: PublisherClient) -> Self {
        Self { search, publisher }
    }

    /// Build both clients from configuration. Fails when the publisher token is missing.
    pub fn from_config(config: &Config) -> Result<Self, AcquisitionError> {
        Ok(Self::new(
            SearchClient::new(&config.search)?,
            PublisherClient::new(&config.publisher)?,
        ))
    }
}

#[async_trait]
impl ArticleSource for SourceAcquirer {
    async fn search(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<CandidateRecord>, AcquisitionError> {
        self.search.search(query, limit).await
    }

    async fn fetch(&self, id: &str) -> Result<ByteStream, AcquisitionError> {
        self.publisher.fetch(id).await
    }

    async fn settle(&self) {
        self.publisher.settle().await;
    }
}

pub(crate) fn normalize_base_url(url: &str) -> Result<String, AcquisitionError> {
    let parsed =
        reqwest::Url::parse(url).map_err(|err| AcquisitionError::InvalidUrl(err.to_string()))?;
    Ok(parsed.as_str().trim_end_matches('/').to_string())
}

pub(crate) async fn rejection(response: reqwest::Response) -> AcquisitionError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    AcquisitionError::Rejected { status, body }
}
