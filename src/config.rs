use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::index::IngestionMode;

/// Errors encountered while loading configuration from environment variables.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Required environment variable was not provided.
    #[error("Missing environment variable: {0}")]
    MissingVariable(String),
    /// Environment variable contained a value that could not be parsed.
    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
}

/// Runtime configuration for the acquisition and indexing pipeline.
#[derive(Debug, Clone)]
pub struct Config {
    /// Bibliographic search endpoint settings.
    pub search: SearchConfig,
    /// Publisher download endpoint settings.
    pub publisher: PublisherConfig,
    /// Directory holding archived article blobs.
    pub archive_dir: PathBuf,
    /// Which metadata backend records processed articles.
    pub metadata_backend: MetadataBackend,
    /// Location of the metadata database or master-list file.
    pub metadata_path: PathBuf,
    /// Base URL of the Qdrant instance that stores embeddings.
    pub qdrant_url: String,
    /// Name of the Qdrant collection used as the chunk table.
    pub qdrant_collection_name: String,
    /// Optional API key required to access Qdrant.
    pub qdrant_api_key: Option<String>,
    /// Embedding provider used to generate vector representations.
    pub embedding_provider: EmbeddingProvider,
    /// Embedding model identifier passed to the provider.
    pub embedding_model: String,
    /// Dimensionality of the produced vectors.
    pub embedding_dimension: usize,
    /// API key for the OpenAI embeddings endpoint.
    pub openai_api_key: Option<String>,
    /// Base URL of the OpenAI-compatible embeddings API.
    pub openai_base_url: String,
    /// Optional override for the per-chunk token budget.
    pub chunk_max_tokens: Option<usize>,
    /// Whether adjacent peer items are merged into one chunk.
    pub chunk_merge_peers: bool,
    /// Default index ingestion mode for pipeline runs.
    pub ingestion_mode: IngestionMode,
}

/// Settings for the bibliographic search service.
#[derive(Debug, Clone)]
pub struct SearchConfig {
    /// Base URL of the works API (without the `/works` suffix).
    pub base_url: String,
    /// Facet filter sent verbatim as the `filter` parameter.
    pub filter: String,
    /// Opt into random sampling instead of deterministic, sorted results.
    pub sample: bool,
    /// User agent sent with every search request.
    pub user_agent: String,
}

/// Settings for the publisher download endpoint.
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Base URL; articles are fetched from `{base_url}/articles/{id}`.
    pub base_url: String,
    /// Client token attached to each download request.
    pub token: Option<String>,
    /// Header name carrying the client token.
    pub token_header: String,
    /// Mandatory pause between successive downloads.
    pub cooldown: Duration,
    /// Per-request timeout.
    pub timeout: Duration,
}

/// Supported embedding backends for the indexing stage.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProvider {
    /// Deterministic offline hashing embedder.
    Hashing,
    /// Hosted OpenAI embeddings API.
    OpenAI,
}

/// Persistent store used for the article ledger.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MetadataBackend {
    /// Single-table SQLite database.
    Sqlite,
    /// JSON master-list file keyed by article identifier.
    Json,
}

const DEFAULT_SEARCH_URL: &str = "https://api.crossref.org";
const DEFAULT_SEARCH_FILTER: &str = "member:311,type:journal-article";
const DEFAULT_PUBLISHER_URL: &str = "https://api.wiley.com/onlinelibrary/tdm/v1";
const DEFAULT_TOKEN_HEADER: &str = "Wiley-TDM-Client-Token";
const DEFAULT_COOLDOWN_SECS: u64 = 10;
const DEFAULT_TIMEOUT_SECS: u64 = 120;

impl Config {
    /// Load configuration from environment variables, performing validation along the way.
    pub fn from_env() -> Result<Self, ConfigError> {
        let metadata_backend = match load_env_optional("METADATA_BACKEND") {
            Some(value) => value
                .parse()
                .map_err(|()| ConfigError::InvalidValue("METADATA_BACKEND".into()))?,
            None => MetadataBackend::Sqlite,
        };
        let default_metadata_path = match metadata_backend {
            MetadataBackend::Sqlite => "data/articles_metadata.db",
            MetadataBackend::Json => "data/master_articles.json",
        };

        Ok(Self {
            search: SearchConfig {
                base_url: load_env_or("SEARCH_BASE_URL", DEFAULT_SEARCH_URL),
                filter: load_env_or("SEARCH_FILTER", DEFAULT_SEARCH_FILTER),
                sample: parse_optional("SEARCH_SAMPLE", parse_bool)?.unwrap_or(false),
                user_agent: load_env_or("SEARCH_USER_AGENT", "paperhoard/0.1"),
            },
            publisher: PublisherConfig {
                base_url: load_env_or("PUBLISHER_BASE_URL", DEFAULT_PUBLISHER_URL),
                token: load_env_optional("TDM_API_TOKEN"),
                token_header: load_env_or("PUBLISHER_TOKEN_HEADER", DEFAULT_TOKEN_HEADER),
                cooldown: Duration::from_secs(
                    parse_optional("FETCH_COOLDOWN_SECS", |v| v.parse().ok())?
                        .unwrap_or(DEFAULT_COOLDOWN_SECS),
                ),
                timeout: Duration::from_secs(
                    parse_optional("FETCH_TIMEOUT_SECS", |v| v.parse().ok())?
                        .unwrap_or(DEFAULT_TIMEOUT_SECS),
                ),
            },
            archive_dir: PathBuf::from(load_env_or("ARCHIVE_DIR", "data/articles")),
            metadata_backend,
            metadata_path: PathBuf::from(load_env_or("METADATA_PATH", default_metadata_path)),
            qdrant_url: load_env("QDRANT_URL")?,
            qdrant_collection_name: load_env_or("QDRANT_COLLECTION_NAME", "articles"),
            qdrant_api_key: load_env_optional("QDRANT_API_KEY"),
            embedding_provider: match load_env_optional("EMBEDDING_PROVIDER") {
                Some(value) => value
                    .parse()
                    .map_err(|()| ConfigError::InvalidValue("EMBEDDING_PROVIDER".into()))?,
                None => EmbeddingProvider::Hashing,
            },
            embedding_model: load_env_or("EMBEDDING_MODEL", "text-embedding-3-large"),
            embedding_dimension: load_env("EMBEDDING_DIMENSION")?
                .parse()
                .map_err(|_| ConfigError::InvalidValue("EMBEDDING_DIMENSION".into()))?,
            openai_api_key: load_env_optional("OPENAI_API_KEY"),
            openai_base_url: load_env_or("OPENAI_BASE_URL", "https://api.openai.com/v1"),
            chunk_max_tokens: parse_optional("CHUNK_MAX_TOKENS", |v| v.parse().ok())?,
            chunk_merge_peers: parse_optional("CHUNK_MERGE_PEERS", parse_bool)?.unwrap_or(true),
            ingestion_mode: match load_env_optional("INGESTION_MODE") {
                Some(value) => value
                    .parse()
                    .map_err(|()| ConfigError::InvalidValue("INGESTION_MODE".into()))?,
                None => IngestionMode::Append,
            },
        })
    }
}

fn load_env(key: &str) -> Result<String, ConfigError> {
    env::var(key).map_err(|_| ConfigError::MissingVariable(key.to_string()))
}

fn load_env_optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn load_env_or(key: &str, default: &str) -> String {
    load_env_optional(key).unwrap_or_else(|| default.to_string())
}

fn parse_optional<T>(
    key: &str,
    parse: impl Fn(&str) -> Option<T>,
) -> Result<Option<T>, ConfigError> {
    load_env_optional(key)
        .map(|value| parse(value.trim()).ok_or_else(|| ConfigError::InvalidValue(key.into())))
        .transpose()
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl std::str::FromStr for EmbeddingProvider {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hashing" => Ok(Self::Hashing),
            "openai" => Ok(Self::OpenAI),
            _ => Err(()),
        }
    }
}

impl std::str::FromStr for MetadataBackend {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sqlite" => Ok(Self::Sqlite),
            "json" => Ok(Self::Json),
            _ => Err(()),
        }
    }
}

/// Load `.env` (if present) and build the configuration.
pub fn load_config() -> Result<Config, ConfigError> {
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;
    tracing::debug!(
        qdrant_url = %config.qdrant_url,
        collection = %config.qdrant_collection_name,
        embedding_provider = ?config.embedding_provider,
        metadata_backend = ?config.metadata_backend,
        cooldown_secs = config.publisher.cooldown.as_secs(),
        "Loaded configuration"
    );
    Ok(config)
}
