use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{ArticleMetadata, InsertOutcome, MetadataError, MetadataStore, within_dates};

/// JSON master-list file mapping article identifier → record.
///
/// The list is an explicit repository object: [`load`](Self::load) reads the file into
/// memory and [`flush`](MetadataStore::flush) writes it back atomically. Every successful
/// insert flushes before returning so a record is durable once acknowledged.
pub struct JsonMetadataStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, ArticleMetadata>>,
}

impl JsonMetadataStore {
    /// Create an empty repository bound to `path`. Nothing is read until [`load`](Self::load).
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// Replace in-memory state with the file contents; a missing file yields an empty list.
    pub async fn load(&self) -> Result<(), MetadataError> {
        let loaded = match tokio::fs::read(&self.path).await {
            Ok(data) => serde_json::from_slice(&data)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => return Err(err.into()),
        };
        let count = loaded.len();
        *self.entries.lock().await = loaded;
        tracing::debug!(path = %self.path.display(), articles = count, "Loaded master list");
        Ok(())
    }

    fn path(&self) -> &Path {
        &self.path
    }

    async fn write_file(
        &self,
        entries: &BTreeMap<String, ArticleMetadata>,
    ) -> Result<(), MetadataError> {
        let path = self.path();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let data = serde_json::to_vec_pretty(entries)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn filtered(
        &self,
        keep: impl Fn(&ArticleMetadata) -> bool,
    ) -> Vec<ArticleMetadata> {
        self.entries
            .lock()
            .await
            .values()
            .filter(|article| keep(article))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl MetadataStore for JsonMetadataStore {
    async fn init_schema(&self) -> Result<(), MetadataError> {
        self.load().await
    }

    async fn insert_if_absent(
        &self,
        record: &ArticleMetadata,
    ) -> Result<InsertOutcome, MetadataError> {
        let mut entries = self.entries.lock().await;
        if entries.contains_key(&record.id) {
            tracing::info!(doi = %record.id, "Duplicate ignored");
            return Ok(InsertOutcome::AlreadyExists);
        }
        entries.insert(record.id.clone(), record.clone());
        if let Err(err) = self.write_file(&entries).await {
            entries.remove(&record.id);
            return Err(err);
        }
        tracing::debug!(doi = %record.id, "Article recorded");
        Ok(InsertOutcome::Inserted)
    }

    async fn contains(&self, id: &str) -> Result<bool, MetadataError> {
        Ok(self.entries.lock().await.contains_key(id))
    }

    async fn find_by_title_substring(
        &self,
        text: &str,
    ) -> Result<Vec<ArticleMetadata>, MetadataError> {
        let needle = text.to_lowercase();
        Ok(self
            .filtered(|article| article.title.to_lowercase().contains(&needle))
            .await)
    }

    async fn find_by_date_range(
        &self,
        start: Option<&str>,
        end: Option<&str>,
    ) -> Result<Vec<ArticleMetadata>, MetadataError> {
        Ok(self
            .filtered(|article| within_dates(&article.publication_date, start, end))
            .await)
    }

    async fn list_all(&self) -> Result<Vec<ArticleMetadata>, MetadataError> {
        Ok(self.filtered(|_| true).await)
    }

    async fn flush(&self) -> Result<(), MetadataError> {
        let entries = self.entries.lock().await;
        self.write_file(&entries).await
    }
}
