use std::path::Path;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

use super::{ArticleMetadata, InsertOutcome, MetadataError, MetadataStore};

const SELECT_COLUMNS: &str = "SELECT id, title, url, container_title, publication_date FROM articles";

/// SQLite-backed article ledger with one `articles` table.
pub struct SqliteMetadataStore {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct ArticleRow {
    id: String,
    title: String,
    url: String,
    container_title: String,
    publication_date: String,
}

impl From<ArticleRow> for ArticleMetadata {
    fn from(r: ArticleRow) -> Self {
        Self {
            id: r.id,
            title: r.title,
            url: r.url,
            container_title: r.container_title,
            publication_date: r.publication_date,
        }
    }
}

impl SqliteMetadataStore {
    /// Wrap an existing pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if missing) the database file at `path`.
    pub async fn open(path: &Path) -> Result<Self, MetadataError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        tracing::debug!(path = %path.display(), "Opened metadata database");
        Ok(Self::new(pool))
    }

    /// Single-connection in-memory database, mostly useful for tests.
    pub async fn in_memory() -> Result<Self, MetadataError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Ok(Self::new(pool))
    }
}

#[async_trait]
impl MetadataStore for SqliteMetadataStore {
    async fn init_schema(&self) -> Result<(), MetadataError> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS articles (
                id               TEXT PRIMARY KEY,
                title            TEXT NOT NULL,
                url              TEXT NOT NULL,
                container_title  TEXT NOT NULL DEFAULT '',
                publication_date TEXT NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_if_absent(
        &self,
        record: &ArticleMetadata,
    ) -> Result<InsertOutcome, MetadataError> {
        let result = sqlx::query(
            r#"INSERT INTO articles (id, title, url, container_title, publication_date)
               VALUES (?, ?, ?, ?, ?)
               ON CONFLICT(id) DO NOTHING"#,
        )
        .bind(&record.id)
        .bind(&record.title)
        .bind(&record.url)
        .bind(&record.container_title)
        .bind(&record.publication_date)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            tracing::info!(doi = %record.id, "Duplicate ignored");
            Ok(InsertOutcome::AlreadyExists)
        } else {
            tracing::debug!(doi = %record.id, "Article recorded");
            Ok(InsertOutcome::Inserted)
        }
    }

    async fn contains(&self, id: &str) -> Result<bool, MetadataError> {
        let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM articles WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    async fn find_by_title_substring(
        &self,
        text: &str,
    ) -> Result<Vec<ArticleMetadata>, MetadataError> {
        // SQLite's LOWER() only folds ASCII, so matching happens here.
        let needle = text.to_lowercase();
        let sql = format!("{SELECT_COLUMNS} ORDER BY id");
        let rows = sqlx::query_as::<_, ArticleRow>(&sql)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .filter(|row| row.title.to_lowercase().contains(&needle))
            .map(Into::into)
            .collect())
    }

    async fn find_by_date_range(
        &self,
        start: Option<&str>,
        end: Option<&str>,
    ) -> Result<Vec<ArticleMetadata>, MetadataError> {
        let sql = format!(
            "{SELECT_COLUMNS} WHERE (?1 IS NULL OR publication_date >= ?1) \
             AND (?2 IS NULL OR publication_date <= ?2) ORDER BY id"
        );
        let rows = sqlx::query_as::<_, ArticleRow>(&sql)
            .bind(start)
            .bind(end)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn list_all(&self) -> Result<Vec<ArticleMetadata>, MetadataError> {
        let sql = format!("{SELECT_COLUMNS} ORDER BY id");
        let rows = sqlx::query_as::<_, ArticleRow>(&sql)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }
}
