use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use super::{ArchiveError, BlobStore, StoredBlob, validate_name};
use crate::acquisition::ByteStream;

const STAGING_DIR: &str = ".staging";
/// Staged files untouched for this long belong to an interrupted writer.
pub const STAGING_TTL: Duration = Duration::from_secs(15 * 60);

/// Directory-backed blob archive.
///
/// Writes land in a staging directory on the same filesystem, are synced, and are then
/// renamed into place, so a blob name is visible only once its full content is on disk.
pub struct FsBlobArchive {
    root: PathBuf,
}

impl FsBlobArchive {
    /// Open (creating if needed) an archive rooted at `root` and discard staging files older
    /// than [`STAGING_TTL`]. Younger ones may belong to a writer in another process.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, ArchiveError> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        let archive = Self { root };
        archive.purge_staging().await?;
        tracing::debug!(root = %archive.root.display(), "Opened blob archive");
        Ok(archive)
    }

    /// Root directory holding committed blobs.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, name: &str) -> Result<PathBuf, ArchiveError> {
        validate_name(name)?;
        Ok(self.root.join(name))
    }

    fn staging_dir(&self) -> PathBuf {
        self.root.join(STAGING_DIR)
    }

    async fn purge_staging(&self) -> Result<(), ArchiveError> {
        let mut entries = match fs::read_dir(self.staging_dir()).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        let now = SystemTime::now();
        let mut purged = 0usize;
        while let Some(entry) = entries.next_entry().await? {
            let meta = entry.metadata().await?;
            if !meta.is_file() {
                continue;
            }
            // Clock skew (mtime in the future) counts as fresh.
            let age = now
                .duration_since(meta.modified()?)
                .unwrap_or(Duration::ZERO);
            if age < STAGING_TTL {
                continue;
            }
            match fs::remove_file(entry.path()).await {
                Ok(()) => purged += 1,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        if purged > 0 {
            tracing::info!(root = %self.root.display(), purged, "Discarded interrupted uploads");
        }
        Ok(())
    }

    async fn write_staged(
        &self,
        staged: &Path,
        mut source: ByteStream,
    ) -> Result<(u64, String), ArchiveError> {
        let mut file = fs::File::create(staged).await?;
        let mut hasher = Sha256::new();
        let mut size = 0u64;
        while let Some(chunk) = source.next().await {
            let chunk = chunk?;
            hasher.update(&chunk);
            file.write_all(&chunk).await?;
            size += chunk.len() as u64;
        }
        file.flush().await?;
        file.sync_all().await?;
        Ok((size, hex::encode(hasher.finalize())))
    }
}

#[async_trait]
impl BlobStore for FsBlobArchive {
    async fn exists(&self, name: &str) -> Result<bool, ArchiveError> {
        let path = self.blob_path(name)?;
        match fs::metadata(&path).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn put_stream(&self, name: &str, source: ByteStream) -> Result<StoredBlob, ArchiveError> {
        let target = self.blob_path(name)?;
        let staging = self.staging_dir();
        fs::create_dir_all(&staging).await?;
        let staged = staging.join(format!("{}.partial", Uuid::new_v4().simple()));

        let committed = match self.write_staged(&staged, source).await {
            Ok(written) => fs::rename(&staged, &target)
                .await
                .map(|()| written)
                .map_err(ArchiveError::from),
            Err(err) => Err(err),
        };

        match committed {
            Ok((size, sha256)) => {
                tracing::info!(blob = name, size, "Blob committed");
                Ok(StoredBlob {
                    name: name.to_string(),
                    size,
                    sha256,
                })
            }
            Err(err) => {
                if let Err(cleanup) = fs::remove_file(&staged).await
                    && cleanup.kind() != std::io::ErrorKind::NotFound
                {
                    tracing::warn!(blob = name, error = %cleanup, "Failed to remove staged upload");
                }
                tracing::warn!(blob = name, error = %err, "Blob upload aborted");
                Err(err)
            }
        }
    }

    async fn get(&self, name: &str) -> Result<Vec<u8>, ArchiveError> {
        let path = self.blob_path(name)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(ArchiveError::NotFound(name.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, ArchiveError> {
        let mut entries = fs::read_dir(&self.root).await?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str()
                && name.starts_with(prefix)
            {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    async fn delete(&self, name: &str) -> Result<(), ArchiveError> {
        let path = self.blob_path(name)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                tracing::debug!(blob = name, "Blob deleted");
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::AcquisitionError;
    use crate::archive::blob_name_for;
    use bytes::Bytes;
    use futures_util::stream;

    fn source(parts: Vec<Result<&'static str, AcquisitionError>>) -> ByteStream {
        Box::pin(stream::iter(
            parts
                .into_iter()
                .map(|part| part.map(|text| Bytes::from_static(text.as_bytes()))),
        ))
    }

    fn interrupted() -> AcquisitionError {
        AcquisitionError::MalformedRecord("stream cut".into())
    }

    #[tokio::test]
    async fn put_get_list_delete_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let archive = FsBlobArchive::open(dir.path()).await.unwrap();
        let name = blob_name_for("10.1002/smll.1");

        assert!(!archive.exists(&name).await.unwrap());
        let stored = archive
            .put_stream(&name, source(vec![Ok("%PDF-"), Ok("1.7")]))
            .await
            .unwrap();
        assert_eq!(stored.size, 8);
        assert_eq!(stored.sha256, hex::encode(Sha256::digest(b"%PDF-1.7")));

        assert!(archive.exists(&name).await.unwrap());
        assert_eq!(archive.get(&name).await.unwrap(), b"%PDF-1.7");
        assert_eq!(archive.list("10.1002").await.unwrap(), vec![name.clone()]);
        assert!(archive.list("zzz").await.unwrap().is_empty());

        archive.delete(&name).await.unwrap();
        archive.delete(&name).await.unwrap();
        assert!(!archive.exists(&name).await.unwrap());
        assert!(matches!(
            archive.get(&name).await,
            Err(ArchiveError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn interrupted_stream_leaves_nothing_visible() {
        let dir = tempfile::tempdir().unwrap();
        let archive = FsBlobArchive::open(dir.path()).await.unwrap();
        let name = blob_name_for("10.1/broken");

        let result = archive
            .put_stream(&name, source(vec![Ok("partial"), Err(interrupted())]))
            .await;
        assert!(matches!(result, Err(ArchiveError::Source(_))));
        assert!(!archive.exists(&name).await.unwrap());
        assert!(archive.list("").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_overwrite_keeps_previous_content() {
        let dir = tempfile::tempdir().unwrap();
        let archive = FsBlobArchive::open(dir.path()).await.unwrap();
        let name = blob_name_for("10.1/keep");
        archive
            .put_stream(&name, source(vec![Ok("complete")]))
            .await
            .unwrap();

        let _ = archive
            .put_stream(&name, source(vec![Ok("trunc"), Err(interrupted())]))
            .await;
        assert_eq!(archive.get(&name).await.unwrap(), b"complete");
    }

    #[tokio::test]
    async fn reopening_purges_only_stale_staging_files() {
        let dir = tempfile::tempdir().unwrap();
        let staging = dir.path().join(STAGING_DIR);
        std::fs::create_dir_all(&staging).unwrap();
        let stale = staging.join("abandoned.partial");
        let in_flight = staging.join("writing.partial");
        std::fs::write(&stale, b"junk").unwrap();
        std::fs::write(&in_flight, b"half").unwrap();
        std::fs::File::options()
            .write(true)
            .open(&stale)
            .unwrap()
            .set_modified(SystemTime::now() - STAGING_TTL - Duration::from_secs(60))
            .unwrap();

        let archive = FsBlobArchive::open(dir.path()).await.unwrap();
        assert!(!stale.exists());
        assert!(in_flight.exists());
        assert!(archive.list("").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn second_archive_on_the_same_root_leaves_an_upload_in_flight_alone() {
        let dir = tempfile::tempdir().unwrap();
        let writer = FsBlobArchive::open(dir.path()).await.unwrap();
        let name = blob_name_for("10.1/concurrent");
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<Result<Bytes, AcquisitionError>>();
        tx.send(Ok(Bytes::from_static(b"%PDF-"))).unwrap();
        let body: ByteStream = Box::pin(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        }));

        let upload = tokio::spawn(async move { writer.put_stream(&name, body).await });
        // Wait for the staged file to appear before a second process opens the root.
        let staging = dir.path().join(STAGING_DIR);
        loop {
            if let Ok(mut entries) = std::fs::read_dir(&staging)
                && entries.next().is_some()
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let _other = FsBlobArchive::open(dir.path()).await.unwrap();

        tx.send(Ok(Bytes::from_static(b"1.7"))).unwrap();
        drop(tx);
        let stored = upload.await.unwrap().unwrap();
        assert_eq!(stored.size, 8);
    }

    #[tokio::test]
    async fn unsafe_names_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let archive = FsBlobArchive::open(dir.path()).await.unwrap();
        assert!(matches!(
            archive.exists("../escape.pdf").await,
            Err(ArchiveError::InvalidName(_))
        ));
    }
}
