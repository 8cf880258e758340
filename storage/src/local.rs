use std::io::SeekFrom;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

use storage_driver::{BackendState, Digest, Driver, Metadata, Reader, StorageError, Writer};

const ENGINE: &str = "local";
const PATH: &str = "path";

/// Sidecar stored next to each finalized blob.
#[derive(Debug, Serialize, Deserialize)]
struct BlobSidecar {
    content_type: String,
}

/// Storage driver backed by two local directories: one for in-progress
/// uploads and one for finalized blobs.
///
/// Finalization is a `rename`, so both directories must live on the same
/// filesystem.
#[derive(Debug, Clone)]
pub struct LocalDriver {
    persistent: Utf8PathBuf,
    temporary: Utf8PathBuf,
}

impl LocalDriver {
    /// Create a driver storing blobs under `persistent` and uploads under `temporary`.
    pub fn new(persistent: Utf8PathBuf, temporary: Utf8PathBuf) -> Self {
        Self {
            persistent,
            temporary,
        }
    }

    /// Root directory for finalized blobs.
    pub fn persistent(&self) -> &Utf8Path {
        &self.persistent
    }

    /// Root directory for in-progress uploads.
    pub fn temporary(&self) -> &Utf8Path {
        &self.temporary
    }

    fn blob_path(&self, digest: &Digest) -> Utf8PathBuf {
        self.persistent.join(digest.blob_path())
    }

    fn sidecar_path(&self, digest: &Digest) -> Utf8PathBuf {
        self.blob_path(digest).with_extension("json")
    }

    fn upload_path(&self, id: &str) -> Result<Utf8PathBuf, StorageError> {
        let plain = !id.is_empty()
            && id
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
        if !plain {
            return Err(StorageError::invalid(ENGINE, "upload id is not a plain file name")
                .upload(id)
                .build());
        }
        Ok(self.temporary.join(id))
    }

    async fn content_type(&self, digest: &Digest) -> String {
        let sidecar = match tokio::fs::read(self.sidecar_path(digest)).await {
            Ok(raw) => serde_json::from_slice::<BlobSidecar>(&raw).ok(),
            Err(_) => None,
        };

        match sidecar {
            Some(sidecar) => sidecar.content_type,
            None => {
                tracing::debug!(%digest, "no readable sidecar, using default content type");
                storage_driver::DEFAULT_CONTENT_TYPE.to_owned()
            }
        }
    }
}

fn io_err(context: &'static str) -> impl FnOnce(std::io::Error) -> StorageError {
    move |err| StorageError::io(ENGINE, err).context(context).build()
}

fn created(metadata: &std::fs::Metadata) -> DateTime<Utc> {
    metadata
        .created()
        .or_else(|_| metadata.modified())
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now())
}

#[async_trait::async_trait]
impl Driver for LocalDriver {
    fn name(&self) -> &'static str {
        ENGINE
    }

    async fn initiate_upload(
        &self,
        id: &str,
        content_type: Option<&str>,
    ) -> Result<BackendState, StorageError> {
        let path = self.upload_path(id)?;

        tokio::fs::create_dir_all(&self.temporary)
            .await
            .map_err(io_err("create temporary directory"))?;

        tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(|err| {
                StorageError::io(ENGINE, err)
                    .upload(id)
                    .context("create upload target")
                    .build()
            })?;

        let mut state = BackendState::new().with(PATH, path.as_str());
        state.set_size(0);
        state.set_content_type(content_type);
        Ok(state)
    }

    async fn upload_add_chunk(
        &self,
        state: &BackendState,
        reader: &mut Reader<'_>,
    ) -> Result<BackendState, StorageError> {
        let path = Utf8Path::new(state.require(ENGINE, PATH)?);
        let size = state.size(ENGINE)?;

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(path)
            .await
            .map_err(io_err("open upload target"))?;

        // Drop anything past the committed size before appending.
        file.set_len(size)
            .await
            .map_err(io_err("truncate upload target"))?;
        file.seek(SeekFrom::Start(size))
            .await
            .map_err(io_err("seek upload target"))?;

        let mut writer = tokio::io::BufWriter::new(file);
        let appended = tokio::io::copy(reader, &mut writer)
            .await
            .map_err(io_err("append chunk"))?;
        writer.flush().await.map_err(io_err("flush chunk"))?;
        writer
            .into_inner()
            .sync_data()
            .await
            .map_err(io_err("sync upload target"))?;

        tracing::trace!(%path, appended, "appended chunk");

        let mut next = state.clone();
        next.set_size(size + appended);
        Ok(next)
    }

    async fn complete_upload(
        &self,
        digest: &Digest,
        state: &BackendState,
    ) -> Result<(), StorageError> {
        let path = Utf8Path::new(state.require(ENGINE, PATH)?);
        let size = state.size(ENGINE)?;
        let target = self.blob_path(digest);

        if tokio::fs::try_exists(&target)
            .await
            .map_err(io_err("check for existing blob"))?
        {
            tracing::debug!(%digest, "blob already finalized");
            match tokio::fs::remove_file(path).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(io_err("remove redundant upload target")(err)),
            }
            return Ok(());
        }

        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(path)
            .await
            .map_err(|err| {
                StorageError::io(ENGINE, err)
                    .digest(digest)
                    .context("open upload target")
                    .build()
            })?;
        let length = file
            .metadata()
            .await
            .map_err(io_err("stat upload target"))?
            .len();
        if length < size {
            return Err(StorageError::invalid(
                ENGINE,
                format!("upload target holds {length} bytes, expected {size}"),
            )
            .digest(digest)
            .build());
        }
        file.set_len(size)
            .await
            .map_err(io_err("truncate upload target"))?;
        file.sync_all().await.map_err(io_err("sync upload target"))?;
        drop(file);

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(io_err("create blob directory"))?;
        }

        let sidecar = serde_json::to_vec(&BlobSidecar {
            content_type: state.content_type().to_owned(),
        })
        .map_err(StorageError::with(
            ENGINE,
            storage_driver::StorageErrorKind::SerializationError,
        ))?;
        tokio::fs::write(self.sidecar_path(digest), sidecar)
            .await
            .map_err(io_err("write blob sidecar"))?;

        // The blob becomes visible here and only here.
        tokio::fs::rename(path, &target).await.map_err(|err| {
            StorageError::io(ENGINE, err)
                .digest(digest)
                .context("rename upload target into place")
                .build()
        })?;

        Ok(())
    }

    async fn abort_upload(&self, state: &BackendState) -> Result<(), StorageError> {
        let path = state.require(ENGINE, PATH)?;
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(io_err("remove upload target")(err)),
        }
    }

    async fn metadata(&self, digest: &Digest) -> Result<Metadata, StorageError> {
        let metadata = tokio::fs::metadata(self.blob_path(digest))
            .await
            .map_err(|err| StorageError::io(ENGINE, err).digest(digest).build())?;

        Ok(Metadata {
            size: metadata.len(),
            created: created(&metadata),
            content_type: self.content_type(digest).await,
        })
    }

    async fn delete_blob(&self, digest: &Digest) -> Result<(), StorageError> {
        tokio::fs::remove_file(self.blob_path(digest))
            .await
            .map_err(|err| StorageError::io(ENGINE, err).digest(digest).build())?;

        match tokio::fs::remove_file(self.sidecar_path(digest)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(io_err("remove blob sidecar")(err)),
        }
    }

    async fn download_blob(
        &self,
        digest: &Digest,
        writer: &mut Writer<'_>,
    ) -> Result<Metadata, StorageError> {
        let file = tokio::fs::File::open(self.blob_path(digest))
            .await
            .map_err(|err| StorageError::io(ENGINE, err).digest(digest).build())?;
        let stat = file.metadata().await.map_err(io_err("stat blob"))?;

        let mut reader = tokio::io::BufReader::new(file);
        tokio::io::copy(&mut reader, writer)
            .await
            .map_err(io_err("copy blob"))?;
        writer.flush().await.map_err(io_err("flush writer"))?;

        Ok(Metadata {
            size: stat.len(),
            created: created(&stat),
            content_type: self.content_type(digest).await,
        })
    }

    async fn purge_uploads(&self, older_than: DateTime<Utc>) -> Result<usize, StorageError> {
        let mut entries = match tokio::fs::read_dir(&self.temporary).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(io_err("list temporary directory")(err)),
        };

        let mut purged = 0;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(io_err("list temporary directory"))?
        {
            let metadata = entry
                .metadata()
                .await
                .map_err(io_err("stat upload target"))?;
            if !metadata.is_file() {
                continue;
            }

            let modified = metadata
                .modified()
                .map(DateTime::<Utc>::from)
                .map_err(io_err("upload target mtime"))?;
            if modified < older_than {
                tracing::debug!(path = ?entry.path(), %modified, "purging stale upload target");
                match tokio::fs::remove_file(entry.path()).await {
                    Ok(()) => purged += 1,
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => return Err(io_err("remove stale upload target")(err)),
                }
            }
        }

        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn driver(dir: &tempfile::TempDir) -> LocalDriver {
        let root = Utf8Path::from_path(dir.path()).unwrap();
        LocalDriver::new(root.join("blobs"), root.join("uploads"))
    }

    fn digest_of(data: &[u8]) -> Digest {
        use sha2::Digest as _;
        Digest::sha256(sha2::Sha256::digest(data).into())
    }

    #[tokio::test]
    async fn upload_layout() {
        let dir = tempfile::tempdir().unwrap();
        let driver = driver(&dir);

        let state = driver
            .initiate_upload("abc-123", Some("application/vnd.oci.image.config.v1+json"))
            .await
            .unwrap();
        assert!(driver.temporary().join("abc-123").is_file());

        let mut reader: &[u8] = b"{}";
        let state = driver.upload_add_chunk(&state, &mut reader).await.unwrap();

        let digest = digest_of(b"{}");
        driver.complete_upload(&digest, &state).await.unwrap();

        assert!(!driver.temporary().join("abc-123").exists());
        let blob = driver.persistent().join(digest.blob_path());
        assert_eq!(std::fs::read(&blob).unwrap(), b"{}");

        let metadata = driver.metadata(&digest).await.unwrap();
        assert_eq!(metadata.size, 2);
        assert_eq!(
            metadata.content_type,
            "application/vnd.oci.image.config.v1+json"
        );
    }

    #[tokio::test]
    async fn rejects_path_like_upload_ids() {
        let dir = tempfile::tempdir().unwrap();
        let driver = driver(&dir);

        for id in ["", "../escape", "a/b", "."] {
            let err = driver.initiate_upload(id, None).await.unwrap_err();
            assert_eq!(
                err.kind(),
                storage_driver::StorageErrorKind::InvalidRequest,
                "{id:?}"
            );
        }
    }

    #[tokio::test]
    async fn stray_bytes_are_truncated_before_append() {
        let dir = tempfile::tempdir().unwrap();
        let driver = driver(&dir);

        let state = driver.initiate_upload("u", None).await.unwrap();
        let mut stray: &[u8] = b"not committed";
        driver.upload_add_chunk(&state, &mut stray).await.unwrap();

        let mut reader: &[u8] = b"kept";
        let state = driver.upload_add_chunk(&state, &mut reader).await.unwrap();
        assert_eq!(state.size(ENGINE).unwrap(), 4);

        let digest = digest_of(b"kept");
        driver.complete_upload(&digest, &state).await.unwrap();

        let mut out = Vec::new();
        driver.download_blob(&digest, &mut out).await.unwrap();
        assert_eq!(out, b"kept");
    }

    #[tokio::test]
    async fn purge_removes_old_targets() {
        let dir = tempfile::tempdir().unwrap();
        let driver = driver(&dir);

        driver.initiate_upload("stale", None).await.unwrap();
        let hour = chrono::TimeDelta::hours(1);
        assert_eq!(driver.purge_uploads(Utc::now() - hour).await.unwrap(), 0);
        assert_eq!(driver.purge_uploads(Utc::now() + hour).await.unwrap(), 1);
        assert!(!driver.temporary().join("stale").exists());
    }
}
