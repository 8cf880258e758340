use std::io;

use camino::Utf8Path;
use chrono::{DateTime, Utc};
use tempfile::TempDir;

use crate::local::LocalDriver;
use storage_driver::{BackendState, Digest, Driver, Metadata, Reader, StorageError, Writer};

/// A storage driver that keeps uploads and blobs in a temporary directory,
/// removed when the driver is dropped.
#[derive(Debug)]
pub struct TempDriver {
    #[allow(unused)]
    dir: TempDir,
    driver: LocalDriver,
}

impl TempDriver {
    /// Create a new `TempDriver` instance in a fresh temporary directory.
    pub fn new() -> io::Result<Self> {
        let tmp = TempDir::new()?;
        let root = Utf8Path::from_path(tmp.path())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "non utf-8 temp dir"))?
            .to_owned();

        Ok(Self {
            dir: tmp,
            driver: LocalDriver::new(root.clone(), root.join("uploads")),
        })
    }
}

#[async_trait::async_trait]
impl Driver for TempDriver {
    fn name(&self) -> &'static str {
        "temp"
    }

    async fn initiate_upload(
        &self,
        id: &str,
        content_type: Option<&str>,
    ) -> Result<BackendState, StorageError> {
        self.driver.initiate_upload(id, content_type).await
    }

    async fn upload_add_chunk(
        &self,
        state: &BackendState,
        reader: &mut Reader<'_>,
    ) -> Result<BackendState, StorageError> {
        self.driver.upload_add_chunk(state, reader).await
    }

    async fn complete_upload(
        &self,
        digest: &Digest,
        state: &BackendState,
    ) -> Result<(), StorageError> {
        self.driver.complete_upload(digest, state).await
    }

    async fn abort_upload(&self, state: &BackendState) -> Result<(), StorageError> {
        self.driver.abort_upload(state).await
    }

    async fn metadata(&self, digest: &Digest) -> Result<Metadata, StorageError> {
        self.driver.metadata(digest).await
    }

    async fn delete_blob(&self, digest: &Digest) -> Result<(), StorageError> {
        self.driver.delete_blob(digest).await
    }

    async fn download_blob(
        &self,
        digest: &Digest,
        writer: &mut Writer<'_>,
    ) -> Result<Metadata, StorageError> {
        self.driver.download_blob(digest, writer).await
    }

    async fn purge_uploads(&self, older_than: DateTime<Utc>) -> Result<usize, StorageError> {
        self.driver.purge_uploads(older_than).await
    }
}
