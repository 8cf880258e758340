//! # Storage backends
//!
//! Configuration and unification for the blob storage backends.

use std::sync::Arc;

#[cfg(feature = "local")]
use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
#[cfg(feature = "local")]
use eyre::Context;
use serde::Deserialize;
use tokio::io;

#[cfg(feature = "local")]
pub(crate) mod local;

pub(crate) mod memory;
pub(crate) mod object;
#[cfg(feature = "tmp")]
pub(crate) mod temp;

#[cfg(feature = "local")]
#[doc(inline)]
pub use local::LocalDriver;

#[doc(inline)]
pub use memory::MemoryDriver;

#[doc(inline)]
pub use object::ObjectStoreDriver;

#[cfg(feature = "tmp")]
#[doc(inline)]
pub use temp::TempDriver;

#[doc(inline)]
pub use storage_driver::{
    Algorithm, BackendState, Digest, Driver, InvalidDigest, Metadata, Reader, StorageError,
    StorageErrorKind, Writer, DEFAULT_CONTENT_TYPE,
};

/// Which backend to use, selected once at startup.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageConfig {
    /// Keep everything in process memory.
    Memory,

    /// Store blobs and uploads in local directories.
    #[cfg(feature = "local")]
    Local {
        /// Directory for finalized blobs.
        persistent: Utf8PathBuf,
        /// Directory for in-progress uploads; must share a filesystem with `persistent`.
        temporary: Utf8PathBuf,
    },

    /// Store everything in a throwaway temporary directory.
    #[cfg(feature = "tmp")]
    Temp,

    /// Remote object storage (not yet implemented).
    ObjectStore {
        /// Service endpoint.
        endpoint: String,
        /// Bucket holding blobs.
        bucket: String,
    },
}

impl StorageConfig {
    /// Construct the configured driver, creating any directories it needs.
    #[tracing::instrument]
    pub async fn build(self) -> Result<Storage, StorageError> {
        let storage: Storage = match self {
            StorageConfig::Memory => MemoryDriver::new().into(),
            #[cfg(feature = "local")]
            StorageConfig::Local {
                persistent,
                temporary,
            } => {
                for dir in [&persistent, &temporary] {
                    tokio::fs::create_dir_all(dir)
                        .await
                        .wrap_err_with(|| format!("creating storage directory {dir}"))
                        .map_err(StorageError::with("local", StorageErrorKind::Io))?;
                }
                LocalDriver::new(persistent, temporary).into()
            }
            #[cfg(feature = "tmp")]
            StorageConfig::Temp => TempDriver::new()
                .map_err(StorageError::with("temp", StorageErrorKind::Io))?
                .into(),
            StorageConfig::ObjectStore { endpoint, bucket } => {
                tracing::warn!(%endpoint, %bucket, "object storage is not implemented; uploads will fail");
                ObjectStoreDriver::new(endpoint, bucket).into()
            }
        };
        tracing::info!(driver = storage.name(), "storage ready");
        Ok(storage)
    }
}

pub(crate) type ArcDriver = Arc<dyn Driver + Send + Sync>;

/// Shared handle to the configured driver.
#[derive(Debug, Clone)]
pub struct Storage {
    driver: ArcDriver,
}

impl<D> From<D> for Storage
where
    D: Driver + Send + Sync + 'static,
{
    fn from(value: D) -> Self {
        Storage::new(value)
    }
}

impl Storage {
    /// Wrap a driver.
    pub fn new<D: Driver + Send + Sync + 'static>(driver: D) -> Self {
        Self {
            driver: Arc::new(driver),
        }
    }

    /// Name of the underlying driver.
    pub fn name(&self) -> &str {
        self.driver.name()
    }

    #[tracing::instrument(skip(self), fields(driver=self.driver.name()))]
    pub async fn initiate_upload(
        &self,
        id: &str,
        content_type: Option<&str>,
    ) -> Result<BackendState, StorageError> {
        self.driver.initiate_upload(id, content_type).await
    }

    #[tracing::instrument(skip(self, state, reader), fields(driver=self.driver.name()))]
    pub async fn upload_add_chunk<'d, R>(
        &'d self,
        state: &BackendState,
        reader: &mut R,
    ) -> Result<BackendState, StorageError>
    where
        R: io::AsyncBufRead + Unpin + Send + 'd,
    {
        self.driver.upload_add_chunk(state, reader).await
    }

    #[tracing::instrument(skip(self, state), fields(driver=self.driver.name()))]
    pub async fn complete_upload(
        &self,
        digest: &Digest,
        state: &BackendState,
    ) -> Result<(), StorageError> {
        tracing::trace!(%digest, "finalizing upload");
        self.driver.complete_upload(digest, state).await
    }

    #[tracing::instrument(skip(self, state), fields(driver=self.driver.name()))]
    pub async fn abort_upload(&self, state: &BackendState) -> Result<(), StorageError> {
        self.driver.abort_upload(state).await
    }

    #[tracing::instrument(skip(self), fields(driver=self.driver.name()))]
    pub async fn metadata(&self, digest: &Digest) -> Result<Metadata, StorageError> {
        self.driver.metadata(digest).await
    }

    #[tracing::instrument(skip(self), fields(driver=self.driver.name()))]
    pub async fn delete_blob(&self, digest: &Digest) -> Result<(), StorageError> {
        self.driver.delete_blob(digest).await
    }

    #[tracing::instrument(skip(self, writer), fields(driver=self.driver.name()))]
    pub async fn download_blob<'d, W>(
        &'d self,
        digest: &Digest,
        writer: &mut W,
    ) -> Result<Metadata, StorageError>
    where
        W: io::AsyncWrite + Unpin + Send + 'd,
    {
        tracing::trace!(%digest, "downloading blob");
        self.driver.download_blob(digest, writer).await
    }

    /// Read a whole blob into memory.
    pub async fn read_blob(&self, digest: &Digest) -> Result<(Vec<u8>, Metadata), StorageError> {
        let mut data = Vec::new();
        let metadata = self.download_blob(digest, &mut data).await?;
        Ok((data, metadata))
    }

    #[tracing::instrument(skip(self), fields(driver=self.driver.name()))]
    pub async fn purge_uploads(&self, older_than: DateTime<Utc>) -> Result<usize, StorageError> {
        let purged = self.driver.purge_uploads(older_than).await?;
        if purged > 0 {
            tracing::info!(purged, "purged stale upload targets");
        }
        Ok(purged)
    }
}
