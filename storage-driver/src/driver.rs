use std::{fmt, ops::Deref, sync::Arc};

use chrono::{DateTime, Utc};
use tokio::io;

use crate::digest::Digest;
use crate::error::StorageError;
use crate::state::BackendState;

/// A reader stream for chunk contents.
pub type Reader<'r> = dyn io::AsyncBufRead + Unpin + Send + 'r;

/// A writer stream for blob contents.
pub type Writer<'w> = dyn io::AsyncWrite + Unpin + Send + 'w;

/// Finalized blob metadata, which will be generically provided by the driver.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Metadata {
    /// The size of the blob in bytes.
    pub size: u64,

    /// When the blob was finalized.
    pub created: DateTime<Utc>,

    /// The content type recorded when the upload was initiated.
    pub content_type: String,
}

/// A storage driver, which keeps temporary upload targets and finalized,
/// digest-addressed blobs.
///
/// Upload targets are mutable and keyed by upload id; the driver threads its
/// own bookkeeping through [`BackendState`]. Blobs are immutable and keyed by
/// [`Digest`].
#[async_trait::async_trait]
pub trait Driver: fmt::Debug {
    /// The name of the driver.
    fn name(&self) -> &'static str;

    /// Allocate a write target for a new upload.
    async fn initiate_upload(
        &self,
        id: &str,
        content_type: Option<&str>,
    ) -> Result<BackendState, StorageError>;

    /// Append every byte from `reader` to the upload target.
    ///
    /// Bytes beyond the committed size in `state` (left behind by an earlier
    /// failed append) are discarded first.
    async fn upload_add_chunk(
        &self,
        state: &BackendState,
        reader: &mut Reader<'_>,
    ) -> Result<BackendState, StorageError>;

    /// Expose the upload target under `digest`.
    ///
    /// Completing twice with the same digest succeeds, and a blob is never
    /// visible under `digest` in a partially written state.
    async fn complete_upload(&self, digest: &Digest, state: &BackendState)
    -> Result<(), StorageError>;

    /// Discard the upload target. Discarding a missing target is a no-op.
    async fn abort_upload(&self, state: &BackendState) -> Result<(), StorageError>;

    /// Get the metadata for a finalized blob.
    async fn metadata(&self, digest: &Digest) -> Result<Metadata, StorageError>;

    /// Delete a finalized blob.
    async fn delete_blob(&self, digest: &Digest) -> Result<(), StorageError>;

    /// Stream a finalized blob into `writer`.
    async fn download_blob(
        &self,
        digest: &Digest,
        writer: &mut Writer<'_>,
    ) -> Result<Metadata, StorageError>;

    /// Discard upload targets that have not been written since `older_than`,
    /// returning how many were removed.
    async fn purge_uploads(&self, older_than: DateTime<Utc>) -> Result<usize, StorageError> {
        let _ = older_than;
        Ok(0)
    }
}

#[async_trait::async_trait]
impl<D> Driver for Arc<D>
where
    D: ?Sized + Driver + Sync + Send + 'static,
{
    fn name(&self) -> &'static str {
        self.deref().name()
    }

    async fn initiate_upload(
        &self,
        id: &str,
        content_type: Option<&str>,
    ) -> Result<BackendState, StorageError> {
        self.deref().initiate_upload(id, content_type).await
    }

    async fn upload_add_chunk(
        &self,
        state: &BackendState,
        reader: &mut Reader<'_>,
    ) -> Result<BackendState, StorageError> {
        self.deref().upload_add_chunk(state, reader).await
    }

    async fn complete_upload(
        &self,
        digest: &Digest,
        state: &BackendState,
    ) -> Result<(), StorageError> {
        self.deref().complete_upload(digest, state).await
    }

    async fn abort_upload(&self, state: &BackendState) -> Result<(), StorageError> {
        self.deref().abort_upload(state).await
    }

    async fn metadata(&self, digest: &Digest) -> Result<Metadata, StorageError> {
        self.deref().metadata(digest).await
    }

    async fn delete_blob(&self, digest: &Digest) -> Result<(), StorageError> {
        self.deref().delete_blob(digest).await
    }

    async fn download_blob(
        &self,
        digest: &Digest,
        writer: &mut Writer<'_>,
    ) -> Result<Metadata, StorageError> {
        self.deref().download_blob(digest, writer).await
    }

    async fn purge_uploads(&self, older_than: DateTime<Utc>) -> Result<usize, StorageError> {
        self.deref().purge_uploads(older_than).await
    }
}
