//! Placeholder for a remote object-store backend.

use storage_driver::{
    BackendState, Digest, Driver, Metadata, Reader, StorageError, StorageErrorKind, Writer,
};

const ENGINE: &str = "object-store";

/// Object storage driver. Accepted in configuration, but every operation
/// currently fails with [`StorageErrorKind::Unsupported`].
#[derive(Debug, Clone)]
pub struct ObjectStoreDriver {
    endpoint: String,
    bucket: String,
}

impl ObjectStoreDriver {
    /// Create a driver for `bucket` at `endpoint`.
    pub fn new(endpoint: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            bucket: bucket.into(),
        }
    }

    fn unsupported(&self, operation: &str) -> StorageError {
        StorageError::builder(
            ENGINE,
            StorageErrorKind::Unsupported,
            std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                format!("{operation} is not implemented for object storage"),
            ),
        )
        .context(format!("{}/{}", self.endpoint, self.bucket))
        .build()
    }
}

#[async_trait::async_trait]
impl Driver for ObjectStoreDriver {
    fn name(&self) -> &'static str {
        ENGINE
    }

    async fn initiate_upload(
        &self,
        _id: &str,
        _content_type: Option<&str>,
    ) -> Result<BackendState, StorageError> {
        Err(self.unsupported("initiate_upload"))
    }

    async fn upload_add_chunk(
        &self,
        _state: &BackendState,
        _reader: &mut Reader<'_>,
    ) -> Result<BackendState, StorageError> {
        Err(self.unsupported("upload_add_chunk"))
    }

    async fn complete_upload(
        &self,
        _digest: &Digest,
        _state: &BackendState,
    ) -> Result<(), StorageError> {
        Err(self.unsupported("complete_upload"))
    }

    async fn abort_upload(&self, _state: &BackendState) -> Result<(), StorageError> {
        Err(self.unsupported("abort_upload"))
    }

    async fn metadata(&self, _digest: &Digest) -> Result<Metadata, StorageError> {
        Err(self.unsupported("metadata"))
    }

    async fn delete_blob(&self, _digest: &Digest) -> Result<(), StorageError> {
        Err(self.unsupported("delete_blob"))
    }

    async fn download_blob(
        &self,
        _digest: &Digest,
        _writer: &mut Writer<'_>,
    ) -> Result<Metadata, StorageError> {
        Err(self.unsupported("download_blob"))
    }
}
