use std::collections::HashMap;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::{io::AsyncWriteExt, sync::RwLock};

use storage_driver::{
    BackendState, Digest, Driver, Metadata, Reader, StorageError, StorageErrorKind, Writer,
};

const ENGINE: &str = "memory";
const UPLOAD: &str = "upload";

#[derive(Debug)]
struct MemoryUpload {
    touched: DateTime<Utc>,
    data: Vec<u8>,
}

#[derive(Debug)]
struct MemoryBlob {
    created: DateTime<Utc>,
    content_type: String,
    data: Bytes,
}

impl From<&MemoryBlob> for Metadata {
    fn from(value: &MemoryBlob) -> Self {
        Self {
            created: value.created,
            size: value.data.len() as u64,
            content_type: value.content_type.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct Maps {
    uploads: HashMap<String, MemoryUpload>,
    blobs: HashMap<Digest, MemoryBlob>,
}

/// Storage driver that keeps uploads and blobs in memory.
///
/// Blob reads share the lock; every mutation of either map takes it
/// exclusively.
#[derive(Debug, Default)]
pub struct MemoryDriver {
    maps: RwLock<Maps>,
}

impl MemoryDriver {
    /// Create a new, empty `MemoryDriver`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of upload targets currently allocated.
    pub async fn pending_uploads(&self) -> usize {
        self.maps.read().await.uploads.len()
    }

    /// Number of finalized blobs.
    pub async fn blob_count(&self) -> usize {
        self.maps.read().await.blobs.len()
    }
}

fn missing_upload(id: &str) -> StorageError {
    StorageError::not_found(ENGINE, "upload target not found")
        .upload(id)
        .build()
}

fn missing_blob(digest: &Digest) -> StorageError {
    StorageError::not_found(ENGINE, "blob not found")
        .digest(digest)
        .build()
}

#[async_trait::async_trait]
impl Driver for MemoryDriver {
    fn name(&self) -> &'static str {
        ENGINE
    }

    async fn initiate_upload(
        &self,
        id: &str,
        content_type: Option<&str>,
    ) -> Result<BackendState, StorageError> {
        let mut maps = self.maps.write().await;
        if maps.uploads.contains_key(id) {
            return Err(StorageError::invalid(ENGINE, "upload id already in use")
                .upload(id)
                .build());
        }

        maps.uploads.insert(
            id.to_owned(),
            MemoryUpload {
                touched: Utc::now(),
                data: Vec::new(),
            },
        );

        let mut state = BackendState::new().with(UPLOAD, id);
        state.set_size(0);
        state.set_content_type(content_type);
        Ok(state)
    }

    async fn upload_add_chunk(
        &self,
        state: &BackendState,
        reader: &mut Reader<'_>,
    ) -> Result<BackendState, StorageError> {
        let id = state.require(ENGINE, UPLOAD)?;
        let size = state.size(ENGINE)?;

        // Buffer outside the lock so slow clients don't stall other uploads.
        let mut buf = Vec::new();
        tokio::io::copy(reader, &mut buf)
            .await
            .map_err(|err| StorageError::io(ENGINE, err).upload(id).build())?;

        let mut maps = self.maps.write().await;
        let upload = maps.uploads.get_mut(id).ok_or_else(|| missing_upload(id))?;

        let committed = usize::try_from(size)
            .ok()
            .filter(|&committed| committed <= upload.data.len())
            .ok_or_else(|| {
                StorageError::invalid(ENGINE, "backend state size exceeds upload target")
                    .upload(id)
                    .build()
            })?;

        upload.data.truncate(committed);
        upload.data.extend_from_slice(&buf);
        upload.touched = Utc::now();

        tracing::trace!(upload = %id, appended = buf.len(), "appended chunk");

        let mut next = state.clone();
        next.set_size(size + buf.len() as u64);
        Ok(next)
    }

    async fn complete_upload(
        &self,
        digest: &Digest,
        state: &BackendState,
    ) -> Result<(), StorageError> {
        let id = state.require(ENGINE, UPLOAD)?;
        let size = state.size(ENGINE)?;

        let mut maps = self.maps.write().await;
        if maps.blobs.contains_key(digest) {
            tracing::debug!(%digest, upload = %id, "blob already finalized");
            maps.uploads.remove(id);
            return Ok(());
        }

        let mut upload = maps.uploads.remove(id).ok_or_else(|| missing_upload(id))?;
        if (upload.data.len() as u64) < size {
            let err = StorageError::builder(
                ENGINE,
                StorageErrorKind::InvalidRequest,
                std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "upload target is shorter than the committed size",
                ),
            )
            .upload(id)
            .digest(digest)
            .build();
            maps.uploads.insert(id.to_owned(), upload);
            return Err(err);
        }
        upload.data.truncate(size as usize);

        maps.blobs.insert(
            digest.clone(),
            MemoryBlob {
                created: Utc::now(),
                content_type: state.content_type().to_owned(),
                data: upload.data.into(),
            },
        );

        Ok(())
    }

    async fn abort_upload(&self, state: &BackendState) -> Result<(), StorageError> {
        let id = state.require(ENGINE, UPLOAD)?;
        let mut maps = self.maps.write().await;
        maps.uploads.remove(id);
        Ok(())
    }

    async fn metadata(&self, digest: &Digest) -> Result<Metadata, StorageError> {
        let maps = self.maps.read().await;
        maps.blobs
            .get(digest)
            .map(Metadata::from)
            .ok_or_else(|| missing_blob(digest))
    }

    async fn delete_blob(&self, digest: &Digest) -> Result<(), StorageError> {
        let mut maps = self.maps.write().await;
        maps.blobs
            .remove(digest)
            .map(|_| ())
            .ok_or_else(|| missing_blob(digest))
    }

    async fn download_blob(
        &self,
        digest: &Digest,
        writer: &mut Writer<'_>,
    ) -> Result<Metadata, StorageError> {
        let (data, metadata) = {
            let maps = self.maps.read().await;
            let blob = maps.blobs.get(digest).ok_or_else(|| missing_blob(digest))?;
            (blob.data.clone(), Metadata::from(blob))
        };

        writer
            .write_all(&data)
            .await
            .map_err(|err| StorageError::io(ENGINE, err).digest(digest).build())?;

        writer
            .flush()
            .await
            .map_err(|err| StorageError::io(ENGINE, err).digest(digest).build())?;

        Ok(metadata)
    }

    async fn purge_uploads(&self, older_than: DateTime<Utc>) -> Result<usize, StorageError> {
        let mut maps = self.maps.write().await;
        let before = maps.uploads.len();
        maps.uploads.retain(|_, upload| upload.touched >= older_than);
        Ok(before - maps.uploads.len())
    }
}
