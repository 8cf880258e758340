//! Behaviour every blob driver must share.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use camino::Utf8Path;
use sha2::Digest as _;
use storage::{Digest, LocalDriver, MemoryDriver, Storage, StorageErrorKind};
use tokio::io::{AsyncRead, AsyncReadExt as _, BufReader, ReadBuf};

fn digest_of(data: &[u8]) -> Digest {
    Digest::sha256(sha2::Sha256::digest(data).into())
}

fn local(dir: &tempfile::TempDir) -> Storage {
    let root = Utf8Path::from_path(dir.path()).unwrap();
    LocalDriver::new(root.join("persistent"), root.join("temporary")).into()
}

async fn upload(storage: &Storage, id: &str, chunks: &[&[u8]]) -> storage::BackendState {
    let mut state = storage
        .initiate_upload(id, Some("application/vnd.oci.image.layer.v1.tar"))
        .await
        .unwrap();
    for chunk in chunks {
        let mut reader: &[u8] = chunk;
        state = storage.upload_add_chunk(&state, &mut reader).await.unwrap();
    }
    state
}

async fn chunks_concatenate_in_order(storage: Storage) {
    let state = upload(&storage, "ordered", &[b"hello ", b"", b"world"]).await;
    assert_eq!(state.size("conformance").unwrap(), 11);

    let digest = digest_of(b"hello world");
    storage.complete_upload(&digest, &state).await.unwrap();

    let (data, metadata) = storage.read_blob(&digest).await.unwrap();
    assert_eq!(data, b"hello world");
    assert_eq!(metadata.size, 11);
    assert_eq!(metadata.content_type, "application/vnd.oci.image.layer.v1.tar");
}

async fn finalize_is_idempotent(storage: Storage) {
    let digest = digest_of(b"same bytes");

    let first = upload(&storage, "first", &[b"same bytes"]).await;
    storage.complete_upload(&digest, &first).await.unwrap();
    storage.complete_upload(&digest, &first).await.unwrap();

    let second = upload(&storage, "second", &[b"same ", b"bytes"]).await;
    storage.complete_upload(&digest, &second).await.unwrap();

    let (data, _) = storage.read_blob(&digest).await.unwrap();
    assert_eq!(data, b"same bytes");

    storage.delete_blob(&digest).await.unwrap();
    let err = storage.metadata(&digest).await.unwrap_err();
    assert_eq!(err.kind(), StorageErrorKind::NotFound);
}

async fn abort_discards_and_repeats_quietly(storage: Storage) {
    let state = upload(&storage, "aborted", &[b"partial"]).await;
    storage.abort_upload(&state).await.unwrap();
    storage.abort_upload(&state).await.unwrap();

    let mut reader: &[u8] = b"more";
    let err = storage
        .upload_add_chunk(&state, &mut reader)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), StorageErrorKind::NotFound);

    let err = storage
        .complete_upload(&digest_of(b"partial"), &state)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), StorageErrorKind::NotFound);
}

/// A source that fails, as a dropped client connection does.
struct Disconnected;

impl AsyncRead for Disconnected {
    fn poll_read(
        self: Pin<&mut Self>,
        _: &mut Context<'_>,
        _: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Ready(Err(io::ErrorKind::ConnectionReset.into()))
    }
}

async fn interrupted_chunk_is_discarded(storage: Storage) {
    let committed = upload(&storage, "interrupted", &[b"hello "]).await;

    let mut broken = BufReader::new((&b"garbage"[..]).chain(Disconnected));
    let err = storage
        .upload_add_chunk(&committed, &mut broken)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), StorageErrorKind::Io);

    let mut reader: &[u8] = b"world";
    let state = storage
        .upload_add_chunk(&committed, &mut reader)
        .await
        .unwrap();
    assert_eq!(state.size("conformance").unwrap(), 11);

    let digest = digest_of(b"hello world");
    storage.complete_upload(&digest, &state).await.unwrap();
    let (data, _) = storage.read_blob(&digest).await.unwrap();
    assert_eq!(data, b"hello world");
}

async fn missing_blobs_are_not_found(storage: Storage) {
    let digest = digest_of(b"never uploaded");

    let err = storage.read_blob(&digest).await.unwrap_err();
    assert_eq!(err.kind(), StorageErrorKind::NotFound);

    let err = storage.delete_blob(&digest).await.unwrap_err();
    assert_eq!(err.kind(), StorageErrorKind::NotFound);
}

macro_rules! conformance {
    ($($case:ident),+ $(,)?) => {
        mod memory {
            $(
                #[tokio::test]
                async fn $case() {
                    super::$case(storage::MemoryDriver::new().into()).await;
                }
            )+
        }

        mod local {
            $(
                #[tokio::test]
                async fn $case() {
                    let dir = tempfile::tempdir().unwrap();
                    super::$case(super::local(&dir)).await;
                }
            )+
        }
    };
}

conformance!(
    chunks_concatenate_in_order,
    finalize_is_idempotent,
    abort_discards_and_repeats_quietly,
    interrupted_chunk_is_discarded,
    missing_blobs_are_not_found,
);

#[tokio::test]
async fn memory_driver_is_shareable() {
    let driver = std::sync::Arc::new(MemoryDriver::new());
    let storage = Storage::from(driver.clone());

    let state = upload(&storage, "shared", &[b"x"]).await;
    assert_eq!(driver.pending_uploads().await, 1);

    storage.complete_upload(&digest_of(b"x"), &state).await.unwrap();
    assert_eq!(driver.pending_uploads().await, 0);
    assert_eq!(driver.blob_count().await, 1);
}
