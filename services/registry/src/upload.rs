//! The chunked upload state machine.
//!
//! A session is started, grows by contiguous chunks, and is either finalized
//! under its verified digest or aborted. Between requests the session lives
//! only in the [`SessionStore`](crate::store::SessionStore), so any process
//! sharing the store and storage can continue it.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use storage::{Digest, Storage};
use tokio::io::{AsyncRead, AsyncReadExt as _, BufReader, ReadBuf};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::accumulator::DigestAccumulator;
use crate::error::UploadError;
use crate::session::{OwnerContext, UploadMode, UploadSession};
use crate::store::{ArcSessionStore, DEFAULT_SESSION_TTL};

/// Byte source for one chunk.
pub type ChunkSource<'a> = dyn AsyncRead + Unpin + Send + 'a;

/// Result of hashing everything uploaded so far.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadSummary {
    /// Session id.
    pub id: Uuid,
    /// Digest of the bytes received.
    pub digest: Digest,
    /// Number of bytes received.
    pub size: u64,
}

/// A blob committed to storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlobDescriptor {
    /// Content address.
    pub digest: Digest,
    /// Length in bytes.
    pub size: u64,
    /// Media type recorded at upload start.
    pub content_type: String,
}

/// What a purge removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    /// Expired session records dropped.
    pub sessions: usize,
    /// Temporary upload targets discarded.
    pub uploads: usize,
}

type LockMap = DashMap<Uuid, Arc<Mutex<()>>>;

/// Exclusive hold on one session id. Released on drop.
struct SessionLock<'m> {
    locks: &'m LockMap,
    id: Uuid,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for SessionLock<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks
            .remove_if(&self.id, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

/// Hashes and counts bytes as the storage driver pulls them.
struct ChunkReader<R> {
    inner: R,
    digest: DigestAccumulator,
    received: u64,
    failed: bool,
}

impl<R> ChunkReader<R> {
    fn new(inner: R, digest: DigestAccumulator) -> Self {
        Self {
            inner,
            digest,
            received: 0,
            failed: false,
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ChunkReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let fresh = &buf.filled()[before..];
                this.digest.absorb(fresh);
                this.received += fresh.len() as u64;
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(error)) => {
                this.failed = true;
                Poll::Ready(Err(error))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[derive(Debug)]
struct Inner {
    storage: Storage,
    sessions: ArcSessionStore,
    ttl: Duration,
    locks: LockMap,
}

/// Runs upload sessions against a storage driver and a session store.
///
/// Cheap to clone. Operations on one session id are mutually exclusive
/// within this process: a second operation arriving while the first is
/// still running fails with [`UploadError::ConcurrentAccess`].
#[derive(Debug, Clone)]
pub struct UploadManager {
    inner: Arc<Inner>,
}

fn session_key(id: Uuid) -> String {
    id.simple().to_string()
}

impl UploadManager {
    /// Create a manager with the default session TTL.
    pub fn new(storage: Storage, sessions: ArcSessionStore) -> Self {
        Self::with_ttl(storage, sessions, DEFAULT_SESSION_TTL)
    }

    /// Create a manager whose sessions expire `ttl` after their last write.
    pub fn with_ttl(storage: Storage, sessions: ArcSessionStore, ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                storage,
                sessions,
                ttl,
                locks: DashMap::new(),
            }),
        }
    }

    /// Storage driver handle.
    pub fn storage(&self) -> &Storage {
        &self.inner.storage
    }

    /// Session lifetime after each write.
    pub fn ttl(&self) -> Duration {
        self.inner.ttl
    }

    fn lock(&self, id: Uuid) -> Result<SessionLock<'_>, UploadError> {
        let locks = &self.inner.locks;
        let mutex = locks.entry(id).or_default().clone();
        match mutex.try_lock_owned() {
            Ok(guard) => Ok(SessionLock {
                locks,
                id,
                guard: Some(guard),
            }),
            Err(_) => {
                locks.remove_if(&id, |_, mutex| Arc::strong_count(mutex) == 1);
                tracing::debug!(%id, "session is busy");
                Err(UploadError::ConcurrentAccess(id))
            }
        }
    }

    async fn load(&self, id: Uuid) -> Result<UploadSession, UploadError> {
        let raw = self
            .inner
            .sessions
            .get(&session_key(id))
            .await?
            .ok_or(UploadError::SessionNotFound(id))?;
        UploadSession::from_bytes(&raw).map_err(|error| UploadError::CorruptState {
            id,
            reason: error.to_string(),
        })
    }

    async fn save(&self, session: &UploadSession) -> Result<(), UploadError> {
        let raw = session
            .to_bytes()
            .map_err(|error| UploadError::CorruptState {
                id: session.id,
                reason: error.to_string(),
            })?;
        self.inner
            .sessions
            .set(&session_key(session.id), raw.into(), self.inner.ttl)
            .await?;
        Ok(())
    }

    fn accumulator(session: &UploadSession) -> Result<DigestAccumulator, UploadError> {
        let digest = DigestAccumulator::decode(&session.digest_state).map_err(|error| {
            UploadError::CorruptState {
                id: session.id,
                reason: error.to_string(),
            }
        })?;
        if digest.len() != session.range_end {
            return Err(UploadError::CorruptState {
                id: session.id,
                reason: format!(
                    "digest covers {} bytes, range ends at {}",
                    digest.len(),
                    session.range_end
                ),
            });
        }
        Ok(digest)
    }

    /// Stream exactly `length` bytes into the backend and the digest.
    ///
    /// `session` is only updated when every byte arrived and the backend
    /// accepted them. A failing backend is reported as such even when it
    /// stopped reading partway through the chunk.
    async fn append(
        &self,
        session: &mut UploadSession,
        reader: &mut ChunkSource<'_>,
        length: u64,
    ) -> Result<(), UploadError> {
        if length == 0 {
            tracing::trace!(id = %session.id, "empty chunk");
            return Ok(());
        }

        let digest = Self::accumulator(session)?;
        let mut chunk = BufReader::new(ChunkReader::new(reader.take(length), digest));
        let written = self
            .inner
            .storage
            .upload_add_chunk(&session.backend_state, &mut chunk)
            .await;

        let chunk = chunk.into_inner();
        let short = || {
            tracing::debug!(
                id = %session.id,
                declared = length,
                received = chunk.received,
                "chunk ended early"
            );
            UploadError::ShortRead {
                declared: length,
                received: chunk.received,
            }
        };

        // A driver error caused by the client's stream is the client's fault.
        if chunk.failed {
            return Err(short());
        }
        let backend_state = written?;
        if chunk.received < length {
            return Err(short());
        }

        session.range_end += length;
        session.digest_state = chunk.digest.encode();
        session.backend_state = backend_state;
        tracing::trace!(id = %session.id, range_end = session.range_end, "chunk committed");
        Ok(())
    }

    async fn commit(
        &self,
        session: &UploadSession,
        expected: &Digest,
    ) -> Result<BlobDescriptor, UploadError> {
        let actual = Self::accumulator(session)?.finalize();
        if &actual != expected {
            tracing::warn!(id = %session.id, %expected, %actual, "digest mismatch");
            return Err(UploadError::DigestMismatch {
                expected: expected.clone(),
                actual,
            });
        }

        self.inner
            .storage
            .complete_upload(&actual, &session.backend_state)
            .await?;
        self.inner.sessions.delete(&session_key(session.id)).await?;

        tracing::info!(id = %session.id, digest = %actual, size = session.range_end, "upload finalized");
        Ok(BlobDescriptor {
            digest: actual,
            size: session.range_end,
            content_type: session.backend_state.content_type().to_owned(),
        })
    }

    /// Begin a new chunked upload and return its id.
    #[tracing::instrument(skip(self))]
    pub async fn start_upload(
        &self,
        mode: UploadMode,
        owner: OwnerContext,
        content_type: Option<&str>,
    ) -> Result<Uuid, UploadError> {
        if mode == UploadMode::Monolithic {
            return Err(UploadError::Unsupported(
                "monolithic uploads are not supported, use chunked uploads".into(),
            ));
        }

        let id = Uuid::new_v4();
        let backend_state = self
            .inner
            .storage
            .initiate_upload(&session_key(id), content_type)
            .await?;

        let session = UploadSession {
            id,
            mode,
            owner,
            range_end: 0,
            digest_state: DigestAccumulator::new().encode(),
            backend_state,
        };

        if let Err(error) = self.save(&session).await {
            if let Err(abort) = self.inner.storage.abort_upload(&session.backend_state).await {
                tracing::warn!(%id, error = %abort, "could not discard upload target");
            }
            return Err(error);
        }

        tracing::info!(%id, owner = %session.owner.path(), "upload started");
        Ok(id)
    }

    /// Append `length` bytes read from `reader`, returning the new range end.
    #[tracing::instrument(skip(self, reader))]
    pub async fn write_chunk<R>(&self, id: Uuid, mut reader: R, length: u64) -> Result<u64, UploadError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let _lock = self.lock(id)?;
        let mut session = self.load(id).await?;
        self.append(&mut session, &mut reader, length).await?;
        self.save(&session).await?;
        Ok(session.range_end)
    }

    /// Like [`UploadManager::write_chunk`], but the chunk must start at `offset`.
    #[tracing::instrument(skip(self, reader))]
    pub async fn write_chunk_at<R>(
        &self,
        id: Uuid,
        offset: u64,
        mut reader: R,
        length: u64,
    ) -> Result<u64, UploadError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let _lock = self.lock(id)?;
        let mut session = self.load(id).await?;
        if offset != session.range_end {
            return Err(UploadError::OutOfOrder {
                expected: session.range_end,
                actual: offset,
            });
        }
        self.append(&mut session, &mut reader, length).await?;
        self.save(&session).await?;
        Ok(session.range_end)
    }

    /// Write an optional last chunk, then report the digest and size so far.
    ///
    /// Nothing is committed to storage. The caller compares the digest and
    /// then calls [`UploadManager::finalize_upload`].
    #[tracing::instrument(skip(self, last))]
    pub async fn complete_upload(
        &self,
        id: Uuid,
        last: Option<(&mut ChunkSource<'_>, u64)>,
    ) -> Result<UploadSummary, UploadError> {
        let _lock = self.lock(id)?;
        let mut session = self.load(id).await?;
        if let Some((reader, length)) = last {
            self.append(&mut session, reader, length).await?;
            self.save(&session).await?;
        }

        let digest = Self::accumulator(&session)?.finalize();
        Ok(UploadSummary {
            id,
            digest,
            size: session.range_end,
        })
    }

    /// Commit the upload under `expected` if the received bytes hash to it.
    ///
    /// On a mismatch nothing is committed and the session is kept.
    #[tracing::instrument(skip(self))]
    pub async fn finalize_upload(
        &self,
        id: Uuid,
        expected: &Digest,
    ) -> Result<BlobDescriptor, UploadError> {
        let _lock = self.lock(id)?;
        let session = self.load(id).await?;
        self.commit(&session, expected).await
    }

    /// Write an optional last chunk and commit under `expected`, holding the
    /// session for both steps.
    #[tracing::instrument(skip(self, last))]
    pub async fn finish_upload(
        &self,
        id: Uuid,
        last: Option<(&mut ChunkSource<'_>, u64)>,
        expected: &Digest,
    ) -> Result<BlobDescriptor, UploadError> {
        let _lock = self.lock(id)?;
        let mut session = self.load(id).await?;
        if let Some((reader, length)) = last {
            if length > 0 {
                self.append(&mut session, reader, length).await?;
                self.save(&session).await?;
            }
        }
        self.commit(&session, expected).await
    }

    /// Discard the upload and its session.
    #[tracing::instrument(skip(self))]
    pub async fn abort_upload(&self, id: Uuid) -> Result<(), UploadError> {
        let _lock = self.lock(id)?;
        let session = self.load(id).await?;
        self.inner
            .storage
            .abort_upload(&session.backend_state)
            .await?;
        self.inner.sessions.delete(&session_key(id)).await?;
        tracing::info!(%id, "upload aborted");
        Ok(())
    }

    /// Bytes committed so far.
    pub async fn range_end(&self, id: Uuid) -> Result<u64, UploadError> {
        Ok(self.load(id).await?.range_end)
    }

    /// A copy of the stored session.
    pub async fn session(&self, id: Uuid) -> Result<UploadSession, UploadError> {
        self.load(id).await
    }

    /// Drop expired sessions and upload targets idle for longer than `max_age`.
    #[tracing::instrument(skip(self))]
    pub async fn purge_abandoned(&self, max_age: Duration) -> Result<PurgeReport, UploadError> {
        let sessions = self.inner.sessions.purge_expired().await?;
        let max_age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
        let older_than = Utc::now()
            .checked_sub_signed(max_age)
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);
        let uploads = self.inner.storage.purge_uploads(older_than).await?;

        let report = PurgeReport { sessions, uploads };
        if report != PurgeReport::default() {
            tracing::info!(sessions, uploads, "purged abandoned uploads");
        }
        Ok(report)
    }
}
