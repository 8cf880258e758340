//! Expiring key-value storage for upload sessions.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Sessions expire after five minutes without a write unless configured otherwise.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(300);

/// Shared handle to a session store.
pub type ArcSessionStore = Arc<dyn SessionStore>;

/// Errors from a session store.
#[derive(Debug, thiserror::Error)]
pub enum SessionStoreError {
    /// The key cannot be stored by this backend.
    #[error("invalid session key {0:?}")]
    InvalidKey(String),

    /// The underlying storage failed.
    #[error("session store I/O on {path}")]
    Io {
        /// File being accessed.
        path: Utf8PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// A stored record could not be read back.
    #[error("session record {key} is corrupt")]
    Corrupt {
        /// Key of the damaged record.
        key: String,
        /// Decoding error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Get, set-with-expiry and delete over opaque values.
///
/// Each call is atomic per key. Expired values are never returned.
#[async_trait::async_trait]
pub trait SessionStore: fmt::Debug + Send + Sync {
    /// Fetch the live value for `key`.
    async fn get(&self, key: &str) -> Result<Option<Bytes>, SessionStoreError>;

    /// Store `value`, replacing any previous value, until `ttl` elapses.
    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), SessionStoreError>;

    /// Remove `key`. Removing a missing key succeeds.
    async fn delete(&self, key: &str) -> Result<(), SessionStoreError>;

    /// Drop every expired record, returning how many were dropped.
    async fn purge_expired(&self) -> Result<usize, SessionStoreError> {
        Ok(0)
    }
}

/// Which session store to use.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionStoreConfig {
    /// Process memory. Sessions are lost on restart.
    #[default]
    Memory,

    /// One file per session in a directory, shareable between processes.
    Local {
        /// Directory holding session records.
        path: Utf8PathBuf,
    },
}

impl SessionStoreConfig {
    /// Construct the configured store.
    #[tracing::instrument]
    pub async fn build(self) -> Result<ArcSessionStore, SessionStoreError> {
        let store: ArcSessionStore = match self {
            SessionStoreConfig::Memory => Arc::new(MemorySessionStore::new()),
            SessionStoreConfig::Local { path } => {
                tokio::fs::create_dir_all(&path)
                    .await
                    .map_err(|source| SessionStoreError::Io {
                        path: path.clone(),
                        source,
                    })?;
                Arc::new(LocalSessionStore::new(path))
            }
        };
        tracing::debug!(?store, "session store ready");
        Ok(store)
    }
}

#[derive(Debug, Clone)]
struct Entry {
    deadline: Instant,
    value: Bytes,
}

/// Sessions held in a concurrent map, timed by the tokio clock.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    entries: DashMap<String, Entry>,
}

impl MemorySessionStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records held, including expired ones not yet dropped.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no records are held.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait::async_trait]
impl SessionStore for MemorySessionStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, SessionStoreError> {
        let now = Instant::now();
        let removed = self.entries.remove_if(key, |_, entry| entry.deadline <= now);
        if removed.is_some() {
            tracing::trace!(key, "session expired");
            return Ok(None);
        }
        Ok(self.entries.get(key).map(|entry| entry.value.clone()))
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), SessionStoreError> {
        let deadline = Instant::now() + ttl;
        self.entries
            .insert(key.to_owned(), Entry { deadline, value });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), SessionStoreError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn purge_expired(&self) -> Result<usize, SessionStoreError> {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.deadline > now);
        Ok(before.saturating_sub(self.entries.len()))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Record {
    expires_at: DateTime<Utc>,
    value: String,
}

impl Record {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Sessions stored as JSON files in a directory.
///
/// Records are replaced with a rename, so readers in other processes see
/// either the old record or the new one. Expiry uses the wall clock.
#[derive(Debug, Clone)]
pub struct LocalSessionStore {
    root: Utf8PathBuf,
}

fn valid_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

fn io_err(path: &Utf8Path) -> impl FnOnce(io::Error) -> SessionStoreError + '_ {
    move |source| SessionStoreError::Io {
        path: path.to_owned(),
        source,
    }
}

impl LocalSessionStore {
    /// Store records under `root`, which must already exist.
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory holding the records.
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn path(&self, key: &str) -> Result<Utf8PathBuf, SessionStoreError> {
        if !valid_key(key) {
            return Err(SessionStoreError::InvalidKey(key.to_owned()));
        }
        Ok(self.root.join(format!("{key}.json")))
    }

    async fn read(&self, key: &str, path: &Utf8Path) -> Result<Option<Record>, SessionStoreError> {
        let raw = match tokio::fs::read(path).await {
            Ok(raw) => raw,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(io_err(path)(error)),
        };
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|source| SessionStoreError::Corrupt {
                key: key.to_owned(),
                source: source.into(),
            })
    }

    async fn remove(path: &Utf8Path) -> Result<bool, SessionStoreError> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(error) => Err(io_err(path)(error)),
        }
    }
}

#[async_trait::async_trait]
impl SessionStore for LocalSessionStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, SessionStoreError> {
        let path = self.path(key)?;
        let Some(record) = self.read(key, &path).await? else {
            return Ok(None);
        };

        if record.is_expired(Utc::now()) {
            tracing::trace!(key, "session expired");
            Self::remove(&path).await?;
            return Ok(None);
        }

        let value = STANDARD
            .decode(record.value)
            .map_err(|source| SessionStoreError::Corrupt {
                key: key.to_owned(),
                source: source.into(),
            })?;
        Ok(Some(value.into()))
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), SessionStoreError> {
        let path = self.path(key)?;
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let record = Record {
            expires_at: Utc::now()
                .checked_add_signed(ttl)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            value: STANDARD.encode(&value),
        };
        let raw = serde_json::to_vec(&record).map_err(|source| SessionStoreError::Corrupt {
            key: key.to_owned(),
            source: source.into(),
        })?;

        let staging = self
            .root
            .join(format!(".{key}.{}.tmp", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&staging, &raw)
            .await
            .map_err(io_err(&staging))?;
        if let Err(error) = tokio::fs::rename(&staging, &path).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(io_err(&path)(error));
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), SessionStoreError> {
        let path = self.path(key)?;
        Self::remove(&path).await?;
        Ok(())
    }

    async fn purge_expired(&self) -> Result<usize, SessionStoreError> {
        let now = Utc::now();
        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .map_err(io_err(&self.root))?;

        let mut purged = 0;
        while let Some(entry) = entries.next_entry().await.map_err(io_err(&self.root))? {
            let Ok(path) = Utf8PathBuf::from_path_buf(entry.path()) else {
                continue;
            };
            let Some(key) = path
                .file_name()
                .and_then(|name| name.strip_suffix(".json"))
                .filter(|key| valid_key(key))
            else {
                continue;
            };

            match self.read(key, &path).await {
                Ok(Some(record)) if record.is_expired(now) => {
                    if Self::remove(&path).await? {
                        purged += 1;
                    }
                }
                Ok(_) => {}
                Err(error) => {
                    tracing::warn!(%path, error = %error, "skipping unreadable session record");
                }
            }
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn memory_records_expire() {
        let store = MemorySessionStore::new();
        store
            .set("a", Bytes::from_static(b"one"), Duration::from_secs(10))
            .await
            .unwrap();
        store
            .set("b", Bytes::from_static(b"two"), Duration::from_secs(30))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(9)).await;
        assert_eq!(store.get("a").await.unwrap().as_deref(), Some(&b"one"[..]));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.get("a").await.unwrap(), None);
        assert_eq!(store.len(), 1);

        store
            .set("c", Bytes::from_static(b"three"), Duration::from_secs(1))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(store.purge_expired().await.unwrap(), 1);
        assert_eq!(store.get("b").await.unwrap().as_deref(), Some(&b"two"[..]));
    }

    #[tokio::test(start_paused = true)]
    async fn memory_set_refreshes_ttl() {
        let store = MemorySessionStore::new();
        let ttl = Duration::from_secs(10);
        store.set("k", Bytes::from_static(b"v1"), ttl).await.unwrap();

        tokio::time::advance(Duration::from_secs(8)).await;
        store.set("k", Bytes::from_static(b"v2"), ttl).await.unwrap();

        tokio::time::advance(Duration::from_secs(8)).await;
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some(&b"v2"[..]));

        store.delete("k").await.unwrap();
        store.delete("k").await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn local_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        let store = LocalSessionStore::new(root);

        store
            .set("abc-123", Bytes::from_static(b"\x00payload"), DEFAULT_SESSION_TTL)
            .await
            .unwrap();
        assert!(root.join("abc-123.json").exists());

        let other = LocalSessionStore::new(root);
        assert_eq!(
            other.get("abc-123").await.unwrap().as_deref(),
            Some(&b"\x00payload"[..])
        );

        other.delete("abc-123").await.unwrap();
        assert_eq!(store.get("abc-123").await.unwrap(), None);
        store.delete("abc-123").await.unwrap();
    }

    #[tokio::test]
    async fn local_zero_ttl_expires() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalSessionStore::new(Utf8Path::from_path(dir.path()).unwrap());

        store
            .set("gone", Bytes::from_static(b"x"), Duration::ZERO)
            .await
            .unwrap();
        store
            .set("kept", Bytes::from_static(b"y"), DEFAULT_SESSION_TTL)
            .await
            .unwrap();

        assert_eq!(store.purge_expired().await.unwrap(), 1);
        assert_eq!(store.get("gone").await.unwrap(), None);
        assert!(store.get("kept").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn local_rejects_path_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalSessionStore::new(Utf8Path::from_path(dir.path()).unwrap());

        let err = store.get("../escape").await.unwrap_err();
        assert!(matches!(err, SessionStoreError::InvalidKey(_)));
    }

    #[test]
    fn config_forms() {
        let config: SessionStoreConfig = serde_json::from_str(r#""memory""#).unwrap();
        assert!(matches!(config, SessionStoreConfig::Memory));

        let config: SessionStoreConfig =
            serde_json::from_str(r#"{"local": {"path": "/var/lib/registry/sessions"}}"#).unwrap();
        assert!(
            matches!(config, SessionStoreConfig::Local { path } if path == "/var/lib/registry/sessions")
        );
    }
}
