//! API server builder and router

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::get;
use serde_json::json;

use crate::store::{ArcSessionStore, DEFAULT_SESSION_TTL, MemorySessionStore};
use crate::upload::UploadManager;

/// State shared by every handler.
#[derive(Debug, Clone)]
pub(crate) struct RegistryState {
    pub(crate) uploads: UploadManager,
}

/// Registry builder for configuring and creating the OCI registry service
#[derive(Debug)]
pub struct RegistryBuilder {
    storage: Option<storage::Storage>,
    sessions: Option<ArcSessionStore>,
    ttl: Duration,
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryBuilder {
    /// Create a new registry builder
    pub fn new() -> Self {
        Self {
            storage: None,
            sessions: None,
            ttl: DEFAULT_SESSION_TTL,
        }
    }

    /// Set the storage backend. Defaults to process memory.
    pub fn storage(mut self, storage: storage::Storage) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Set the session store. Defaults to process memory.
    pub fn sessions(mut self, sessions: ArcSessionStore) -> Self {
        self.sessions = Some(sessions);
        self
    }

    /// How long an upload session survives without a write.
    pub fn session_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Build the upload manager without a router.
    pub fn into_manager(self) -> UploadManager {
        let storage = self
            .storage
            .unwrap_or_else(|| storage::MemoryDriver::new().into());
        let sessions = self
            .sessions
            .unwrap_or_else(|| Arc::new(MemorySessionStore::new()));
        UploadManager::with_ttl(storage, sessions, self.ttl)
    }

    /// Build the registry service
    ///
    /// Returns a Router that can be served with any tower-compatible server
    pub fn build(self) -> Router {
        router(self.into_manager())
    }
}

/// Router serving the registry API over an existing upload manager.
pub fn router(uploads: UploadManager) -> Router {
    Router::new()
        .route("/v2/", get(api_version_check))
        .merge(crate::blob::router())
        .with_state(RegistryState { uploads })
}

/// API version check endpoint
///
/// Returns 200 OK to indicate the registry is available
async fn api_version_check() -> (StatusCode, Json<serde_json::Value>) {
    (StatusCode::OK, Json(json!({})))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let manager = RegistryBuilder::new()
            .storage(storage::MemoryDriver::new().into())
            .session_ttl(Duration::from_secs(30))
            .into_manager();
        assert_eq!(manager.ttl(), Duration::from_secs(30));
        assert_eq!(manager.storage().name(), "memory");

        let _registry = router(manager);
    }
}
