//! Server configuration.

use std::net::SocketAddr;
use std::time::Duration;

use serde::Deserialize;
use storage::StorageConfig;

use crate::store::{DEFAULT_SESSION_TTL, SessionStoreConfig};

/// Top-level configuration for `registry-server`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegistryConfig {
    /// Address to serve on.
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Blob storage backend.
    #[serde(default = "default_storage")]
    pub storage: StorageConfig,

    /// Upload session settings.
    #[serde(default)]
    pub sessions: SessionsConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            storage: default_storage(),
            sessions: SessionsConfig::default(),
        }
    }
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 5000))
}

fn default_storage() -> StorageConfig {
    StorageConfig::Memory
}

/// Where sessions live and how long they last.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionsConfig {
    /// Session store backend.
    pub store: SessionStoreConfig,

    /// Seconds a session survives without a write.
    pub ttl_secs: u64,

    /// Seconds between sweeps for abandoned uploads.
    pub purge_interval_secs: u64,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            store: SessionStoreConfig::default(),
            ttl_secs: DEFAULT_SESSION_TTL.as_secs(),
            purge_interval_secs: 60,
        }
    }
}

impl SessionsConfig {
    /// Session lifetime.
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    /// Interval between purge sweeps.
    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_secs.max(1))
    }

    /// Upload targets idle for longer than this are abandoned.
    ///
    /// Twice the session TTL, so a live session never loses its target.
    pub fn abandoned_after(&self) -> Duration {
        self.ttl().saturating_mul(2)
    }
}
