//! # OCI Container Registry
//!
//! Blob push and pull for an OCI registry following the
//! [OCI Distribution Specification](https://github.com/opencontainers/distribution-spec),
//! with repositories addressed as `tenant/project/name`.
//!
//! The interesting part is the resumable upload path. A blob arrives in one
//! or more chunks, possibly served by different processes, and is only
//! committed to content-addressed storage once the digest the client
//! declares matches the bytes received.
//!
//! - [`DigestAccumulator`]: SHA-256 whose mid-stream state can be stored.
//! - [`SessionStore`]: expiring storage for [`UploadSession`] records.
//! - [`UploadManager`]: the upload state machine.
//! - [`RegistryBuilder`]: the axum router for the blob endpoints.
//!
//! ## Example
//!
//! ```no_run
//! use registry::RegistryBuilder;
//! use storage::MemoryDriver;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = RegistryBuilder::new()
//!     .storage(MemoryDriver::new().into())
//!     .build();
//!
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:5000").await?;
//! axum::serve(listener, registry).await?;
//! # Ok(())
//! # }
//! ```

mod accumulator;
mod api;
mod blob;
mod config;
mod error;
mod session;
mod store;
mod upload;

pub use accumulator::{DigestAccumulator, InvalidState};
pub use api::{RegistryBuilder, router};
pub use config::{RegistryConfig, SessionsConfig};
pub use error::{RegistryError, RegistryResult, UploadError};
pub use session::{OwnerContext, UploadMode, UploadSession};
pub use store::{
    ArcSessionStore, DEFAULT_SESSION_TTL, LocalSessionStore, MemorySessionStore, SessionStore,
    SessionStoreConfig, SessionStoreError,
};
pub use upload::{BlobDescriptor, ChunkSource, PurgeReport, UploadManager, UploadSummary};
