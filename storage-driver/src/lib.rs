//! # Storage driver interface
//!
//! The [`Driver`] trait separates temporary, per-upload write targets from
//! finalized, digest-addressed blobs, so that each backend can choose its own
//! physical representation for both.

mod digest;
mod driver;
mod error;
mod state;

pub use digest::{Algorithm, Digest, InvalidDigest};
pub use driver::Driver;
pub use driver::Metadata;
pub use driver::Reader;
pub use driver::Writer;
pub use error::{StorageError, StorageErrorBuilder, StorageErrorKind};
pub use state::{BackendState, DEFAULT_CONTENT_TYPE};
