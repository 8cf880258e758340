//! Opaque per-upload bookkeeping owned by a driver.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::StorageError;

const SIZE: &str = "size";
const CONTENT_TYPE: &str = "content-type";

/// Default content type for blobs uploaded without a hint.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Key-value state a driver hands back from each upload operation.
///
/// The upload core stores this alongside the session and passes it back
/// unchanged on the next call; only the driver that produced it interprets
/// the entries. Every driver records the committed `size` so that a failed
/// append can be rolled back by truncating to it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackendState(BTreeMap<String, String>);

impl BackendState {
    /// Empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a raw entry.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Set a raw entry.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Builder form of [`BackendState::set`].
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    /// Look up an entry which the driver requires to be present.
    pub fn require(&self, engine: &'static str, key: &str) -> Result<&str, StorageError> {
        self.get(key).ok_or_else(|| {
            StorageError::invalid(engine, format!("backend state is missing {key:?}")).build()
        })
    }

    /// Number of bytes committed to the upload target so far.
    pub fn size(&self, engine: &'static str) -> Result<u64, StorageError> {
        let raw = self.require(engine, SIZE)?;
        raw.parse().map_err(|err| {
            StorageError::builder(engine, crate::StorageErrorKind::SerializationError, err)
                .context(format!("backend state size {raw:?}"))
                .build()
        })
    }

    /// Record the committed size.
    pub fn set_size(&mut self, size: u64) {
        self.set(SIZE, size.to_string());
    }

    /// Content type hint recorded when the upload was initiated.
    pub fn content_type(&self) -> &str {
        self.get(CONTENT_TYPE).unwrap_or(DEFAULT_CONTENT_TYPE)
    }

    /// Record the content type hint.
    pub fn set_content_type(&mut self, content_type: Option<&str>) {
        self.set(CONTENT_TYPE, content_type.unwrap_or(DEFAULT_CONTENT_TYPE));
    }
}
