//! In-flight upload state persisted between requests.

use serde::{Deserialize, Serialize};
use storage::BackendState;
use uuid::Uuid;

/// How the client intends to deliver the blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UploadMode {
    /// The whole blob in the request that starts the upload. Rejected.
    Monolithic,

    /// A sequence of contiguous chunks over several requests.
    Chunked,
}

/// Identifies who the upload is for. Carried through untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerContext {
    /// Tenant name.
    pub tenant: String,
    /// Project name within the tenant.
    pub project: String,
    /// Repository name within the project.
    pub repository: String,
}

impl OwnerContext {
    /// Build an owner from its three path components.
    pub fn new(
        tenant: impl Into<String>,
        project: impl Into<String>,
        repository: impl Into<String>,
    ) -> Self {
        Self {
            tenant: tenant.into(),
            project: project.into(),
            repository: repository.into(),
        }
    }

    /// `tenant/project/repository`, as it appears in URLs.
    pub fn path(&self) -> String {
        format!("{}/{}/{}", self.tenant, self.project, self.repository)
    }
}

/// One chunked upload in progress.
///
/// `range_end` and `digest_state` always describe the same prefix of the blob,
/// and `backend_state` records the same committed size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadSession {
    /// Handle given to the client in the upload URL.
    pub id: Uuid,
    /// Fixed when the session starts.
    pub mode: UploadMode,
    /// Who the upload belongs to.
    pub owner: OwnerContext,
    /// Bytes committed so far.
    pub range_end: u64,
    /// Encoded [`crate::DigestAccumulator`] at `range_end`.
    #[serde(with = "base64_bytes")]
    pub digest_state: Vec<u8>,
    /// Whatever the storage driver needs to continue the upload.
    pub backend_state: BackendState,
}

impl UploadSession {
    pub(crate) fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub(crate) fn from_bytes(raw: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(raw)
    }
}

mod base64_bytes {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn survives_serialization() {
        let session = UploadSession {
            id: Uuid::new_v4(),
            mode: UploadMode::Chunked,
            owner: OwnerContext::new("acme", "web", "frontend"),
            range_end: 6,
            digest_state: vec![0, 1, 2, 255],
            backend_state: BackendState::new().with("size", "6"),
        };

        let raw = session.to_bytes().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(json["mode"], "chunked");
        assert_eq!(json["digest_state"], "AAEC/w==");

        assert_eq!(UploadSession::from_bytes(&raw).unwrap(), session);
    }

    #[test]
    fn owner_path() {
        assert_eq!(
            OwnerContext::new("acme", "web", "frontend").path(),
            "acme/web/frontend"
        );
    }
}
