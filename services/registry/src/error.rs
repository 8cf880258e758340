//! Error types for the registry

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use storage::{Digest, StorageError};
use uuid::Uuid;

use crate::store::SessionStoreError;

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Failures of the upload session lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    /// The request asks for an upload style this registry does not accept.
    #[error("unsupported upload: {0}")]
    Unsupported(String),

    /// The chunk's declared range or length is malformed.
    #[error("invalid chunk: {0}")]
    InvalidChunk(String),

    /// The chunk does not start where the upload currently ends.
    #[error("chunk starts at byte {actual}, upload is at byte {expected}")]
    OutOfOrder {
        /// Current end of the upload.
        expected: u64,
        /// Start offset the client sent.
        actual: u64,
    },

    /// The body ended before the declared length was read.
    #[error("chunk declared {declared} bytes, received {received}")]
    ShortRead {
        /// Declared chunk length.
        declared: u64,
        /// Bytes actually read.
        received: u64,
    },

    /// No live session has this id.
    #[error("upload session {0} not found")]
    SessionNotFound(Uuid),

    /// The uploaded bytes do not hash to the digest the client declared.
    #[error("digest mismatch: expected {expected}, computed {actual}")]
    DigestMismatch {
        /// Digest the client declared.
        expected: Digest,
        /// Digest of the bytes received.
        actual: Digest,
    },

    /// Another request holds this session.
    #[error("upload session {0} is in use by another request")]
    ConcurrentAccess(Uuid),

    /// The storage driver failed.
    #[error("storage backend: {0}")]
    Backend(#[from] StorageError),

    /// The session store failed.
    #[error("session store: {0}")]
    Store(#[from] SessionStoreError),

    /// A stored session could not be decoded.
    #[error("upload session {id} is corrupt: {reason}")]
    CorruptState {
        /// Session id.
        id: Uuid,
        /// What failed to decode.
        reason: String,
    },
}

/// Error types for registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Blob not found
    #[error("blob not found: {0}")]
    BlobNotFound(String),

    /// Upload session not found or expired
    #[error("blob upload unknown: {0}")]
    BlobUploadUnknown(String),

    /// Invalid digest format
    #[error("invalid digest: {0}")]
    InvalidDigest(String),

    /// Digest mismatch
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch {
        /// Expected digest
        expected: String,
        /// Actual digest
        actual: String,
    },

    /// Invalid repository name
    #[error("invalid repository name: {0}")]
    InvalidRepository(String),

    /// Unsupported request shape
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Chunk does not continue the upload
    #[error("range not satisfiable: {0}")]
    RangeNotSatisfiable(String),

    /// Another request is writing to this upload
    #[error("blob upload busy: {0}")]
    UploadBusy(String),

    /// Storage error
    #[error("storage error: {0}")]
    Storage(StorageError),

    /// Internal failure
    #[error("internal error: {0}")]
    Internal(String),
}

impl RegistryError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            RegistryError::BlobNotFound(_) | RegistryError::BlobUploadUnknown(_) => {
                StatusCode::NOT_FOUND
            }
            RegistryError::InvalidDigest(_)
            | RegistryError::DigestMismatch { .. }
            | RegistryError::InvalidRepository(_)
            | RegistryError::Unsupported(_) => StatusCode::BAD_REQUEST,
            RegistryError::RangeNotSatisfiable(_) => StatusCode::RANGE_NOT_SATISFIABLE,
            RegistryError::UploadBusy(_) => StatusCode::CONFLICT,
            RegistryError::Storage(_) | RegistryError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Get the error code for OCI error responses
    pub fn error_code(&self) -> &'static str {
        match self {
            RegistryError::BlobNotFound(_) => "BLOB_UNKNOWN",
            RegistryError::BlobUploadUnknown(_) => "BLOB_UPLOAD_UNKNOWN",
            RegistryError::InvalidDigest(_) | RegistryError::DigestMismatch { .. } => {
                "DIGEST_INVALID"
            }
            RegistryError::InvalidRepository(_) => "NAME_INVALID",
            RegistryError::Unsupported(_) => "UNSUPPORTED",
            RegistryError::RangeNotSatisfiable(_) | RegistryError::UploadBusy(_) => {
                "BLOB_UPLOAD_INVALID"
            }
            RegistryError::Storage(_) | RegistryError::Internal(_) => "UNKNOWN",
        }
    }
}

impl From<StorageError> for RegistryError {
    fn from(error: StorageError) -> Self {
        if error.is_not_found() {
            let what = error
                .digest()
                .or(error.context())
                .unwrap_or("unknown")
                .to_owned();
            RegistryError::BlobNotFound(what)
        } else {
            RegistryError::Storage(error)
        }
    }
}

impl From<UploadError> for RegistryError {
    fn from(error: UploadError) -> Self {
        match error {
            UploadError::Unsupported(reason) => RegistryError::Unsupported(reason),
            error @ (UploadError::InvalidChunk(_) | UploadError::ShortRead { .. }) => {
                RegistryError::Unsupported(error.to_string())
            }
            error @ UploadError::OutOfOrder { .. } => {
                RegistryError::RangeNotSatisfiable(error.to_string())
            }
            UploadError::SessionNotFound(id) => RegistryError::BlobUploadUnknown(id.to_string()),
            UploadError::DigestMismatch { expected, actual } => RegistryError::DigestMismatch {
                expected: expected.to_string(),
                actual: actual.to_string(),
            },
            UploadError::ConcurrentAccess(id) => RegistryError::UploadBusy(id.to_string()),
            UploadError::Backend(error) if error.is_not_found() => {
                RegistryError::BlobUploadUnknown(error.upload().unwrap_or("unknown").to_owned())
            }
            UploadError::Backend(error) => RegistryError::Storage(error),
            error @ (UploadError::Store(_) | UploadError::CorruptState { .. }) => {
                RegistryError::Internal(error.to_string())
            }
        }
    }
}

/// OCI error response format
#[derive(Debug, serde::Serialize)]
struct ErrorResponse {
    errors: Vec<ErrorDetail>,
}

#[derive(Debug, serde::Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

impl IntoResponse for RegistryError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.error_code();
        let message = self.to_string();

        if status.is_server_error() {
            tracing::error!(code, error = %message, "request failed");
        } else {
            tracing::debug!(code, error = %message, "request rejected");
        }

        let body = ErrorResponse {
            errors: vec![ErrorDetail { code, message }],
        };

        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_errors_map_to_oci_codes() {
        let id = Uuid::nil();
        let cases = [
            (
                UploadError::OutOfOrder {
                    expected: 5,
                    actual: 0,
                },
                StatusCode::RANGE_NOT_SATISFIABLE,
                "BLOB_UPLOAD_INVALID",
            ),
            (
                UploadError::ConcurrentAccess(id),
                StatusCode::CONFLICT,
                "BLOB_UPLOAD_INVALID",
            ),
            (
                UploadError::SessionNotFound(id),
                StatusCode::NOT_FOUND,
                "BLOB_UPLOAD_UNKNOWN",
            ),
            (
                UploadError::InvalidChunk("bad range".into()),
                StatusCode::BAD_REQUEST,
                "UNSUPPORTED",
            ),
            (
                UploadError::CorruptState {
                    id,
                    reason: "truncated".into(),
                },
                StatusCode::INTERNAL_SERVER_ERROR,
                "UNKNOWN",
            ),
        ];

        for (error, status, code) in cases {
            let error = RegistryError::from(error);
            assert_eq!(error.status_code(), status, "{error}");
            assert_eq!(error.error_code(), code, "{error}");
        }
    }

    #[test]
    fn missing_blob_is_blob_unknown() {
        let digest = Digest::sha256([7; 32]);
        let error = StorageError::not_found("memory", "no such blob")
            .digest(&digest)
            .build();
        let error = RegistryError::from(error);
        assert_eq!(error.error_code(), "BLOB_UNKNOWN");
        assert_eq!(error.status_code(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn failing_backend_is_a_server_error() {
        let error = StorageError::io("local", std::io::Error::other("no space left on device"))
            .context("append chunk")
            .build();
        let error = RegistryError::from(UploadError::Backend(error));
        assert_eq!(error.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(error.error_code(), "UNKNOWN");

        let error = RegistryError::from(UploadError::ShortRead {
            declared: 4,
            received: 1,
        });
        assert_eq!(error.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(error.error_code(), "UNSUPPORTED");
    }
}
