//! Blob operations for the registry

use std::io;
use std::str::FromStr;

use axum::Router;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderName, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use futures::TryStreamExt as _;
use serde::Deserialize;
use storage::Digest;
use tokio_util::io::StreamReader;
use uuid::Uuid;

use crate::api::RegistryState;
use crate::error::{RegistryError, RegistryResult, UploadError};
use crate::session::{OwnerContext, UploadMode};
use crate::upload::ChunkSource;

const DOCKER_UPLOAD_UUID: HeaderName = HeaderName::from_static("docker-upload-uuid");
const DOCKER_CONTENT_DIGEST: HeaderName = HeaderName::from_static("docker-content-digest");
const CHUNK_CONTENT_TYPE: &str = "application/octet-stream";

/// Router for blob operations
pub(crate) fn router() -> Router<RegistryState> {
    use axum::routing::patch;

    Router::new()
        .route(
            "/v2/{tenant}/{project}/{name}/blobs/{digest}",
            get(get_blob).head(head_blob).delete(delete_blob),
        )
        .route(
            "/v2/{tenant}/{project}/{name}/blobs/uploads/",
            post(start_blob_upload),
        )
        .route(
            "/v2/{tenant}/{project}/{name}/blobs/uploads/{uuid}",
            patch(upload_chunk)
                .put(complete_blob_upload)
                .get(upload_status)
                .delete(cancel_blob_upload),
        )
}

type BlobPath = (String, String, String, String);
type UploadPath = (String, String, String, String);

fn owner(tenant: String, project: String, name: String) -> RegistryResult<OwnerContext> {
    for part in [&tenant, &project, &name] {
        validate_repository(part)?;
    }
    Ok(OwnerContext::new(tenant, project, name))
}

fn upload_id(uuid: &str) -> RegistryResult<Uuid> {
    Uuid::parse_str(uuid).map_err(|_| RegistryError::BlobUploadUnknown(uuid.to_string()))
}

#[derive(Debug, Default, Deserialize)]
struct DigestQuery {
    digest: Option<String>,
}

fn upload_location(owner: &OwnerContext, id: Uuid) -> String {
    format!("/v2/{}/blobs/uploads/{}", owner.path(), id)
}

fn blob_location(owner: &OwnerContext, digest: &Digest) -> String {
    format!("/v2/{}/blobs/{}", owner.path(), digest)
}

/// `Range` header value for an upload holding `range_end` bytes.
fn range_header(range_end: u64) -> String {
    format!("0-{}", range_end.saturating_sub(1))
}

fn upload_response(status: StatusCode, owner: &OwnerContext, id: Uuid, range_end: u64) -> Response {
    (
        status,
        [
            (header::LOCATION, upload_location(owner, id)),
            (header::RANGE, range_header(range_end)),
            (DOCKER_UPLOAD_UUID, id.to_string()),
            (header::CONTENT_LENGTH, "0".to_string()),
        ],
    )
        .into_response()
}

fn content_length(headers: &HeaderMap) -> RegistryResult<Option<u64>> {
    headers
        .get(header::CONTENT_LENGTH)
        .map(|value| {
            value
                .to_str()
                .ok()
                .and_then(|value| value.trim().parse().ok())
                .ok_or_else(|| RegistryError::Unsupported("malformed Content-Length".into()))
        })
        .transpose()
}

/// Parse `start-end`, optionally written as `bytes start-end/total`.
fn parse_content_range(value: &str) -> Result<(u64, u64), UploadError> {
    let invalid = || UploadError::InvalidChunk(format!("malformed Content-Range {value:?}"));

    let range = value.trim();
    let range = range.strip_prefix("bytes ").unwrap_or(range);
    let range = range.split_once('/').map_or(range, |(range, _)| range);
    let (start, end) = range.split_once('-').ok_or_else(invalid)?;
    let start: u64 = start.trim().parse().map_err(|_| invalid())?;
    let end: u64 = end.trim().parse().map_err(|_| invalid())?;
    if end < start || end == u64::MAX {
        return Err(invalid());
    }
    Ok((start, end))
}

/// Number of bytes covered by the inclusive range `start-end`.
fn range_length(start: u64, end: u64) -> Option<u64> {
    end.checked_sub(start)?.checked_add(1)
}

/// Chunks are raw bytes. A missing `Content-Type` is accepted.
fn check_chunk_type(headers: &HeaderMap) -> RegistryResult<()> {
    let Some(value) = headers.get(header::CONTENT_TYPE) else {
        return Ok(());
    };
    let essence = value
        .to_str()
        .ok()
        .and_then(|value| value.split(';').next())
        .map(str::trim);
    match essence {
        Some(essence) if essence.eq_ignore_ascii_case(CHUNK_CONTENT_TYPE) => Ok(()),
        _ => Err(RegistryError::Unsupported(format!(
            "chunks must be sent as {CHUNK_CONTENT_TYPE}"
        ))),
    }
}

fn content_range(headers: &HeaderMap) -> RegistryResult<Option<(u64, u64)>> {
    let Some(value) = headers.get(header::CONTENT_RANGE) else {
        return Ok(None);
    };
    let value = value
        .to_str()
        .map_err(|_| UploadError::InvalidChunk("Content-Range is not text".into()))?;
    Ok(Some(parse_content_range(value)?))
}

fn body_reader(body: Body) -> impl tokio::io::AsyncRead + Unpin + Send {
    StreamReader::new(body.into_data_stream().map_err(io::Error::other))
}

fn parse_digest(digest: &str) -> RegistryResult<Digest> {
    Digest::from_str(digest).map_err(|_| RegistryError::InvalidDigest(digest.to_string()))
}

/// Get a blob
async fn get_blob(
    State(state): State<RegistryState>,
    Path((tenant, project, name, digest)): Path<BlobPath>,
) -> RegistryResult<Response> {
    owner(tenant, project, name)?;
    let digest = parse_digest(&digest)?;

    let (data, metadata) = state.uploads.storage().read_blob(&digest).await?;

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, metadata.content_type),
            (DOCKER_CONTENT_DIGEST, digest.to_string()),
        ],
        data,
    )
        .into_response())
}

/// Check if a blob exists
async fn head_blob(
    State(state): State<RegistryState>,
    Path((tenant, project, name, digest)): Path<BlobPath>,
) -> RegistryResult<Response> {
    owner(tenant, project, name)?;
    let digest = parse_digest(&digest)?;

    let metadata = state.uploads.storage().metadata(&digest).await?;

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, metadata.content_type),
            (header::CONTENT_LENGTH, metadata.size.to_string()),
            (DOCKER_CONTENT_DIGEST, digest.to_string()),
        ],
    )
        .into_response())
}

/// Delete a blob
async fn delete_blob(
    State(state): State<RegistryState>,
    Path((tenant, project, name, digest)): Path<BlobPath>,
) -> RegistryResult<StatusCode> {
    owner(tenant, project, name)?;
    let digest = parse_digest(&digest)?;

    state.uploads.storage().delete_blob(&digest).await?;
    Ok(StatusCode::ACCEPTED)
}

/// Start a blob upload session
async fn start_blob_upload(
    State(state): State<RegistryState>,
    Path((tenant, project, name)): Path<(String, String, String)>,
    Query(query): Query<DigestQuery>,
    headers: HeaderMap,
) -> RegistryResult<Response> {
    let owner = owner(tenant, project, name)?;

    if query.digest.is_some() {
        return Err(RegistryError::Unsupported(
            "single request uploads with a digest are not supported".into(),
        ));
    }

    let mode = match content_length(&headers)? {
        Some(0) => UploadMode::Chunked,
        _ => UploadMode::Monolithic,
    };
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok());

    let id = state
        .uploads
        .start_upload(mode, owner.clone(), content_type)
        .await?;

    Ok(upload_response(StatusCode::ACCEPTED, &owner, id, 0))
}

/// Append a chunk to an upload
async fn upload_chunk(
    State(state): State<RegistryState>,
    Path((tenant, project, name, uuid)): Path<UploadPath>,
    headers: HeaderMap,
    body: Body,
) -> RegistryResult<Response> {
    let owner = owner(tenant, project, name)?;
    let id = upload_id(&uuid)?;
    check_chunk_type(&headers)?;
    let length = content_length(&headers)?;
    let range = content_range(&headers)?;

    let mut reader = body_reader(body);
    let range_end = match (range, length) {
        (Some((start, end)), Some(length)) => {
            if range_length(start, end) != Some(length) {
                return Err(UploadError::InvalidChunk(format!(
                    "Content-Range {start}-{end} does not match Content-Length {length}"
                ))
                .into());
            }
            state
                .uploads
                .write_chunk_at(id, start, &mut reader, length)
                .await?
        }
        (None, Some(0)) => state.uploads.range_end(id).await?,
        (None, Some(length)) => state.uploads.write_chunk(id, &mut reader, length).await?,
        (_, None) => {
            return Err(
                UploadError::InvalidChunk("chunk uploads require Content-Length".into()).into(),
            );
        }
    };

    Ok(upload_response(StatusCode::ACCEPTED, &owner, id, range_end))
}

/// Complete a blob upload
async fn complete_blob_upload(
    State(state): State<RegistryState>,
    Path((tenant, project, name, uuid)): Path<UploadPath>,
    Query(query): Query<DigestQuery>,
    headers: HeaderMap,
    body: Body,
) -> RegistryResult<Response> {
    let owner = owner(tenant, project, name)?;
    let id = upload_id(&uuid)?;

    let digest = query
        .digest
        .ok_or_else(|| RegistryError::InvalidDigest("missing digest".to_string()))?;
    let digest = parse_digest(&digest)?;

    let mut reader = body_reader(body);
    let last = match content_length(&headers)? {
        Some(length) if length > 0 => Some((&mut reader as &mut ChunkSource<'_>, length)),
        _ => None,
    };

    let blob = state.uploads.finish_upload(id, last, &digest).await?;

    Ok((
        StatusCode::CREATED,
        [
            (header::LOCATION, blob_location(&owner, &blob.digest)),
            (DOCKER_CONTENT_DIGEST, blob.digest.to_string()),
            (header::CONTENT_LENGTH, "0".to_string()),
        ],
    )
        .into_response())
}

/// Report upload progress
async fn upload_status(
    State(state): State<RegistryState>,
    Path((tenant, project, name, uuid)): Path<UploadPath>,
) -> RegistryResult<Response> {
    let owner = owner(tenant, project, name)?;
    let id = upload_id(&uuid)?;
    let range_end = state.uploads.range_end(id).await?;
    Ok(upload_response(StatusCode::NO_CONTENT, &owner, id, range_end))
}

/// Cancel a blob upload
async fn cancel_blob_upload(
    State(state): State<RegistryState>,
    Path((tenant, project, name, uuid)): Path<UploadPath>,
) -> RegistryResult<StatusCode> {
    owner(tenant, project, name)?;
    let id = upload_id(&uuid)?;
    state.uploads.abort_upload(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Validate repository name
fn validate_repository(name: &str) -> RegistryResult<()> {
    if name.is_empty() || name.contains("..") {
        return Err(RegistryError::InvalidRepository(name.to_string()));
    }
    Ok(())
}
