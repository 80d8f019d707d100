//! Content endpoints: ranged reads and optimistic-concurrency writes.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::Extension;
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::protocol::{
    self, EventKind, EventRecord, UploadReply, Visibility, X_EXPECTED_VERSION, X_VERSION,
};
use crate::server::range::{content_range, parse_range};
use crate::server::{AppState, AuthUser};

/// `GET /api/v1/content/{path}`: streams a file body, honoring `Range`
/// and `If-None-Match`, without ever buffering the object in memory.
pub async fn get_content(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
    headers: HeaderMap,
) -> Result<Response> {
    let path = protocol::normalize_path(&path);
    let node = state.meta.get(&path).await?.ok_or_else(|| Error::NotFound(path.clone()))?;
    if node.is_dir {
        return Err(Error::BadRequest(format!("{path} is a directory")));
    }

    let etag = format!("\"{}\"", node.hash);
    if let Some(candidates) = headers.get(header::IF_NONE_MATCH).and_then(|v| v.to_str().ok()) {
        if candidates.split(',').any(|c| c.trim() == etag || c.trim() == "*") {
            return Response::builder()
                .status(StatusCode::NOT_MODIFIED)
                .header(header::ETAG, &etag)
                .header(X_VERSION, node.version.to_string())
                .body(Body::empty())
                .map_err(|err| Error::BadRequest(err.to_string()));
        }
    }

    let size = node.size as u64;
    let range = match headers.get(header::RANGE).and_then(|v| v.to_str().ok()) {
        Some(raw) => parse_range(raw, size)?,
        None => None,
    };

    let reader = state.store.get(&node.storage_key, range).await?;
    let body = Body::from_stream(ReaderStream::new(reader));

    let mut response = Response::builder()
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::ETAG, &etag)
        .header(X_VERSION, node.version.to_string());
    response = match range {
        Some(range) => response
            .status(StatusCode::PARTIAL_CONTENT)
            .header(header::CONTENT_RANGE, content_range(&range, size))
            .header(header::CONTENT_LENGTH, range.len().to_string()),
        None => response.status(StatusCode::OK).header(header::CONTENT_LENGTH, size.to_string()),
    };
    response.body(body).map_err(|err| Error::BadRequest(err.to_string()))
}

/// `POST /api/v1/content/{path}`: whole-body upload with optional
/// `X-Expected-Version` / `If-Match` assertions.
///
/// The version check, version snapshot, primary write and metadata
/// upsert run under the per-path lock inside one transaction; losing
/// writers observe a 409 with the current state.
pub async fn post_content(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    request: Request,
) -> Result<Response> {
    let path = protocol::normalize_path(&path);
    let max = state.config.max_upload_size;

    let headers = request.headers().clone();
    let declared_len = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    if declared_len.is_some_and(|len| len > max) {
        return Err(Error::TooLarge);
    }
    let body = axum::body::to_bytes(request.into_body(), max as usize)
        .await
        .map_err(|_| Error::TooLarge)?;
    let size = body.len() as u64;
    let hash = protocol::sha256_hex(&body);

    let expected_version = match headers.get(X_EXPECTED_VERSION).and_then(|v| v.to_str().ok()) {
        Some(raw) => Some(
            raw.parse::<u64>()
                .map_err(|_| Error::BadRequest(format!("bad {X_EXPECTED_VERSION}: {raw}")))?,
        ),
        None => None,
    };
    let if_match = headers
        .get(header::IF_MATCH)
        .and_then(|v| v.to_str().ok())
        .map(|raw| raw.trim().trim_matches('"').to_string());

    let lock = state.path_lock(&path);
    let _guard = lock.lock().await;

    let mut tx = state.meta.begin().await?;
    let current = state.meta.get_tx(&mut tx, &path).await?;
    if current.as_ref().is_some_and(|c| c.is_dir) {
        return Err(Error::BadRequest(format!("{path} is a directory")));
    }
    let (current_version, current_hash) = current
        .as_ref()
        .map(|c| (c.version as u64, c.hash.clone()))
        .unwrap_or((0, String::new()));

    if expected_version.is_some_and(|v| v != current_version)
        || if_match.as_ref().is_some_and(|h| *h != current_hash)
    {
        debug!(%path, ?expected_version, current_version, "upload rejected as stale");
        return Err(Error::Conflict {
            path,
            expected_version,
            current_version,
            current_hash,
        });
    }

    // Snapshot the state being overwritten before touching the primary key.
    if let Some(current) = current.as_ref().filter(|c| c.size > 0) {
        state
            .meta
            .add_version(&mut tx, &path, current.version as u64, current.size as u64, &current.hash)
            .await?;
        state
            .store
            .copy(&current.storage_key, &protocol::version_key(&path, current.version as u64))
            .await?;
    }

    let new_version = current_version + 1;
    state.store.put(&protocol::storage_key(&path), body).await?;
    state.meta.ensure_parents(&mut tx, &path, &user.id).await?;
    state
        .meta
        .upsert_file(&mut tx, &path, size, &hash, new_version, &user.id, Visibility::Private)
        .await?;
    tx.commit().await?;

    let kind = if current.is_some() { EventKind::Modified } else { EventKind::Created };
    state.broadcaster.publish(&EventRecord::new(kind, &path).with_state(new_version, &hash));
    info!(%path, size, version = new_version, "content stored");

    let reply = UploadReply { path, size, hash, version: new_version };
    Ok((StatusCode::CREATED, Json(reply)).into_response())
}
