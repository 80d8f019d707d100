//! Version endpoints: history listing, historical content and rollback.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::Extension;
use serde::Deserialize;
use tracing::info;

use crate::error::{Error, Result};
use crate::protocol::{
    self, EventKind, EventRecord, RollbackReply, RollbackRequest, VersionEntry, VersionListReply,
    Visibility, X_VERSION, X_VERSION_HASH,
};
use crate::server::{AppState, AuthUser};
use tokio_util::io::ReaderStream;

#[derive(Debug, Deserialize)]
pub struct VersionQuery {
    #[serde(default)]
    v: Option<u64>,
}

/// `GET /api/v1/versions/{path}`: the history listing, or with `?v=N`
/// the body of version N streamed from its backup key.
pub async fn get_versions(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
    Query(query): Query<VersionQuery>,
) -> Result<Response> {
    let path = protocol::normalize_path(&path);
    let node = state.meta.get(&path).await?.ok_or_else(|| Error::NotFound(path.clone()))?;
    if node.is_dir {
        return Err(Error::BadRequest(format!("{path} is a directory")));
    }

    match query.v {
        Some(version) => stream_version(state, &path, version).await,
        None => {
            let mut versions = vec![VersionEntry {
                version: node.version as u64,
                size: node.size as u64,
                hash: node.hash.clone(),
                created_at: node.mod_time(),
            }];
            versions.extend(state.meta.versions(&path).await?.into_iter().map(|row| {
                VersionEntry {
                    version: row.version as u64,
                    size: row.size as u64,
                    hash: row.hash.clone(),
                    created_at: row.created(),
                }
            }));
            let reply = VersionListReply {
                path,
                current_version: node.version as u64,
                versions,
            };
            Ok(Json(reply).into_response())
        }
    }
}

async fn stream_version(state: Arc<AppState>, path: &str, version: u64) -> Result<Response> {
    // The current version lives under the primary key; snapshots live
    // under their backup keys.
    let node = state.meta.get(path).await?.ok_or_else(|| Error::NotFound(path.to_string()))?;
    let (key, size, hash) = if node.version as u64 == version {
        (node.storage_key.clone(), node.size as u64, node.hash.clone())
    } else {
        let row = state
            .meta
            .version(path, version)
            .await?
            .ok_or_else(|| Error::NotFound(format!("{path} version {version}")))?;
        (protocol::version_key(path, version), row.size as u64, row.hash)
    };

    let reader = state.store.get(&key, None).await?;
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CONTENT_LENGTH, size.to_string())
        .header(X_VERSION, version.to_string())
        .header(X_VERSION_HASH, hash)
        .body(Body::from_stream(ReaderStream::new(reader)))
        .map_err(|err| Error::BadRequest(err.to_string()))
}

/// `POST /api/v1/versions/{path}` with `{"version": N}`: restores the
/// content of version N as a brand-new version, so a rollback is itself
/// reversible.
pub async fn post_rollback(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Json(request): Json<RollbackRequest>,
) -> Result<Response> {
    let path = protocol::normalize_path(&path);

    let lock = state.path_lock(&path);
    let _guard = lock.lock().await;

    let mut tx = state.meta.begin().await?;
    let current = state
        .meta
        .get_tx(&mut tx, &path)
        .await?
        .ok_or_else(|| Error::NotFound(path.clone()))?;
    if current.is_dir {
        return Err(Error::BadRequest(format!("{path} is a directory")));
    }
    let target = state
        .meta
        .versions_tx(&mut tx, &path)
        .await?
        .into_iter()
        .find(|row| row.version as u64 == request.version)
        .ok_or_else(|| Error::NotFound(format!("{path} version {}", request.version)))?;

    // Snapshot the pre-rollback state so the rollback can be undone.
    if current.size > 0 {
        state
            .meta
            .add_version(&mut tx, &path, current.version as u64, current.size as u64, &current.hash)
            .await?;
        state
            .store
            .copy(&current.storage_key, &protocol::version_key(&path, current.version as u64))
            .await?;
    }

    let new_version = current.version as u64 + 1;
    state
        .store
        .copy(&protocol::version_key(&path, request.version), &protocol::storage_key(&path))
        .await?;
    state
        .meta
        .upsert_file(
            &mut tx,
            &path,
            target.size as u64,
            &target.hash,
            new_version,
            &user.id,
            Visibility::parse(&current.visibility),
        )
        .await?;
    tx.commit().await?;

    state
        .broadcaster
        .publish(&EventRecord::new(EventKind::Modified, &path).with_state(new_version, &target.hash));
    info!(%path, restored = request.version, version = new_version, "rollback completed");

    let reply = RollbackReply { path, restored_version: request.version, new_version };
    Ok(Json(reply).into_response())
}
