//! Tree endpoints: metadata reads, directory creation and deletion.

use std::io::Write;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::Extension;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Deserialize;
use tracing::info;

use crate::error::{Error, Result};
use crate::protocol::{self, DeleteReply, EventKind, EventRecord, MkdirReply, TreeReply};
use crate::server::{AppState, AuthUser};

#[derive(Debug, Deserialize)]
pub struct TreeQuery {
    #[serde(default)]
    path: Option<String>,
}

/// `GET /api/v1/tree[?path=...]`: the serialized tree, from metadata only.
///
/// Never touches the content store. Compressed when the client advertises
/// gzip support.
pub async fn get_tree(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TreeQuery>,
    headers: HeaderMap,
) -> Result<Response> {
    let path = query.path.as_deref().unwrap_or("/");
    let root = state.meta.tree(path).await?;
    let body = serde_json::to_vec(&TreeReply { root })
        .map_err(|err| Error::BadRequest(err.to_string()))?;

    let gzip = headers
        .get(header::ACCEPT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.split(',').any(|enc| enc.trim().starts_with("gzip")));

    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json");
    let body = if gzip {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&body)?;
        response = response.header(header::CONTENT_ENCODING, "gzip");
        encoder.finish()?
    } else {
        body
    };
    response.body(Body::from(body)).map_err(|err| Error::BadRequest(err.to_string()))
}

#[derive(Debug, Deserialize)]
pub struct PutQuery {
    #[serde(rename = "type", default)]
    kind: Option<String>,
}

/// `PUT /api/v1/tree/{path}?type=dir`: idempotent directory upsert.
pub async fn put_tree(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
    Query(query): Query<PutQuery>,
    Extension(AuthUser(user)): Extension<AuthUser>,
) -> Result<Response> {
    if query.kind.as_deref() != Some("dir") {
        return Err(Error::BadRequest("only type=dir is supported".into()));
    }
    let path = protocol::normalize_path(&path);
    if let Some(existing) = state.meta.get(&path).await? {
        if !existing.is_dir {
            return Err(Error::BadRequest(format!("{path} exists and is a file")));
        }
        let reply = MkdirReply { path, is_dir: true };
        return Ok((StatusCode::CREATED, Json(reply)).into_response());
    }

    let lock = state.path_lock(&path);
    let _guard = lock.lock().await;
    let mut tx = state.meta.begin().await?;
    state.meta.ensure_parents(&mut tx, &path, &user.id).await?;
    state.meta.upsert_dir(&mut tx, &path, &user.id).await?;
    tx.commit().await?;

    state.broadcaster.publish(&EventRecord::new(EventKind::Created, &path));
    info!(%path, "directory created");
    Ok((StatusCode::CREATED, Json(MkdirReply { path, is_dir: true })).into_response())
}

/// `DELETE /api/v1/tree/{path}`: removes a file, or a directory and all
/// of its descendants, together with their content and version objects.
pub async fn delete_tree(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
) -> Result<Response> {
    let path = protocol::normalize_path(&path);

    let lock = state.path_lock(&path);
    let _guard = lock.lock().await;

    let mut tx = state.meta.begin().await?;
    if state.meta.get_tx(&mut tx, &path).await?.is_none() {
        return Err(Error::NotFound(path));
    }

    // Version rows cascade with the file rows, so collect the backup
    // keys to purge before the metadata goes away.
    let mut version_keys = Vec::new();
    for row in state.meta.subtree_tx(&mut tx, &path).await? {
        if row.is_dir {
            continue;
        }
        for version in state.meta.versions_tx(&mut tx, &row.path).await? {
            version_keys.push(protocol::version_key(&row.path, version.version as u64));
        }
    }
    let removed = state.meta.delete_subtree(&mut tx, &path).await?;
    tx.commit().await?;

    // Object cleanup happens after the metadata commit; a crash here
    // leaves orphan objects for the background sweep, never dangling
    // metadata.
    for row in removed.iter().filter(|r| !r.is_dir && !r.storage_key.is_empty()) {
        state.store.delete(&row.storage_key).await?;
    }
    for key in version_keys {
        state.store.delete(&key).await?;
    }

    state.broadcaster.publish(&EventRecord::new(EventKind::Deleted, &path));
    info!(%path, deleted = removed.len(), "subtree deleted");
    Ok(Json(DeleteReply { path, deleted: removed.len() as u64 }).into_response())
}
