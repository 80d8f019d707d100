//! HTTP server: routing, shared state, auth middleware and error mapping.

mod auth;
mod content;
mod events;
pub mod range;
mod tree;
mod versions;

#[cfg(test)]
mod tests;

pub use auth::{AuthProvider, TokenAuth};

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{error, info, info_span, Instrument};

use crate::config::{ContentBackend, ServerConfig};
use crate::error::{Error, Result};
use crate::events::Broadcaster;
use crate::meta::MetaStore;
use crate::protocol::{ConflictReply, ErrorReply, TokenRequest, UserInfo};
use crate::store::{LocalStore, ObjectStore, S3Store};

/// Authenticated user attached to each request by the auth middleware.
#[derive(Debug, Clone)]
pub struct AuthUser(pub UserInfo);

/// Shared state behind every handler.
pub struct AppState {
    pub config: ServerConfig,
    pub meta: MetaStore,
    pub store: Arc<dyn ObjectStore>,
    pub broadcaster: Broadcaster,
    pub auth: Arc<dyn AuthProvider>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl AppState {
    pub fn new(
        config: ServerConfig,
        meta: MetaStore,
        store: Arc<dyn ObjectStore>,
        auth: Arc<dyn AuthProvider>,
    ) -> Self {
        Self { config, meta, store, broadcaster: Broadcaster::default(), auth, locks: DashMap::new() }
    }

    /// Per-path write lock serializing the check / snapshot / write /
    /// upsert sequence. Held across the whole mutation transaction; the
    /// SQLite equivalent of a row-level `SELECT ... FOR UPDATE`.
    pub fn path_lock(&self, path: &str) -> Arc<Mutex<()>> {
        self.locks.entry(path.to_string()).or_default().clone()
    }
}

/// Builds the full router over `state`.
pub fn router(state: Arc<AppState>) -> Router {
    let protected = Router::new()
        .route("/api/v1/tree", get(tree::get_tree))
        .route("/api/v1/tree/{*path}", axum::routing::put(tree::put_tree).delete(tree::delete_tree))
        .route("/api/v1/content/{*path}", get(content::get_content).post(content::post_content))
        .route(
            "/api/v1/versions/{*path}",
            get(versions::get_versions).post(versions::post_rollback),
        )
        .route("/api/v1/events", get(events::subscribe))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route("/health", get(health))
        .route("/api/v1/auth/token", post(token))
        .merge(protected)
        .layer(middleware::from_fn(request_span))
        .with_state(state)
}

/// Starts the server and blocks until ctrl-c.
pub async fn serve(config: ServerConfig) -> Result<()> {
    let meta = MetaStore::open(&config.database_url).await?;
    let store: Arc<dyn ObjectStore> = match config.content_backend {
        ContentBackend::Local => Arc::new(LocalStore::open(&config.local_storage_path).await?),
        ContentBackend::S3 => Arc::new(S3Store::new(&config.s3)?),
    };
    let auth = Arc::new(TokenAuth::new(&config.jwt_secret));
    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .map_err(|_| Error::BadRequest(format!("invalid listen_addr: {}", config.listen_addr)))?;
    let tls = config.tls_enabled();
    let state = Arc::new(AppState::new(config, meta, store, auth));
    let app = router(state.clone());

    let handle = Handle::new();
    let shutdown = handle.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
        shutdown.graceful_shutdown(Some(std::time::Duration::from_secs(5)));
    });

    info!(%addr, tls, "tidefs server listening");
    if tls {
        let rustls = RustlsConfig::from_pem_file(
            &state.config.tls_cert_file,
            &state.config.tls_key_file,
        )
        .await?;
        axum_server::bind_rustls(addr, rustls)
            .handle(handle)
            .serve(app.into_make_service())
            .await?;
    } else {
        axum_server::bind(addr).handle(handle).serve(app.into_make_service()).await?;
    }
    Ok(())
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn token(
    State(state): State<Arc<AppState>>,
    Json(request): Json<TokenRequest>,
) -> Result<Response> {
    let reply = state
        .auth
        .authenticate(&request.username, &request.password, &request.device_name)
        .await?;
    Ok(Json(reply).into_response())
}

async fn require_auth(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Response {
    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    let user = match token {
        Some(token) => match state.auth.verify(token) {
            Ok(user) => user,
            Err(err) => return err.into_response(),
        },
        None => return Error::Unauthorized("missing bearer token".into()).into_response(),
    };
    request.extensions_mut().insert(AuthUser(user));
    next.run(request).await
}

async fn request_span(request: Request, next: Next) -> Response {
    let id = uuid::Uuid::new_v4().simple().to_string();
    let span = info_span!(
        "request",
        id = %&id[..8],
        method = %request.method(),
        path = %request.uri().path(),
    );
    next.run(request).instrument(span).await
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Conflict { .. } => StatusCode::CONFLICT,
            Error::BadRequest(_) => StatusCode::BAD_REQUEST,
            Error::RangeNotSatisfiable { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            Error::TooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Error::Database(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(error = %self, "request failed");
        }
        match self {
            Error::Conflict { path, expected_version, current_version, current_hash } => (
                StatusCode::CONFLICT,
                Json(ConflictReply {
                    error: "version conflict".into(),
                    path,
                    expected_version,
                    current_version,
                    current_hash,
                }),
            )
                .into_response(),
            Error::RangeNotSatisfiable { size } => (
                StatusCode::RANGE_NOT_SATISFIABLE,
                [(header::CONTENT_RANGE, range::unsatisfiable_range(size))],
                Json(ErrorReply { error: "range not satisfiable".into() }),
            )
                .into_response(),
            other => (status, Json(ErrorReply { error: other.to_string() })).into_response(),
        }
    }
}
