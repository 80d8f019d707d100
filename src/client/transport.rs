//! HTTP transport to the tidefs server: retry with backoff, offline
//! detection and typed request helpers.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bytes::Bytes;
use rand::Rng;
use reqwest::{header, Response, StatusCode};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::protocol::{
    ConflictReply, DeleteReply, MkdirReply, Node, RollbackReply, RollbackRequest, TokenReply,
    TokenRequest, TreeReply, UploadReply, VersionListReply, X_EXPECTED_VERSION, X_VERSION,
};
use crate::store::ByteRange;

/// First backoff delay for retried idempotent requests.
const BACKOFF_BASE: Duration = Duration::from_millis(200);
/// Backoff ceiling.
const BACKOFF_CAP: Duration = Duration::from_secs(5);
/// Default attempt count for idempotent requests.
pub const DEFAULT_ATTEMPTS: u32 = 5;
/// Default per-request deadline.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Deadline for requests whose body streams for the transfer duration
/// (hydration downloads, uploads).
pub const TRANSFER_TIMEOUT: Duration = Duration::from_secs(3600);
/// Deadline of a single health probe.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
/// Consecutive probe failures before the transport flips offline.
const OFFLINE_THRESHOLD: u32 = 2;

/// Parsed headers of a content response, plus its streaming body.
pub struct ContentResponse {
    pub version: u64,
    pub hash: String,
    pub partial: bool,
    pub response: Response,
}

/// Shared HTTP client for all client-side workers.
pub struct Transport {
    http: reqwest::Client,
    base: String,
    token: Option<String>,
    attempts: u32,
    online: watch::Sender<bool>,
    /// Pinged when connectivity returns, so the tree refresher can
    /// resynchronize immediately instead of waiting a full interval.
    pub recovered: Notify,
}

impl Transport {
    pub fn new(server: &str, token: Option<String>) -> Result<Arc<Self>> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        let (online, _) = watch::channel(true);
        Ok(Arc::new(Self {
            http,
            base: server.trim_end_matches('/').to_string(),
            token,
            attempts: DEFAULT_ATTEMPTS,
            online,
            recovered: Notify::new(),
        }))
    }

    fn url(&self, suffix: &str) -> String {
        format!("{}{}", self.base, suffix)
    }

    fn endpoint(&self, kind: &str, path: &str) -> String {
        self.url(&format!("/api/v1/{kind}{path}"))
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// The user id baked into the bearer token, if any.
    ///
    /// Decoded without verification; the server remains the authority.
    /// Used only to decide which files getattr reports as writable.
    pub fn user_id(&self) -> Option<String> {
        let token = self.token.as_deref()?;
        let payload = token.split('.').nth(1)?;
        let decoded = URL_SAFE_NO_PAD.decode(payload).ok()?;
        let value: serde_json::Value = serde_json::from_slice(&decoded).ok()?;
        value.get("sub").and_then(|s| s.as_str()).map(str::to_string)
    }

    pub fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    pub fn online_watch(&self) -> watch::Receiver<bool> {
        self.online.subscribe()
    }

    fn set_online(&self, online: bool) {
        let was = *self.online.borrow();
        if was != online {
            if online {
                info!("server reachable again, leaving offline mode");
                self.recovered.notify_waiters();
            } else {
                warn!("server unreachable, entering offline mode");
            }
            self.online.send_replace(online);
        }
    }

    fn require_online(&self) -> Result<()> {
        if self.is_online() {
            Ok(())
        } else {
            Err(Error::Offline)
        }
    }

    /// Runs `f` up to the configured attempt count, backing off
    /// exponentially with full jitter between attempts. Only transport
    /// and 5xx failures are retried.
    async fn retrying<T, F, Fut>(&self, what: &str, f: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut delay = BACKOFF_BASE;
        let mut attempt = 1;
        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.attempts => {
                    let jittered =
                        Duration::from_millis(rand::thread_rng().gen_range(0..=delay.as_millis() as u64));
                    debug!(what, attempt, delay = ?jittered, error = %err, "retrying request");
                    sleep(jittered).await;
                    delay = (delay * 2).min(BACKOFF_CAP);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Single reachability probe against `/health`.
    pub async fn probe(&self) -> bool {
        let request = self.http.get(self.url("/health")).timeout(PROBE_TIMEOUT);
        matches!(request.send().await, Ok(response) if response.status().is_success())
    }

    /// Exchanges credentials for a token. Does not require an existing
    /// token and is never retried (it is a POST).
    pub async fn login(
        server: &str,
        username: &str,
        password: &str,
        device_name: &str,
    ) -> Result<TokenReply> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        let response = http
            .post(format!("{}/api/v1/auth/token", server.trim_end_matches('/')))
            .json(&TokenRequest {
                username: username.to_string(),
                password: password.to_string(),
                device_name: device_name.to_string(),
            })
            .send()
            .await?;
        let response = check_status(response).await?;
        Ok(response.json().await?)
    }

    /// Fetches the full tree (or a subtree).
    pub async fn fetch_tree(&self, path: Option<&str>) -> Result<Node> {
        self.retrying("fetch_tree", || async {
            let mut request = self.authorized(self.http.get(self.url("/api/v1/tree")));
            if let Some(path) = path {
                request = request.query(&[("path", path)]);
            }
            let response = check_status(request.send().await?).await?;
            let reply: TreeReply = response.json().await?;
            Ok(reply.root)
        })
        .await
    }

    /// Opens a content read, optionally ranged. The body is left
    /// unconsumed so callers can stream it to disk.
    pub async fn get_content(&self, path: &str, range: Option<ByteRange>) -> Result<ContentResponse> {
        self.retrying("get_content", || async {
            let mut request = self
                .authorized(self.http.get(self.endpoint("content", path)))
                .timeout(TRANSFER_TIMEOUT);
            if let Some(range) = range {
                request = request.header(header::RANGE, range.to_header());
            }
            let response = check_status(request.send().await?).await?;
            let partial = response.status() == StatusCode::PARTIAL_CONTENT;
            let version = header_u64(&response, X_VERSION).unwrap_or_default();
            let hash = response
                .headers()
                .get(header::ETAG)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.trim_matches('"').to_string())
                .unwrap_or_default();
            Ok(ContentResponse { version, hash, partial, response })
        })
        .await
    }

    /// Uploads a whole file body. POSTs are never retried automatically;
    /// the version headers exist precisely so a blind replay cannot
    /// silently clobber a concurrent writer.
    pub async fn upload(
        &self,
        path: &str,
        data: Bytes,
        expected_version: Option<u64>,
        if_match: Option<&str>,
    ) -> Result<UploadReply> {
        self.require_online()?;
        let mut request = self
            .authorized(self.http.post(self.endpoint("content", path)))
            .timeout(TRANSFER_TIMEOUT)
            .body(data);
        if let Some(version) = expected_version {
            request = request.header(X_EXPECTED_VERSION, version.to_string());
        }
        if let Some(hash) = if_match {
            request = request.header(header::IF_MATCH, format!("\"{hash}\""));
        }
        let response = check_status(request.send().await?).await?;
        Ok(response.json().await?)
    }

    /// Creates a directory; idempotent, so retried like a GET.
    pub async fn mkdir(&self, path: &str) -> Result<MkdirReply> {
        self.require_online()?;
        self.retrying("mkdir", || async {
            let request = self
                .authorized(self.http.put(self.endpoint("tree", path)))
                .query(&[("type", "dir")]);
            let response = check_status(request.send().await?).await?;
            Ok(response.json().await?)
        })
        .await
    }

    /// Deletes a file or directory subtree.
    pub async fn delete(&self, path: &str) -> Result<DeleteReply> {
        self.require_online()?;
        self.retrying("delete", || async {
            let request = self.authorized(self.http.delete(self.endpoint("tree", path)));
            let response = check_status(request.send().await?).await?;
            Ok(response.json().await?)
        })
        .await
    }

    /// Lists the version history of a file.
    pub async fn versions(&self, path: &str) -> Result<VersionListReply> {
        self.retrying("versions", || async {
            let request = self.authorized(self.http.get(self.endpoint("versions", path)));
            let response = check_status(request.send().await?).await?;
            Ok(response.json().await?)
        })
        .await
    }

    /// Restores a historical version as a new version.
    pub async fn rollback(&self, path: &str, version: u64) -> Result<RollbackReply> {
        self.require_online()?;
        let request = self
            .authorized(self.http.post(self.endpoint("versions", path)))
            .json(&RollbackRequest { version });
        let response = check_status(request.send().await?).await?;
        Ok(response.json().await?)
    }

    /// Opens the server-sent event stream. The caller owns reconnects.
    pub async fn open_events(&self) -> Result<Response> {
        let request = self
            .authorized(self.http.get(self.url("/api/v1/events")))
            .header(header::ACCEPT, "text/event-stream")
            .timeout(Duration::from_secs(3600 * 24));
        let response = check_status(request.send().await?).await?;
        Ok(response)
    }
}

fn header_u64(response: &Response, name: &str) -> Option<u64> {
    response.headers().get(name)?.to_str().ok()?.parse().ok()
}

/// Maps non-success statuses to crate errors, consuming error bodies.
async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() || status == StatusCode::NOT_MODIFIED {
        return Ok(response);
    }
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Err(Error::Unauthorized("server rejected credentials".into()))
        }
        StatusCode::NOT_FOUND => {
            let path = response.url().path().to_string();
            Err(Error::NotFound(path))
        }
        StatusCode::CONFLICT => {
            let conflict: ConflictReply = response.json().await?;
            Err(Error::Conflict {
                path: conflict.path,
                expected_version: conflict.expected_version,
                current_version: conflict.current_version,
                current_hash: conflict.current_hash,
            })
        }
        StatusCode::PAYLOAD_TOO_LARGE => Err(Error::TooLarge),
        StatusCode::RANGE_NOT_SATISFIABLE => Err(Error::RangeNotSatisfiable { size: 0 }),
        status if status.is_server_error() => match response.error_for_status() {
            // surfaced as a retryable transport error
            Err(err) => Err(Error::Transport(err)),
            Ok(_) => Err(Error::BadRequest(format!("unexpected status {status}"))),
        },
        _ => {
            let body = response.text().await.unwrap_or_default();
            Err(Error::BadRequest(format!("{status}: {body}")))
        }
    }
}

/// Periodic reachability worker; flips the shared offline flag after
/// [`OFFLINE_THRESHOLD`] consecutive failures and back on the first
/// success.
pub struct HealthProbe {
    transport: Arc<Transport>,
    interval: Duration,
}

impl HealthProbe {
    pub fn spawn(transport: Arc<Transport>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(Self { transport, interval }.run())
    }

    async fn run(self) {
        let mut failures: u32 = 0;
        loop {
            sleep(self.interval).await;
            if self.transport.probe().await {
                failures = 0;
                self.transport.set_online(true);
            } else {
                failures += 1;
                debug!(failures, "health probe failed");
                if failures >= OFFLINE_THRESHOLD {
                    self.transport.set_online(false);
                }
            }
        }
    }
}
