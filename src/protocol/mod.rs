//! Wire types shared between the tidefs server and client.
//!
//! Everything that crosses the HTTP boundary is defined here: the
//! serialized node tree, mutation events, reply bodies and the custom
//! headers used by the optimistic-concurrency write protocol.

#[cfg(test)]
mod tests;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Header carrying the version a writer observed at open time.
pub const X_EXPECTED_VERSION: &str = "x-expected-version";
/// Header carrying a node's current version on content responses.
pub const X_VERSION: &str = "x-version";
/// Header carrying the hash of a historical version's body.
pub const X_VERSION_HASH: &str = "x-version-hash";

/// Visibility class of a node.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    Group,
    #[default]
    Private,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::Public => "public",
            Visibility::Group => "group",
            Visibility::Private => "private",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "public" => Visibility::Public,
            "group" => Visibility::Group,
            _ => Visibility::Private,
        }
    }
}

/// A node of the metadata tree as serialized on the wire.
///
/// Directories carry an empty `hash` and `size == 0`; files carry a
/// SHA-256 hex hash and a version counter starting at 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub name: String,
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
    pub mod_time: DateTime<Utc>,
    pub hash: String,
    pub version: u64,
    pub visibility: Visibility,
    pub owner_id: String,
    pub group_id: String,
    #[serde(default)]
    pub children: Vec<Node>,
}

impl Node {
    /// Finds a direct child by name.
    pub fn child(&self, name: &str) -> Option<&Node> {
        self.children.iter().find(|c| c.name == name)
    }

    /// Walks the tree to the node at `path`, if present.
    pub fn descend(&self, path: &str) -> Option<&Node> {
        let path = normalize_path(path);
        if self.path == path {
            return Some(self);
        }
        let rest = path.strip_prefix(self.path.trim_end_matches('/'))?;
        if !rest.is_empty() && !rest.starts_with('/') {
            return None;
        }
        let mut node = self;
        for part in rest.split('/').filter(|p| !p.is_empty()) {
            node = node.child(part)?;
        }
        Some(node)
    }
}

/// Kind of a mutation event.
///
/// There is no remote rename primitive, so the server (the only event
/// producer) never observes one: a client rename surfaces as a
/// `Created`/`Modified` for the new path followed by a `Deleted` for
/// the old one.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Created,
    Modified,
    Deleted,
}

/// A server-to-client notification produced on every successful mutation.
///
/// Events are advisory; clients converge through periodic full-tree
/// refreshes even when events are dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub kind: EventKind,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl EventRecord {
    pub fn new(kind: EventKind, path: impl Into<String>) -> Self {
        Self { kind, path: path.into(), version: None, hash: None, timestamp: Utc::now() }
    }

    pub fn with_state(mut self, version: u64, hash: impl Into<String>) -> Self {
        self.version = Some(version);
        self.hash = Some(hash.into());
        self
    }
}

/// Body of the tree endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeReply {
    pub root: Node,
}

/// 201 body of a successful content upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadReply {
    pub path: String,
    pub size: u64,
    pub hash: String,
    pub version: u64,
}

/// 409 body of a rejected optimistic-concurrency write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictReply {
    pub error: String,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_version: Option<u64>,
    pub current_version: u64,
    pub current_hash: String,
}

/// 201 body of a directory creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MkdirReply {
    pub path: String,
    #[serde(rename = "isDir")]
    pub is_dir: bool,
}

/// 200 body of a delete, with the number of removed nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteReply {
    pub path: String,
    pub deleted: u64,
}

/// One historical (or current) state of a file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionEntry {
    pub version: u64,
    pub size: u64,
    pub hash: String,
    pub created_at: DateTime<Utc>,
}

/// 200 body of the version listing, newest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionListReply {
    pub path: String,
    pub current_version: u64,
    pub versions: Vec<VersionEntry>,
}

/// Body of a rollback request.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackRequest {
    pub version: u64,
}

/// 200 body of a completed rollback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackReply {
    pub path: String,
    pub restored_version: u64,
    pub new_version: u64,
}

/// Body of the token endpoint request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRequest {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub device_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: String,
    pub username: String,
}

/// 200 body of the token endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenReply {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub user: UserInfo,
}

/// Generic error body for 4xx/5xx responses that are not conflicts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReply {
    pub error: String,
}

/// Hex-encoded SHA-256 of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Stable node identifier derived from the absolute path.
pub fn node_id(path: &str) -> String {
    let digest = Sha256::digest(normalize_path(path).as_bytes());
    hex::encode(&digest[..8])
}

/// Normalizes a path to the canonical `/a/b` form used as the tree key.
///
/// Ensures exactly one leading slash, no trailing slash (except the root)
/// and no empty, `.` or `..` segments.
pub fn normalize_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len() + 1);
    for part in path.split('/').filter(|p| !p.is_empty() && *p != "." && *p != "..") {
        out.push('/');
        out.push_str(part);
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}

/// Parent path of a normalized path; the root is its own parent.
pub fn parent_path(path: &str) -> String {
    let path = normalize_path(path);
    if path == "/" {
        return path;
    }
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => path[..idx].to_string(),
    }
}

/// Final component of a normalized path; empty for the root.
pub fn file_name(path: &str) -> String {
    let path = normalize_path(path);
    if path == "/" {
        return String::new();
    }
    path.rsplit('/').next().unwrap_or_default().to_string()
}

/// Joins a parent path and a child name.
pub fn join_path(parent: &str, name: &str) -> String {
    let parent = normalize_path(parent);
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

/// Primary storage key of a file node.
pub fn storage_key(path: &str) -> String {
    normalize_path(path).trim_start_matches('/').to_string()
}

/// Backup storage key of `(path, version)` in the version store.
pub fn version_key(path: &str, version: u64) -> String {
    format!("_versions/{}/{}", storage_key(path), version)
}
