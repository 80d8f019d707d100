//! Client-side mirror of the server's metadata tree.
//!
//! The mirror is the adapter's single source of truth for metadata
//! operations. It converges through three inputs: full-tree refreshes
//! (periodic, and immediately after offline recovery), server-pushed
//! events, and locally applied mutations after successful writes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::warn;

use crate::client::transport::Transport;
use crate::protocol::{self, EventKind, EventRecord, Node, Visibility};

/// Flat view of one node, cheap to clone out of the mirror.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeInfo {
    pub id: String,
    pub name: String,
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
    pub mod_time: DateTime<Utc>,
    pub hash: String,
    pub version: u64,
    pub owner_id: String,
}

impl NodeInfo {
    fn from_node(node: &Node) -> Self {
        Self {
            id: node.id.clone(),
            name: node.name.clone(),
            path: node.path.clone(),
            is_dir: node.is_dir,
            size: node.size,
            mod_time: node.mod_time,
            hash: node.hash.clone(),
            version: node.version,
            owner_id: node.owner_id.clone(),
        }
    }
}

/// One readdir row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
}

/// Shared metadata snapshot.
pub struct Mirror {
    root: RwLock<Option<Node>>,
    loaded: AtomicBool,
}

impl Default for Mirror {
    fn default() -> Self {
        Self::new()
    }
}

impl Mirror {
    pub fn new() -> Self {
        Self { root: RwLock::new(None), loaded: AtomicBool::new(false) }
    }

    /// Whether at least one full tree fetch has succeeded.
    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    /// Installs a freshly fetched tree.
    pub fn replace(&self, root: Node) {
        *self.root.write().unwrap() = Some(root);
        self.loaded.store(true, Ordering::Release);
    }

    /// Metadata of the node at `path`. Pure in-memory lookup.
    pub fn get(&self, path: &str) -> Option<NodeInfo> {
        let guard = self.root.read().unwrap();
        guard.as_ref()?.descend(path).map(NodeInfo::from_node)
    }

    /// Resolves `name` inside `parent`. Pure in-memory lookup.
    pub fn lookup(&self, parent: &str, name: &str) -> Option<NodeInfo> {
        let guard = self.root.read().unwrap();
        guard.as_ref()?.descend(parent)?.child(name).map(NodeInfo::from_node)
    }

    /// Ordered child listing of a directory. Pure in-memory lookup.
    pub fn read_dir(&self, path: &str) -> Option<Vec<DirEntry>> {
        let guard = self.root.read().unwrap();
        let dir = guard.as_ref()?.descend(path)?;
        Some(
            dir.children
                .iter()
                .map(|c| DirEntry { name: c.name.clone(), is_dir: c.is_dir })
                .collect(),
        )
    }

    /// Records a file state locally, creating missing ancestors. Called
    /// after a successful upload so the tree reflects the write without
    /// waiting for the next refresh.
    pub fn record_file(&self, path: &str, size: u64, hash: &str, version: u64) {
        let mut guard = self.root.write().unwrap();
        let Some(root) = guard.as_mut() else { return };
        let node = make_file(path, size, hash, version);
        insert(root, node);
    }

    /// Records a directory locally (idempotent).
    pub fn record_dir(&self, path: &str) {
        let mut guard = self.root.write().unwrap();
        let Some(root) = guard.as_mut() else { return };
        insert(root, make_dir(path));
    }

    /// Drops the node at `path` (and any subtree below it).
    pub fn remove(&self, path: &str) {
        let mut guard = self.root.write().unwrap();
        let Some(root) = guard.as_mut() else { return };
        let path = protocol::normalize_path(path);
        let parent = protocol::parent_path(&path);
        let name = protocol::file_name(&path);
        if let Some(dir) = find_mut(root, &parent) {
            dir.children.retain(|c| c.name != name);
        }
    }

    /// Applies a pushed event. Events are advisory: anything surprising
    /// is applied best-effort and trued up by the next refresh.
    pub fn apply_event(&self, event: &EventRecord) {
        match event.kind {
            EventKind::Created | EventKind::Modified => {
                match (event.version, event.hash.as_deref()) {
                    (Some(version), Some(hash)) => {
                        // size is not carried by events; keep the old size
                        // until the next refresh when the hash changed
                        let mut guard = self.root.write().unwrap();
                        let Some(root) = guard.as_mut() else { return };
                        let path = protocol::normalize_path(&event.path);
                        match find_mut(root, &path) {
                            Some(node) => {
                                node.hash = hash.to_string();
                                node.version = version;
                                node.mod_time = event.timestamp;
                            }
                            None => insert(root, make_file(&path, 0, hash, version)),
                        }
                    }
                    _ => {
                        // a directory creation
                        self.record_dir(&event.path);
                    }
                }
            }
            EventKind::Deleted => self.remove(&event.path),
        }
    }
}

fn make_file(path: &str, size: u64, hash: &str, version: u64) -> Node {
    let path = protocol::normalize_path(path);
    Node {
        id: protocol::node_id(&path),
        name: protocol::file_name(&path),
        path: path.clone(),
        is_dir: false,
        size,
        mod_time: Utc::now(),
        hash: hash.to_string(),
        version,
        visibility: Visibility::Private,
        owner_id: String::new(),
        group_id: String::new(),
        children: Vec::new(),
    }
}

fn make_dir(path: &str) -> Node {
    let mut node = make_file(path, 0, "", 0);
    node.is_dir = true;
    node.version = 0;
    node.hash = String::new();
    node
}

fn find_mut<'a>(root: &'a mut Node, path: &str) -> Option<&'a mut Node> {
    let path = protocol::normalize_path(path);
    if root.path == path {
        return Some(root);
    }
    let rest = path.strip_prefix(root.path.trim_end_matches('/'))?;
    if !rest.is_empty() && !rest.starts_with('/') {
        return None;
    }
    let mut node = root;
    for part in rest.split('/').filter(|p| !p.is_empty()) {
        node = node.children.iter_mut().find(|c| c.name == part)?;
    }
    Some(node)
}

/// Inserts `node`, creating missing ancestor directories, keeping each
/// sibling list in the server's order (directories first, then name).
fn insert(root: &mut Node, node: Node) {
    if node.path == root.path {
        return;
    }
    let parent = protocol::parent_path(&node.path);
    if find_mut(root, &parent).is_none() {
        insert(root, make_dir(&parent));
    }
    let Some(dir) = find_mut(root, &parent) else { return };
    if let Some(existing) = dir.children.iter_mut().find(|c| c.name == node.name) {
        existing.size = node.size;
        existing.hash = node.hash;
        existing.version = node.version;
        existing.mod_time = node.mod_time;
        return;
    }
    dir.children.push(node);
    dir.children.sort_by(|a, b| b.is_dir.cmp(&a.is_dir).then_with(|| a.name.cmp(&b.name)));
}

/// Background worker converging the mirror.
///
/// Wakes on the refresh interval and whenever the transport reports
/// recovery from offline; either way it performs a full tree fetch.
pub struct TreeRefresher {
    transport: Arc<Transport>,
    mirror: Arc<Mirror>,
    interval: Duration,
}

impl TreeRefresher {
    pub fn spawn(
        transport: Arc<Transport>,
        mirror: Arc<Mirror>,
        interval: Duration,
    ) -> JoinHandle<()> {
        tokio::spawn(Self { transport, mirror, interval }.run())
    }

    /// One full fetch-and-replace cycle.
    pub async fn refresh_once(transport: &Transport, mirror: &Mirror) -> bool {
        match transport.fetch_tree(None).await {
            Ok(root) => {
                mirror.replace(root);
                true
            }
            Err(err) => {
                warn!(error = %err, "tree refresh failed");
                false
            }
        }
    }

    async fn run(self) {
        loop {
            if self.interval.is_zero() {
                // periodic refresh disabled: only recovery triggers
                self.transport.recovered.notified().await;
            } else {
                tokio::select! {
                    _ = sleep(self.interval) => {}
                    _ = self.transport.recovered.notified() => {}
                }
            }
            Self::refresh_once(&self.transport, &self.mirror).await;
        }
    }
}
