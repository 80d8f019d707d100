//! The placeholder filesystem adapter.
//!
//! Presents the mirrored metadata tree as filesystem operations and
//! enforces the cardinal rule: metadata operations (lookup, getattr,
//! readdir) never trigger content transfer. Content moves only on Read
//! (hydration) and on Flush of a dirty handle (upload).
//!
//! The kernel binding (FUSE or NFS glue) drives this API; its contract
//! is exactly the operation set below plus [`FsError`].

use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::client::cache::{ContentCache, Reserved};
use crate::client::transport::Transport;
use crate::client::tree::{DirEntry, Mirror, NodeInfo};
use crate::error::{Error, FsError};
use crate::protocol;
use crate::store::ByteRange;

/// Result alias for adapter operations.
pub type FsResult<T> = std::result::Result<T, FsError>;

/// Files below this size are hydrated whole on first read; at or above
/// it, reads fetch only the requested range until a full read arrives.
pub const RANGED_READ_THRESHOLD: u64 = 1024 * 1024;

const MODE_DIR: u32 = 0o755;
const MODE_FILE_RW: u32 = 0o644;
const MODE_FILE_RO: u32 = 0o444;

/// Attributes returned by getattr.
#[derive(Debug, Clone, PartialEq)]
pub struct FileAttr {
    pub is_dir: bool,
    pub size: u64,
    pub mod_time: DateTime<Utc>,
    pub mode: u32,
}

/// Adapter tuning knobs.
#[derive(Debug, Clone)]
pub struct AdapterOptions {
    pub verify_hash: bool,
    pub ranged_threshold: u64,
}

impl Default for AdapterOptions {
    fn default() -> Self {
        Self { verify_hash: false, ranged_threshold: RANGED_READ_THRESHOLD }
    }
}

/// State of one open file.
///
/// Lifecycle: Open-Clean -> (Read) Hydrating -> Ready, and
/// (Write) Dirty -> Flushed on successful upload. A failed flush leaves
/// the handle dirty and surfaces the error.
struct Handle {
    path: String,
    /// Version and hash observed at open; asserted on flush.
    observed_version: u64,
    observed_hash: String,
    size: u64,
    /// Cache blob backing reads; empty until first hydration.
    local_path: Option<PathBuf>,
    dirty: bool,
    /// Whole-file write accumulator.
    buffer: Vec<u8>,
    /// Set by create/truncate: the accumulator must not be preloaded
    /// from the old content on the first write.
    truncated: bool,
}

impl Handle {
    fn write_at(&mut self, offset: u64, data: &[u8]) {
        let offset = offset as usize;
        let end = offset + data.len();
        if self.buffer.len() < end {
            self.buffer.resize(end, 0);
        }
        self.buffer[offset..end].copy_from_slice(data);
    }
}

/// The placeholder filesystem adapter.
pub struct Adapter {
    transport: Arc<Transport>,
    mirror: Arc<Mirror>,
    cache: Arc<ContentCache>,
    user_id: Option<String>,
    options: AdapterOptions,
    handles: DashMap<u64, Arc<Mutex<Handle>>>,
    next_handle: AtomicU64,
}

impl Adapter {
    pub fn new(
        transport: Arc<Transport>,
        mirror: Arc<Mirror>,
        cache: Arc<ContentCache>,
        options: AdapterOptions,
    ) -> Self {
        let user_id = transport.user_id();
        Self {
            transport,
            mirror,
            cache,
            user_id,
            options,
            handles: DashMap::new(),
            next_handle: AtomicU64::new(1),
        }
    }

    pub fn cache(&self) -> &ContentCache {
        &self.cache
    }

    fn handle(&self, id: u64) -> FsResult<Arc<Mutex<Handle>>> {
        self.handles.get(&id).map(|h| h.clone()).ok_or(FsError::Stale)
    }

    fn register(&self, handle: Handle) -> u64 {
        let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.handles.insert(id, Arc::new(Mutex::new(handle)));
        id
    }

    // ---- metadata operations: never any content or network I/O ----

    /// Resolves `name` inside `parent` against the mirrored tree.
    pub fn lookup(&self, parent: &str, name: &str) -> FsResult<NodeInfo> {
        let dir = self.mirror.get(parent).ok_or(FsError::NoEntry)?;
        if !dir.is_dir {
            return Err(FsError::NotDir);
        }
        self.mirror.lookup(parent, name).ok_or(FsError::NoEntry)
    }

    /// Attributes of the node at `path`; read-only mode for files the
    /// caller does not own.
    pub fn getattr(&self, path: &str) -> FsResult<FileAttr> {
        let node = self.mirror.get(path).ok_or(FsError::NoEntry)?;
        let mode = if node.is_dir {
            MODE_DIR
        } else {
            let owned = node.owner_id.is_empty()
                || self.user_id.as_deref().is_some_and(|uid| uid == node.owner_id);
            if owned {
                MODE_FILE_RW
            } else {
                MODE_FILE_RO
            }
        };
        Ok(FileAttr { is_dir: node.is_dir, size: node.size, mod_time: node.mod_time, mode })
    }

    /// Ordered child names and kinds of a directory.
    pub fn readdir(&self, path: &str) -> FsResult<Vec<DirEntry>> {
        let node = self.mirror.get(path).ok_or(FsError::NoEntry)?;
        if !node.is_dir {
            return Err(FsError::NotDir);
        }
        self.mirror.read_dir(path).ok_or(FsError::NoEntry)
    }

    // ---- handle lifecycle ----

    /// Opens an existing node. If the cache already holds the current
    /// content the handle is immediately readable from disk; otherwise
    /// hydration is deferred to the first read.
    pub fn open(&self, path: &str) -> FsResult<u64> {
        let node = self.mirror.get(path).ok_or(FsError::NoEntry)?;
        if node.is_dir {
            return Err(FsError::IsDir);
        }
        let local_path = if node.hash.is_empty() { None } else { self.cache.get(&node.hash) };
        let id = self.register(Handle {
            path: node.path.clone(),
            observed_version: node.version,
            observed_hash: node.hash.clone(),
            size: node.size,
            local_path,
            dirty: false,
            buffer: Vec::new(),
            truncated: false,
        });
        debug!(path = %node.path, handle = id, version = node.version, "handle opened");
        Ok(id)
    }

    /// Creates (or truncates) a file without contacting the server.
    ///
    /// New handles start clean: shells that issue Flush right after
    /// O_CREAT must not upload a spurious empty file. Truncating an
    /// existing non-empty file does count as a write.
    pub fn create(&self, parent: &str, name: &str) -> FsResult<u64> {
        let dir = self.mirror.get(parent).ok_or(FsError::NoEntry)?;
        if !dir.is_dir {
            return Err(FsError::NotDir);
        }
        let path = protocol::join_path(parent, name);
        let existing = self.mirror.get(&path);
        if existing.as_ref().is_some_and(|n| n.is_dir) {
            return Err(FsError::IsDir);
        }
        let (observed_version, observed_hash, had_content) = existing
            .map(|n| (n.version, n.hash, n.size > 0))
            .unwrap_or((0, String::new(), false));

        self.mirror.record_file(&path, 0, "", observed_version);
        let id = self.register(Handle {
            path: path.clone(),
            observed_version,
            observed_hash,
            size: 0,
            local_path: None,
            dirty: had_content,
            buffer: Vec::new(),
            truncated: true,
        });
        debug!(%path, handle = id, "handle created");
        Ok(id)
    }

    /// Reads from an open handle, hydrating on demand.
    pub async fn read(&self, id: u64, offset: u64, len: u32) -> FsResult<Vec<u8>> {
        let handle = self.handle(id)?;
        let mut handle = handle.lock().await;

        // dirty handles serve their own pending writes
        if handle.dirty {
            let buf = &handle.buffer;
            let start = (offset as usize).min(buf.len());
            let end = (offset as usize + len as usize).min(buf.len());
            return Ok(buf[start..end].to_vec());
        }

        if offset >= handle.size {
            return Ok(Vec::new());
        }

        if handle.local_path.is_none() {
            let node = self
                .mirror
                .get(&handle.path)
                .ok_or(FsError::Stale)?;
            if node.size >= self.options.ranged_threshold {
                // large file: fetch only the requested window
                let data = self
                    .fetch_range(&node, offset, len as u64)
                    .await
                    .map_err(|err| self.read_error(err))?;
                return Ok(data);
            }
            let path = self
                .hydrate_full(&node)
                .await
                .map_err(|err| self.read_error(err))?;
            handle.local_path = Some(path);
            handle.size = node.size;
        }

        let path = handle.local_path.clone().ok_or(FsError::IO)?;
        read_file_range(&path, offset, len as u64).await.map_err(|_| FsError::IO)
    }

    /// Buffers a write; no network I/O happens here.
    pub async fn write(&self, id: u64, offset: u64, data: &[u8]) -> FsResult<u32> {
        let handle = self.handle(id)?;
        let mut handle = handle.lock().await;

        if !handle.dirty && !handle.truncated && handle.size > 0 {
            // first write into an existing file: preload the current
            // content so offset writes do not zero the rest
            let node = self.mirror.get(&handle.path).ok_or(FsError::Stale)?;
            let path = self
                .hydrate_full(&node)
                .await
                .map_err(|err| self.read_error(err))?;
            handle.buffer = read_whole_file(&path).await.map_err(|_| FsError::IO)?;
            handle.local_path = Some(path);
        }

        handle.write_at(offset, data);
        handle.dirty = true;
        Ok(data.len() as u32)
    }

    /// Uploads the accumulator if the handle is dirty.
    ///
    /// The upload asserts the version and hash observed at open; a 409
    /// leaves the handle dirty for the user to resolve.
    pub async fn flush(&self, id: u64) -> FsResult<()> {
        let handle = self.handle(id)?;
        let mut handle = handle.lock().await;
        self.flush_locked(&mut handle).await
    }

    async fn flush_locked(&self, handle: &mut Handle) -> FsResult<()> {
        if !handle.dirty {
            return Ok(());
        }
        let body = bytes::Bytes::from(handle.buffer.clone());
        let if_match =
            (!handle.observed_hash.is_empty()).then(|| handle.observed_hash.clone());
        let reply = self
            .transport
            .upload(&handle.path, body, Some(handle.observed_version), if_match.as_deref())
            .await
            .map_err(|err| {
                warn!(path = %handle.path, error = %err, "flush failed, handle stays dirty");
                FsError::from(err)
            })?;

        // rehome the accumulator into the cache under the new hash
        if let Err(err) = self.cache.put_bytes(&reply.hash, &handle.buffer).await {
            debug!(path = %handle.path, error = %err, "flushed content not cached");
        } else {
            handle.local_path = self.cache.get(&reply.hash);
        }

        self.mirror.record_file(&reply.path, reply.size, &reply.hash, reply.version);
        info!(path = %handle.path, version = reply.version, size = reply.size, "flushed");

        handle.observed_version = reply.version;
        handle.observed_hash = reply.hash;
        handle.size = reply.size;
        handle.dirty = false;
        Ok(())
    }

    /// Flushes (surfacing any upload error) and drops the handle.
    pub async fn release(&self, id: u64) -> FsResult<()> {
        let handle = self.handle(id)?;
        let result = {
            let mut guard = handle.lock().await;
            self.flush_locked(&mut guard).await
        };
        self.handles.remove(&id);
        result
    }

    // ---- namespace mutations ----

    /// Deletes a file.
    pub async fn unlink(&self, path: &str) -> FsResult<()> {
        let node = self.mirror.get(path).ok_or(FsError::NoEntry)?;
        if node.is_dir {
            return Err(FsError::IsDir);
        }
        self.transport.delete(&node.path).await.map_err(FsError::from)?;
        self.drop_cached(&node).await;
        self.mirror.remove(&node.path);
        Ok(())
    }

    /// Deletes a directory; the server cascades to descendants.
    pub async fn rmdir(&self, path: &str) -> FsResult<()> {
        let node = self.mirror.get(path).ok_or(FsError::NoEntry)?;
        if !node.is_dir {
            return Err(FsError::NotDir);
        }
        // evict cached content of direct children before the metadata
        // goes; deeper entries age out through the LRU
        let hashes: Vec<NodeInfo> = self
            .mirror
            .read_dir(&node.path)
            .unwrap_or_default()
            .iter()
            .filter_map(|e| self.mirror.lookup(&node.path, &e.name))
            .collect();
        self.transport.delete(&node.path).await.map_err(FsError::from)?;
        for child in hashes {
            self.drop_cached(&child).await;
        }
        self.mirror.remove(&node.path);
        Ok(())
    }

    /// Creates a directory on the server.
    pub async fn mkdir(&self, parent: &str, name: &str) -> FsResult<()> {
        let dir = self.mirror.get(parent).ok_or(FsError::NoEntry)?;
        if !dir.is_dir {
            return Err(FsError::NotDir);
        }
        let path = protocol::join_path(parent, name);
        self.transport.mkdir(&path).await.map_err(FsError::from)?;
        self.mirror.record_dir(&path);
        Ok(())
    }

    /// Renames a file as upload-to-new-path followed by delete-of-old.
    ///
    /// The remote interface has no rename primitive, so this is not
    /// atomic and not crash-safe for huge files: a crash in the middle
    /// leaves both names visible until the next cleanup. Other clients
    /// observe the pair of events the two mutations produce, not a
    /// dedicated rename notification.
    pub async fn rename(&self, from: &str, to: &str) -> FsResult<()> {
        let node = self.mirror.get(from).ok_or(FsError::NoEntry)?;
        if node.is_dir {
            return Err(FsError::Unsupported);
        }
        let content = if node.size == 0 {
            Vec::new()
        } else {
            let path = self
                .hydrate_full(&node)
                .await
                .map_err(|err| self.read_error(err))?;
            read_whole_file(&path).await.map_err(|_| FsError::IO)?
        };
        let to = protocol::normalize_path(to);
        let reply = self
            .transport
            .upload(&to, bytes::Bytes::from(content), None, None)
            .await
            .map_err(FsError::from)?;
        self.transport.delete(&node.path).await.map_err(FsError::from)?;
        self.mirror.record_file(&reply.path, reply.size, &reply.hash, reply.version);
        self.mirror.remove(&node.path);
        // the blob is content-addressed, so the cache entry carries over
        Ok(())
    }

    // ---- hydration ----

    /// Full hydration of `node` into the cache.
    ///
    /// At most one download per content hash runs at a time; concurrent
    /// callers wait on the same ingestion. With hash verification on,
    /// a digest mismatch aborts and deletes the temp file.
    async fn hydrate_full(&self, node: &NodeInfo) -> crate::error::Result<PathBuf> {
        match self.cache.reserve(&node.hash).await? {
            Reserved::Present(path) => Ok(path),
            Reserved::Ingest(mut sink) => {
                debug!(path = %node.path, size = node.size, "hydrating");
                let content = self.transport.get_content(&node.path, None).await?;
                let mut hasher = self.options.verify_hash.then(Sha256::new);
                let mut stream = content.response;
                while let Some(chunk) = stream.chunk().await? {
                    if let Some(hasher) = hasher.as_mut() {
                        hasher.update(&chunk);
                    }
                    sink.write(&chunk).await?;
                }
                if let Some(hasher) = hasher {
                    let actual = hex::encode(hasher.finalize());
                    if actual != node.hash {
                        // dropping the sink removes the temp file
                        return Err(Error::IntegrityMismatch {
                            path: node.path.clone(),
                            expected: node.hash.clone(),
                            actual,
                        });
                    }
                }
                sink.commit_sized(node.size).await
            }
        }
    }

    /// Ranged fetch for large files; bypasses the cache and leaves a
    /// partial marker so the entry is not mistaken for fully present.
    async fn fetch_range(
        &self,
        node: &NodeInfo,
        offset: u64,
        len: u64,
    ) -> crate::error::Result<Vec<u8>> {
        if offset >= node.size {
            return Ok(Vec::new());
        }
        let end = (offset + len).min(node.size) - 1;
        let content = self
            .transport
            .get_content(&node.path, Some(ByteRange::new(offset, end)))
            .await?;
        let data = content.response.bytes().await?;
        self.cache.mark_partial(&node.hash);
        debug!(path = %node.path, offset, len = data.len(), "ranged read served");
        Ok(data.to_vec())
    }

    async fn drop_cached(&self, node: &NodeInfo) {
        if node.hash.is_empty() {
            return;
        }
        match self.cache.evict(&node.hash).await {
            Ok(()) => {}
            Err(Error::Pinned(_)) => {
                debug!(hash = %node.hash, "deleted file's content stays cached (pinned)")
            }
            Err(err) => warn!(hash = %node.hash, error = %err, "cache eviction failed"),
        }
    }

    fn read_error(&self, err: Error) -> FsError {
        if matches!(err, Error::Transport(_)) && !self.transport.is_online() {
            FsError::Offline
        } else {
            FsError::from(err)
        }
    }

    /// Open-handle count, for diagnostics.
    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }
}

async fn read_file_range(path: &std::path::Path, offset: u64, len: u64) -> std::io::Result<Vec<u8>> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buf = Vec::with_capacity(len as usize);
    file.take(len).read_to_end(&mut buf).await?;
    Ok(buf)
}

async fn read_whole_file(path: &std::path::Path) -> std::io::Result<Vec<u8>> {
    tokio::fs::read(path).await
}
