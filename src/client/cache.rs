//! Bounded, content-addressed local cache with LRU eviction and pins.
//!
//! On-disk layout: `blobs/<hash>.bin` for complete entries,
//! `tmp.<random>` during ingestion, `pins.json` for the persisted pin
//! set. The in-memory index and the on-disk state agree after every
//! completed operation; stray temp files are swept on open.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::error::{Error, Result};

const PINS_FILE: &str = "pins.json";
const BLOBS_DIR: &str = "blobs";

#[derive(Debug, Clone)]
struct Entry {
    path: PathBuf,
    size: u64,
    pinned: bool,
    last_access: u64,
}

#[derive(Default)]
struct Index {
    entries: HashMap<String, Entry>,
    /// Identifiers fetched only partially; never satisfy full lookups.
    partial: HashSet<String>,
    /// Ingestions in progress, so a second caller waits instead of
    /// starting a parallel download of the same content.
    in_flight: HashMap<String, Arc<Notify>>,
    /// Total bytes of complete entries, pinned or not.
    total: u64,
    /// Logical LRU clock; larger means more recently used.
    clock: u64,
}

impl Index {
    fn touch(&mut self, id: &str) {
        self.clock += 1;
        if let Some(entry) = self.entries.get_mut(id) {
            entry.last_access = self.clock;
        }
    }
}

/// Point-in-time cache counters.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub current_size: u64,
    pub max_size: u64,
    pub count: usize,
    pub pinned: usize,
}

#[derive(Serialize, Deserialize, Default)]
struct PinFile {
    pins: Vec<String>,
}

/// The client-side content cache.
pub struct ContentCache {
    root: PathBuf,
    blobs: PathBuf,
    max_bytes: u64,
    inner: Mutex<Index>,
}

/// Result of [`ContentCache::reserve`].
pub enum Reserved<'a> {
    /// The content is already cached at this path.
    Present(PathBuf),
    /// The caller owns the ingestion; stream into the sink and commit.
    Ingest(IngestSink<'a>),
}

impl ContentCache {
    /// Opens the cache directory: sweeps temp files, indexes existing
    /// blobs (access order seeded from file modification times) and
    /// reconciles the persisted pin set against what is actually on
    /// disk.
    pub async fn open(root: impl Into<PathBuf>, max_bytes: u64) -> Result<Self> {
        let root = root.into();
        let blobs = root.join(BLOBS_DIR);
        fs::create_dir_all(&blobs).await?;

        // stray temp files from interrupted ingestions
        let mut dir = fs::read_dir(&root).await?;
        while let Some(entry) = dir.next_entry().await? {
            if entry.file_name().to_string_lossy().starts_with("tmp.") {
                debug!(path = %entry.path().display(), "removing stale cache temp file");
                let _ = fs::remove_file(entry.path()).await;
            }
        }

        let mut found: Vec<(String, u64, std::time::SystemTime)> = Vec::new();
        let mut dir = fs::read_dir(&blobs).await?;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(id) = name.strip_suffix(".bin") else { continue };
            let meta = entry.metadata().await?;
            let mtime = meta.modified().unwrap_or(std::time::SystemTime::UNIX_EPOCH);
            found.push((id.to_string(), meta.len(), mtime));
        }
        found.sort_by_key(|(_, _, mtime)| *mtime);

        let pins = read_pins(&root.join(PINS_FILE)).await;
        let mut index = Index::default();
        for (id, size, _) in found {
            index.clock += 1;
            index.total += size;
            index.entries.insert(
                id.clone(),
                Entry {
                    path: blobs.join(format!("{id}.bin")),
                    size,
                    pinned: pins.contains(&id),
                    last_access: index.clock,
                },
            );
        }

        let cache = Self { root, blobs, max_bytes, inner: Mutex::new(index) };
        // pins referencing missing blobs are dropped on load
        let live: Vec<String> = cache.pinned_ids();
        if live.len() != pins.len() {
            cache.persist_pins().await?;
        }
        Ok(cache)
    }

    fn blob_path(&self, id: &str) -> PathBuf {
        self.blobs.join(format!("{id}.bin"))
    }

    /// Local path of a complete entry; touches its access time.
    pub fn get(&self, id: &str) -> Option<PathBuf> {
        let mut index = self.inner.lock().unwrap();
        if !index.entries.contains_key(id) {
            return None;
        }
        index.touch(id);
        index.entries.get(id).map(|e| e.path.clone())
    }

    /// Whether a complete entry exists, without touching access order.
    pub fn contains(&self, id: &str) -> bool {
        self.inner.lock().unwrap().entries.contains_key(id)
    }

    /// Records that only a sub-range of `id` was fetched. Partial
    /// content never lands in the blob directory; the marker just
    /// remembers that a full hydration is still outstanding.
    pub fn mark_partial(&self, id: &str) {
        let mut index = self.inner.lock().unwrap();
        if !index.entries.contains_key(id) {
            index.partial.insert(id.to_string());
        }
    }

    pub fn is_partial(&self, id: &str) -> bool {
        self.inner.lock().unwrap().partial.contains(id)
    }

    /// Claims `id` for ingestion, or waits for a concurrent ingestion of
    /// the same identifier and returns its result.
    pub async fn reserve(&self, id: &str) -> Result<Reserved<'_>> {
        loop {
            let notify = {
                let mut index = self.inner.lock().unwrap();
                if index.entries.contains_key(id) {
                    index.touch(id);
                    let path = index.entries.get(id).map(|e| e.path.clone());
                    return Ok(Reserved::Present(path.unwrap_or_else(|| self.blob_path(id))));
                }
                match index.in_flight.get(id) {
                    Some(notify) => notify.clone(),
                    None => {
                        let notify = Arc::new(Notify::new());
                        index.in_flight.insert(id.to_string(), notify);
                        break;
                    }
                }
            };
            // register interest before re-checking so a commit between
            // the check and the await cannot be missed
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.contains(id) || !self.is_in_flight(id) {
                continue;
            }
            notified.await;
        }

        let tmp = self.root.join(format!("tmp.{:016x}", rand::random::<u64>()));
        let file = match OpenOptions::new().write(true).create_new(true).open(&tmp).await {
            Ok(file) => file,
            Err(err) => {
                self.release_in_flight(id);
                return Err(err.into());
            }
        };
        Ok(Reserved::Ingest(IngestSink {
            cache: self,
            id: id.to_string(),
            tmp,
            file: Some(file),
            written: 0,
            committed: false,
        }))
    }

    fn is_in_flight(&self, id: &str) -> bool {
        self.inner.lock().unwrap().in_flight.contains_key(id)
    }

    fn release_in_flight(&self, id: &str) {
        let notify = self.inner.lock().unwrap().in_flight.remove(id);
        if let Some(notify) = notify {
            notify.notify_waiters();
        }
    }

    /// Convenience wrapper: ingest an in-memory body in one call.
    pub async fn put_bytes(&self, id: &str, data: &[u8]) -> Result<PathBuf> {
        match self.reserve(id).await? {
            Reserved::Present(path) => Ok(path),
            Reserved::Ingest(mut sink) => {
                sink.write(data).await?;
                sink.commit().await
            }
        }
    }

    /// Removes an entry; refuses pinned ones, ignores absent ones.
    pub async fn evict(&self, id: &str) -> Result<()> {
        let path = {
            let mut index = self.inner.lock().unwrap();
            index.partial.remove(id);
            match index.entries.remove(id) {
                None => return Ok(()),
                Some(entry) if entry.pinned => {
                    index.entries.insert(id.to_string(), entry);
                    return Err(Error::Pinned(id.to_string()));
                }
                Some(entry) => {
                    index.total -= entry.size;
                    entry.path
                }
            }
        };
        fs::remove_file(&path).await.or_else(ignore_missing)?;
        Ok(())
    }

    /// Pins an entry, exempting it from eviction; persisted immediately.
    pub async fn pin(&self, id: &str) -> Result<()> {
        self.set_pinned(id, true)?;
        self.persist_pins().await
    }

    /// Clears the pin flag; persisted immediately.
    pub async fn unpin(&self, id: &str) -> Result<()> {
        self.set_pinned(id, false)?;
        self.persist_pins().await
    }

    fn set_pinned(&self, id: &str, pinned: bool) -> Result<()> {
        let mut index = self.inner.lock().unwrap();
        match index.entries.get_mut(id) {
            Some(entry) => {
                entry.pinned = pinned;
                Ok(())
            }
            None => Err(Error::NotFound(id.to_string())),
        }
    }

    pub fn stats(&self) -> CacheStats {
        let index = self.inner.lock().unwrap();
        CacheStats {
            current_size: index.total,
            max_size: self.max_bytes,
            count: index.entries.len(),
            pinned: index.entries.values().filter(|e| e.pinned).count(),
        }
    }

    /// `(identifier, size, pinned)` for every complete entry.
    pub fn entries(&self) -> Vec<(String, u64, bool)> {
        let index = self.inner.lock().unwrap();
        let mut list: Vec<_> =
            index.entries.iter().map(|(id, e)| (id.clone(), e.size, e.pinned)).collect();
        list.sort();
        list
    }

    fn pinned_ids(&self) -> Vec<String> {
        let index = self.inner.lock().unwrap();
        let mut pins: Vec<String> =
            index.entries.iter().filter(|(_, e)| e.pinned).map(|(id, _)| id.clone()).collect();
        pins.sort();
        pins
    }

    /// Serializes the pin set to `pins.json` with the usual
    /// write-then-rename dance.
    async fn persist_pins(&self) -> Result<()> {
        let pins = PinFile { pins: self.pinned_ids() };
        let body = serde_json::to_vec_pretty(&pins)
            .map_err(|err| Error::Storage(err.to_string()))?;
        let tmp = self.root.join(format!("tmp.{:016x}", rand::random::<u64>()));
        fs::write(&tmp, &body).await?;
        fs::rename(&tmp, self.root.join(PINS_FILE)).await?;
        Ok(())
    }

    /// Selects eviction victims so that `incoming` more bytes fit.
    ///
    /// Strict LRU over unpinned entries. Victims are removed from the
    /// index here (under the lock) and their files deleted by the
    /// caller afterwards; if the projected size cannot fit even with
    /// every unpinned entry gone, nothing is touched and the put fails.
    fn plan_eviction(&self, index: &mut Index, incoming: u64) -> Result<Vec<PathBuf>> {
        if incoming > self.max_bytes {
            return Err(Error::CapacityExceeded { need: incoming, max: self.max_bytes });
        }
        let pinned_total: u64 =
            index.entries.values().filter(|e| e.pinned).map(|e| e.size).sum();
        if pinned_total + incoming > self.max_bytes {
            return Err(Error::CapacityExceeded {
                need: pinned_total + incoming,
                max: self.max_bytes,
            });
        }

        let mut victims: Vec<(u64, String)> = index
            .entries
            .iter()
            .filter(|(_, e)| !e.pinned)
            .map(|(id, e)| (e.last_access, id.clone()))
            .collect();
        victims.sort();

        let mut planned = Vec::new();
        let mut projected = index.total + incoming;
        for (_, id) in victims {
            if projected <= self.max_bytes {
                break;
            }
            if let Some(entry) = index.entries.remove(&id) {
                index.total -= entry.size;
                projected -= entry.size;
                debug!(id, size = entry.size, "evicting least-recently-used entry");
                planned.push(entry.path);
            }
        }
        Ok(planned)
    }
}

fn ignore_missing(err: std::io::Error) -> std::io::Result<()> {
    if err.kind() == std::io::ErrorKind::NotFound {
        Ok(())
    } else {
        Err(err)
    }
}

async fn read_pins(path: &Path) -> Vec<String> {
    match fs::read(path).await {
        Ok(raw) => match serde_json::from_slice::<PinFile>(&raw) {
            Ok(file) => file.pins,
            Err(err) => {
                warn!(error = %err, "ignoring unreadable pin file");
                Vec::new()
            }
        },
        Err(_) => Vec::new(),
    }
}

/// An exclusive, in-progress ingestion of one identifier.
///
/// Dropping the sink without committing deletes the temp file and
/// releases the in-flight slot.
pub struct IngestSink<'a> {
    cache: &'a ContentCache,
    id: String,
    tmp: PathBuf,
    file: Option<File>,
    written: u64,
    committed: bool,
}

impl IngestSink<'_> {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    /// Appends a chunk to the temp file.
    pub async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        let file = self.file.as_mut().ok_or_else(|| Error::Storage("sink closed".into()))?;
        file.write_all(chunk).await?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    /// Validates the streamed size against `expected`, then commits.
    pub async fn commit_sized(self, expected: u64) -> Result<PathBuf> {
        if self.written != expected {
            return Err(Error::Storage(format!(
                "short ingestion: expected {expected} bytes, wrote {}",
                self.written
            )));
        }
        self.commit().await
    }

    /// Flushes, makes room (evicting LRU unpinned entries if needed) and
    /// atomically renames the temp file into the blob directory.
    pub async fn commit(mut self) -> Result<PathBuf> {
        let mut file = self.file.take().ok_or_else(|| Error::Storage("sink closed".into()))?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        let size = self.written;
        let victims = {
            let mut index = self.cache.inner.lock().unwrap();
            self.cache.plan_eviction(&mut index, size)?
        };
        for path in victims {
            fs::remove_file(&path).await.or_else(ignore_missing)?;
        }

        let canonical = self.cache.blob_path(&self.id);
        fs::rename(&self.tmp, &canonical).await?;

        {
            let mut index = self.cache.inner.lock().unwrap();
            index.clock += 1;
            let last_access = index.clock;
            index.total += size;
            index.partial.remove(&self.id);
            index.entries.insert(
                self.id.clone(),
                Entry { path: canonical.clone(), size, pinned: false, last_access },
            );
        }
        self.cache.release_in_flight(&self.id);
        self.committed = true;
        Ok(canonical)
    }
}

impl Drop for IngestSink<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        self.file.take();
        let _ = std::fs::remove_file(&self.tmp);
        self.cache.release_in_flight(&self.id);
    }
}
