//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tempfile::TempDir;

use tidefs::config::ServerConfig;
use tidefs::error::Result;
use tidefs::meta::MetaStore;
use tidefs::server::{AppState, TokenAuth};
use tidefs::store::{ByteRange, LocalStore, ObjectReader, ObjectStore};

pub const SECRET: &str = "integration-test-secret";

/// Wraps an [`ObjectStore`] and records every content read, so tests can
/// assert that metadata operations never touch the content store.
pub struct CountingStore {
    inner: LocalStore,
    reads: AtomicUsize,
    ranges: Mutex<Vec<Option<ByteRange>>>,
}

impl CountingStore {
    pub fn new(inner: LocalStore) -> Self {
        Self { inner, reads: AtomicUsize::new(0), ranges: Mutex::new(Vec::new()) }
    }

    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn recorded_ranges(&self) -> Vec<Option<ByteRange>> {
        self.ranges.lock().unwrap().clone()
    }
}

#[async_trait]
impl ObjectStore for CountingStore {
    async fn get(&self, key: &str, range: Option<ByteRange>) -> Result<ObjectReader> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.ranges.lock().unwrap().push(range);
        self.inner.get(key, range).await
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        self.inner.put(key, data).await
    }

    async fn copy(&self, from: &str, to: &str) -> Result<()> {
        self.inner.copy(from, to).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.delete(key).await
    }

    async fn len(&self, key: &str) -> Result<u64> {
        self.inner.len(key).await
    }
}

/// An in-memory server over a temp-dir content store.
pub struct TestServer {
    pub state: Arc<AppState>,
    pub store: Arc<CountingStore>,
    pub token: String,
    _storage: TempDir,
}

pub async fn test_server_with(max_upload: u64) -> TestServer {
    let storage = tempfile::tempdir().unwrap();
    let local = LocalStore::open(storage.path()).await.unwrap();
    let store = Arc::new(CountingStore::new(local));
    let meta = MetaStore::open("sqlite::memory:").await.unwrap();
    let auth = Arc::new(TokenAuth::new(SECRET));
    let token = auth.issue("alice", "tests").unwrap().token;
    let config = ServerConfig {
        database_url: "sqlite::memory:".into(),
        jwt_secret: SECRET.into(),
        max_upload_size: max_upload,
        ..Default::default()
    };
    let state = Arc::new(AppState::new(config, meta, store.clone(), auth));
    TestServer { state, store, token, _storage: storage }
}

pub async fn test_server() -> TestServer {
    test_server_with(64 * 1024 * 1024).await
}
