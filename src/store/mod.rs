//! Pluggable content store behind the server's content endpoints.
//!
//! Two backends implement [`ObjectStore`]: a local directory and an
//! S3-compatible object store. Keys are relative slash-separated paths;
//! the version store derives backup keys under `_versions/`.

mod local;
mod s3;

#[cfg(test)]
mod tests;

pub use local::LocalStore;
pub use s3::S3Store;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncRead;

use crate::error::Result;

/// Streaming reader over an object body (or a sub-range of it).
pub type ObjectReader = Box<dyn AsyncRead + Send + Unpin>;

/// A closed byte interval `[start, end]` within an object.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// Number of bytes covered by the interval (never zero).
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Formats the interval as an HTTP `Range` header value.
    pub fn to_header(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }
}

/// Content store interface.
///
/// Writes replace whole objects; there are no partial updates. Reads may
/// be ranged. `delete` of a missing key is a no-op so that metadata and
/// content cleanup stay idempotent.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Opens a streaming reader over `key`, optionally restricted to a range.
    async fn get(&self, key: &str, range: Option<ByteRange>) -> Result<ObjectReader>;

    /// Stores `data` under `key`, replacing any previous object.
    async fn put(&self, key: &str, data: Bytes) -> Result<()>;

    /// Copies the object at `from` to `to`.
    async fn copy(&self, from: &str, to: &str) -> Result<()>;

    /// Removes the object at `key`; absent keys are ignored.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Size in bytes of the object at `key`.
    async fn len(&self, key: &str) -> Result<u64>;
}
