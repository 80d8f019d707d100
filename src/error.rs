//! Error types shared across the tidefs server and client.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong inside tidefs.
///
/// Each variant corresponds to one propagation rule: protocol errors map
/// to 4xx and are never retried, conflicts surface to the user, transport
/// errors are retried for idempotent requests, capacity errors fail fast.
#[derive(Debug, Error)]
pub enum Error {
    /// No node exists at the requested path (or version).
    #[error("not found: {0}")]
    NotFound(String),

    /// A stale `X-Expected-Version` / `If-Match` assertion was rejected.
    #[error("version conflict on {path}: current version {current_version}")]
    Conflict { path: String, expected_version: Option<u64>, current_version: u64, current_hash: String },

    /// Malformed request: bad range, missing path, invalid body.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// A requested byte range cannot be satisfied by the node's size.
    #[error("unsatisfiable range for size {size}")]
    RangeNotSatisfiable { size: u64 },

    /// Upload body exceeded the configured maximum.
    #[error("upload exceeds the maximum allowed size")]
    TooLarge,

    /// The cache cannot hold the entry without evicting pinned data.
    #[error("cache capacity exceeded: need {need} bytes, max {max}")]
    CapacityExceeded { need: u64, max: u64 },

    /// Downloaded content did not match the expected SHA-256.
    #[error("hash mismatch for {path}: expected {expected}, got {actual}")]
    IntegrityMismatch { path: String, expected: String, actual: String },

    /// Missing or invalid credentials.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The server has been unreachable for consecutive health probes;
    /// mutating operations fail fast until it recovers.
    #[error("server offline")]
    Offline,

    /// An entry is pinned and therefore exempt from the requested removal.
    #[error("entry {0} is pinned")]
    Pinned(String),

    /// Content store failure (local disk or object store).
    #[error("storage error: {0}")]
    Storage(String),

    /// Metadata database failure.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// HTTP transport failure after retries were exhausted.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether a failed idempotent request may be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Transport(err) => !err.is_status() || err.status().is_some_and(|s| s.is_server_error()),
            Error::Io(_) => true,
            _ => false,
        }
    }
}

/// Errno-style error surfaced by the placeholder filesystem adapter.
///
/// The kernel binding translates these into platform error codes; the
/// mapping from [`Error`] is lossy by design.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Error)]
pub enum FsError {
    /// No such file or directory.
    #[error("no such file or directory")]
    NoEntry,
    /// Hard I/O error, including integrity failures after download.
    #[error("input/output error")]
    IO,
    /// Permission denied.
    #[error("permission denied")]
    Access,
    /// The file already exists.
    #[error("file exists")]
    Exist,
    /// The caller specified a non-directory in a directory operation.
    #[error("not a directory")]
    NotDir,
    /// The caller specified a directory in a non-directory operation.
    #[error("is a directory")]
    IsDir,
    /// Invalid argument for an operation.
    #[error("invalid argument")]
    InvalidArgument,
    /// No space left: the cache cannot fit the content, or the server
    /// rejected the upload as too large.
    #[error("no space left")]
    NoSpace,
    /// The handle refers to a node that no longer exists, or a write
    /// lost an optimistic-concurrency race.
    #[error("stale handle or lost write race")]
    Stale,
    /// The server is offline; mutating operations fail fast.
    #[error("server offline")]
    Offline,
    /// A directory being removed is handled server-side; surfaced when
    /// the server rejects the operation.
    #[error("directory not empty")]
    NotEmpty,
    /// The operation is not supported by the remote interface.
    #[error("operation not supported")]
    Unsupported,
}

impl From<&Error> for FsError {
    fn from(err: &Error) -> Self {
        match err {
            Error::NotFound(_) => FsError::NoEntry,
            Error::Conflict { .. } => FsError::Stale,
            Error::BadRequest(_) | Error::RangeNotSatisfiable { .. } => FsError::InvalidArgument,
            Error::TooLarge | Error::CapacityExceeded { .. } => FsError::NoSpace,
            Error::IntegrityMismatch { .. } => FsError::IO,
            Error::Unauthorized(_) => FsError::Access,
            Error::Offline => FsError::Offline,
            Error::Pinned(_) => FsError::Access,
            _ => FsError::IO,
        }
    }
}

impl From<Error> for FsError {
    fn from(err: Error) -> Self {
        FsError::from(&err)
    }
}
