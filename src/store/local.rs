//! Directory-backed [`ObjectStore`] with atomic tmp-and-rename writes.

use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::store::{ByteRange, ObjectReader, ObjectStore};

/// Content store rooted at a local directory.
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    /// Opens (and creates) the store directory, sweeping stale temp files.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        let store = Self { root };
        store.sweep_temp().await;
        Ok(store)
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        let rel = Path::new(key);
        if key.is_empty()
            || rel.components().any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(Error::BadRequest(format!("invalid storage key: {key}")));
        }
        Ok(self.root.join(rel))
    }

    fn temp_path(&self) -> PathBuf {
        self.root.join(format!("tmp.{:016x}", rand::random::<u64>()))
    }

    /// Removes leftovers of writes interrupted by a crash.
    async fn sweep_temp(&self) {
        let Ok(mut entries) = fs::read_dir(&self.root).await else { return };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            if name.to_string_lossy().starts_with("tmp.") {
                debug!(path = %entry.path().display(), "removing stale temp file");
                let _ = fs::remove_file(entry.path()).await;
            }
        }
    }
}

#[async_trait]
impl ObjectStore for LocalStore {
    async fn get(&self, key: &str, range: Option<ByteRange>) -> Result<ObjectReader> {
        let path = self.resolve(key)?;
        let mut file = File::open(&path).await.map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                Error::NotFound(key.to_string())
            } else {
                Error::Io(err)
            }
        })?;
        match range {
            Some(range) => {
                file.seek(SeekFrom::Start(range.start)).await?;
                Ok(Box::new(file.take(range.len())) as ObjectReader)
            }
            None => Ok(Box::new(file) as ObjectReader),
        }
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp = self.temp_path();
        let mut file = OpenOptions::new().write(true).create_new(true).open(&tmp).await?;
        if let Err(err) = async {
            file.write_all(&data).await?;
            file.flush().await?;
            file.sync_all().await
        }
        .await
        {
            let _ = fs::remove_file(&tmp).await;
            return Err(err.into());
        }
        drop(file);
        if let Err(err) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(err.into());
        }
        Ok(())
    }

    async fn copy(&self, from: &str, to: &str) -> Result<()> {
        let src = self.resolve(from)?;
        let dst = self.resolve(to)?;
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent).await?;
        }
        match fs::copy(&src, &dst).await {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(from.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.resolve(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => {
                warn!(key, error = %err, "failed to remove object");
                Err(err.into())
            }
        }
    }

    async fn len(&self, key: &str) -> Result<u64> {
        let path = self.resolve(key)?;
        match fs::metadata(&path).await {
            Ok(meta) => Ok(meta.len()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(key.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }
}
