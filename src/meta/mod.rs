//! Authoritative metadata store: the `files` and `file_versions` tables
//! and the materialized tree served to clients.

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool, Transaction};

use crate::error::{Error, Result};
use crate::protocol::{self, Node, Visibility};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS files (
    path         TEXT PRIMARY KEY,
    name         TEXT NOT NULL,
    parent_path  TEXT NOT NULL,
    is_dir       INTEGER NOT NULL,
    size         INTEGER NOT NULL DEFAULT 0,
    mtime        INTEGER NOT NULL,
    hash         TEXT NOT NULL DEFAULT '',
    storage_key  TEXT NOT NULL DEFAULT '',
    version      INTEGER NOT NULL DEFAULT 0,
    visibility   TEXT NOT NULL DEFAULT 'private',
    owner_id     TEXT NOT NULL DEFAULT '',
    group_id     TEXT NOT NULL DEFAULT ''
);
CREATE INDEX IF NOT EXISTS idx_files_parent ON files(parent_path);
CREATE TABLE IF NOT EXISTS file_versions (
    path       TEXT NOT NULL REFERENCES files(path) ON DELETE CASCADE,
    version    INTEGER NOT NULL,
    size       INTEGER NOT NULL,
    hash       TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (path, version)
);
"#;

/// One row of the `files` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct NodeRow {
    pub path: String,
    pub name: String,
    pub parent_path: String,
    pub is_dir: bool,
    pub size: i64,
    pub mtime: i64,
    pub hash: String,
    pub storage_key: String,
    pub version: i64,
    pub visibility: String,
    pub owner_id: String,
    pub group_id: String,
}

impl NodeRow {
    pub fn mod_time(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.mtime, 0).unwrap_or_default()
    }

    fn to_node(&self, children: Vec<Node>) -> Node {
        Node {
            id: protocol::node_id(&self.path),
            name: self.name.clone(),
            path: self.path.clone(),
            is_dir: self.is_dir,
            size: self.size as u64,
            mod_time: self.mod_time(),
            hash: self.hash.clone(),
            version: self.version as u64,
            visibility: Visibility::parse(&self.visibility),
            owner_id: self.owner_id.clone(),
            group_id: self.group_id.clone(),
            children,
        }
    }
}

/// One row of the `file_versions` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct VersionRow {
    pub path: String,
    pub version: i64,
    pub size: i64,
    pub hash: String,
    pub created_at: i64,
}

impl VersionRow {
    pub fn created(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.created_at, 0).unwrap_or_default()
    }
}

/// Handle to the metadata database.
#[derive(Clone)]
pub struct MetaStore {
    pool: SqlitePool,
}

impl MetaStore {
    /// Connects, creates the schema and guarantees the root directory row.
    pub async fn open(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(Error::Database)?
            .create_if_missing(true)
            .foreign_keys(true);
        let max_connections = if database_url.contains(":memory:") { 1 } else { 8 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        let store = Self { pool };
        store.ensure_root().await?;
        Ok(store)
    }

    async fn ensure_root(&self) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO files (path, name, parent_path, is_dir, size, mtime)
             VALUES ('/', '', '/', 1, 0, ?)",
        )
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    /// Fetches a single node row by normalized path.
    pub async fn get(&self, path: &str) -> Result<Option<NodeRow>> {
        let path = protocol::normalize_path(path);
        let row = sqlx::query_as::<_, NodeRow>("SELECT * FROM files WHERE path = ?")
            .bind(&path)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    /// Same as [`MetaStore::get`] but inside a transaction, so a writer
    /// observes a stable row while holding the path lock.
    pub async fn get_tx(
        &self,
        tx: &mut Transaction<'static, Sqlite>,
        path: &str,
    ) -> Result<Option<NodeRow>> {
        let path = protocol::normalize_path(path);
        let row = sqlx::query_as::<_, NodeRow>("SELECT * FROM files WHERE path = ?")
            .bind(&path)
            .fetch_optional(&mut **tx)
            .await?;
        Ok(row)
    }

    /// The node at `path` and every node below it.
    pub async fn subtree(&self, path: &str) -> Result<Vec<NodeRow>> {
        let path = protocol::normalize_path(path);
        let prefix = if path == "/" { "/%".to_string() } else { format!("{path}/%") };
        let rows = sqlx::query_as::<_, NodeRow>(
            "SELECT * FROM files WHERE path = ? OR path LIKE ? ESCAPE '\\'",
        )
        .bind(&path)
        .bind(like_escape(&prefix))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Same as [`MetaStore::subtree`] but on the transaction connection.
    pub async fn subtree_tx(
        &self,
        tx: &mut Transaction<'static, Sqlite>,
        path: &str,
    ) -> Result<Vec<NodeRow>> {
        let path = protocol::normalize_path(path);
        let prefix = if path == "/" { "/%".to_string() } else { format!("{path}/%") };
        let rows = sqlx::query_as::<_, NodeRow>(
            "SELECT * FROM files WHERE path = ? OR path LIKE ? ESCAPE '\\'",
        )
        .bind(&path)
        .bind(like_escape(&prefix))
        .fetch_all(&mut **tx)
        .await?;
        Ok(rows)
    }

    /// Version rows of `path`, read on the transaction connection.
    pub async fn versions_tx(
        &self,
        tx: &mut Transaction<'static, Sqlite>,
        path: &str,
    ) -> Result<Vec<VersionRow>> {
        let rows = sqlx::query_as::<_, VersionRow>(
            "SELECT * FROM file_versions WHERE path = ? ORDER BY version DESC",
        )
        .bind(protocol::normalize_path(path))
        .fetch_all(&mut **tx)
        .await?;
        Ok(rows)
    }

    /// Inserts or updates a file row inside `tx`.
    #[allow(clippy::too_many_arguments)]
    pub async fn upsert_file(
        &self,
        tx: &mut Transaction<'static, Sqlite>,
        path: &str,
        size: u64,
        hash: &str,
        version: u64,
        owner_id: &str,
        visibility: Visibility,
    ) -> Result<()> {
        let path = protocol::normalize_path(path);
        sqlx::query(
            "INSERT INTO files
                 (path, name, parent_path, is_dir, size, mtime, hash, storage_key, version,
                  visibility, owner_id)
             VALUES (?, ?, ?, 0, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(path) DO UPDATE SET
                 size = excluded.size,
                 mtime = excluded.mtime,
                 hash = excluded.hash,
                 version = excluded.version",
        )
        .bind(&path)
        .bind(protocol::file_name(&path))
        .bind(protocol::parent_path(&path))
        .bind(size as i64)
        .bind(Utc::now().timestamp())
        .bind(hash)
        .bind(protocol::storage_key(&path))
        .bind(version as i64)
        .bind(visibility.as_str())
        .bind(owner_id)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Idempotently upserts a directory row.
    pub async fn upsert_dir(
        &self,
        tx: &mut Transaction<'static, Sqlite>,
        path: &str,
        owner_id: &str,
    ) -> Result<()> {
        let path = protocol::normalize_path(path);
        sqlx::query(
            "INSERT OR IGNORE INTO files (path, name, parent_path, is_dir, size, mtime, owner_id)
             VALUES (?, ?, ?, 1, 0, ?, ?)",
        )
        .bind(&path)
        .bind(protocol::file_name(&path))
        .bind(protocol::parent_path(&path))
        .bind(Utc::now().timestamp())
        .bind(owner_id)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Creates every missing ancestor directory of `path`, root first.
    ///
    /// Every non-root row must have an existing directory parent; uploads
    /// call this before upserting the file row.
    pub async fn ensure_parents(
        &self,
        tx: &mut Transaction<'static, Sqlite>,
        path: &str,
        owner_id: &str,
    ) -> Result<()> {
        let path = protocol::normalize_path(path);
        let mut ancestors = Vec::new();
        let mut cursor = protocol::parent_path(&path);
        while cursor != "/" {
            ancestors.push(cursor.clone());
            cursor = protocol::parent_path(&cursor);
        }
        for ancestor in ancestors.into_iter().rev() {
            self.upsert_dir(tx, &ancestor, owner_id).await?;
        }
        Ok(())
    }

    /// Deletes `path` and all rows below it, returning the removed rows.
    pub async fn delete_subtree(
        &self,
        tx: &mut Transaction<'static, Sqlite>,
        path: &str,
    ) -> Result<Vec<NodeRow>> {
        let path = protocol::normalize_path(path);
        if path == "/" {
            return Err(Error::BadRequest("refusing to delete the root".into()));
        }
        let prefix = format!("{path}/%");
        let rows = sqlx::query_as::<_, NodeRow>(
            "SELECT * FROM files WHERE path = ? OR path LIKE ? ESCAPE '\\'",
        )
        .bind(&path)
        .bind(like_escape(&prefix))
        .fetch_all(&mut **tx)
        .await?;
        sqlx::query("DELETE FROM files WHERE path = ? OR path LIKE ? ESCAPE '\\'")
            .bind(&path)
            .bind(like_escape(&prefix))
            .execute(&mut **tx)
            .await?;
        Ok(rows)
    }

    /// Appends a version snapshot row.
    pub async fn add_version(
        &self,
        tx: &mut Transaction<'static, Sqlite>,
        path: &str,
        version: u64,
        size: u64,
        hash: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO file_versions (path, version, size, hash, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(protocol::normalize_path(path))
        .bind(version as i64)
        .bind(size as i64)
        .bind(hash)
        .bind(Utc::now().timestamp())
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// All stored versions of `path`, newest first.
    pub async fn versions(&self, path: &str) -> Result<Vec<VersionRow>> {
        let rows = sqlx::query_as::<_, VersionRow>(
            "SELECT * FROM file_versions WHERE path = ? ORDER BY version DESC",
        )
        .bind(protocol::normalize_path(path))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// A single version record.
    pub async fn version(&self, path: &str, version: u64) -> Result<Option<VersionRow>> {
        let row = sqlx::query_as::<_, VersionRow>(
            "SELECT * FROM file_versions WHERE path = ? AND version = ?",
        )
        .bind(protocol::normalize_path(path))
        .bind(version as i64)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Materializes the tree rooted at `path`.
    ///
    /// Loads the subtree rows in one query and buckets them by parent;
    /// each bucket is sorted directories-first, then by name. Rebuilding
    /// on demand is O(N log N) and acceptable because the result is only
    /// computed per tree request, never per filesystem operation.
    pub async fn tree(&self, path: &str) -> Result<Node> {
        let path = protocol::normalize_path(path);
        let rows = self.subtree(&path).await?;
        let root = rows
            .iter()
            .find(|r| r.path == path)
            .cloned()
            .ok_or_else(|| Error::NotFound(path.clone()))?;

        let mut buckets: HashMap<String, Vec<NodeRow>> = HashMap::new();
        for row in rows {
            if row.path == row.parent_path {
                continue; // the root is its own parent
            }
            buckets.entry(row.parent_path.clone()).or_default().push(row);
        }
        for bucket in buckets.values_mut() {
            bucket.sort_by(|a, b| b.is_dir.cmp(&a.is_dir).then_with(|| a.name.cmp(&b.name)));
        }
        Ok(build_node(&root, &buckets))
    }
}

fn build_node(row: &NodeRow, buckets: &HashMap<String, Vec<NodeRow>>) -> Node {
    let children = buckets
        .get(&row.path)
        .map(|rows| rows.iter().map(|r| build_node(r, buckets)).collect())
        .unwrap_or_default();
    row.to_node(children)
}

/// Escapes `%` and `_` in a LIKE pattern, leaving our trailing `%` intact.
fn like_escape(pattern: &str) -> String {
    let (body, tail) = pattern.split_at(pattern.len() - 1);
    let mut escaped = body.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_");
    escaped.push_str(tail);
    escaped
}
