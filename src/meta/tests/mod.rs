#![cfg(test)]

use crate::meta::MetaStore;
use crate::protocol::Visibility;

async fn store() -> MetaStore {
    MetaStore::open("sqlite::memory:").await.unwrap()
}

async fn put_file(store: &MetaStore, path: &str, size: u64, hash: &str, version: u64) {
    let mut tx = store.begin().await.unwrap();
    store.ensure_parents(&mut tx, path, "u1").await.unwrap();
    store
        .upsert_file(&mut tx, path, size, hash, version, "u1", Visibility::Private)
        .await
        .unwrap();
    tx.commit().await.unwrap();
}

#[tokio::test]
async fn test_root_exists_after_open() {
    let store = store().await;
    let root = store.get("/").await.unwrap().unwrap();
    assert!(root.is_dir);
    assert_eq!(root.parent_path, "/");
}

#[tokio::test]
async fn test_upsert_creates_parents() {
    let store = store().await;
    put_file(&store, "/docs/deep/notes.md", 10, "h1", 1).await;

    let docs = store.get("/docs").await.unwrap().unwrap();
    assert!(docs.is_dir);
    let deep = store.get("/docs/deep").await.unwrap().unwrap();
    assert!(deep.is_dir);
    assert_eq!(deep.parent_path, "/docs");

    let file = store.get("/docs/deep/notes.md").await.unwrap().unwrap();
    assert!(!file.is_dir);
    assert_eq!(file.size, 10);
    assert_eq!(file.version, 1);
    assert_eq!(file.storage_key, "docs/deep/notes.md");
}

#[tokio::test]
async fn test_tree_orders_directories_first() {
    let store = store().await;
    put_file(&store, "/b.txt", 1, "hb", 1).await;
    put_file(&store, "/a.txt", 1, "ha", 1).await;
    put_file(&store, "/zdir/child.txt", 1, "hc", 1).await;

    let tree = store.tree("/").await.unwrap();
    let names: Vec<&str> = tree.children.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["zdir", "a.txt", "b.txt"]);
    assert_eq!(tree.children[0].children[0].name, "child.txt");
}

#[tokio::test]
async fn test_subtree_rooted_below() {
    let store = store().await;
    put_file(&store, "/docs/notes.md", 1, "h", 1).await;
    put_file(&store, "/other.txt", 1, "h", 1).await;

    let tree = store.tree("/docs").await.unwrap();
    assert_eq!(tree.path, "/docs");
    assert_eq!(tree.children.len(), 1);
}

#[tokio::test]
async fn test_delete_subtree_counts_and_cascades_versions() {
    let store = store().await;
    put_file(&store, "/d/a.txt", 1, "h1", 2).await;
    put_file(&store, "/d/sub/b.txt", 1, "h2", 1).await;

    let mut tx = store.begin().await.unwrap();
    store.add_version(&mut tx, "/d/a.txt", 1, 1, "h0").await.unwrap();
    tx.commit().await.unwrap();

    let mut tx = store.begin().await.unwrap();
    let removed = store.delete_subtree(&mut tx, "/d").await.unwrap();
    tx.commit().await.unwrap();

    assert_eq!(removed.len(), 4); // /d, /d/a.txt, /d/sub, /d/sub/b.txt
    assert!(store.get("/d/a.txt").await.unwrap().is_none());
    assert!(store.versions("/d/a.txt").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_delete_root_is_rejected() {
    let store = store().await;
    let mut tx = store.begin().await.unwrap();
    assert!(store.delete_subtree(&mut tx, "/").await.is_err());
}

#[tokio::test]
async fn test_versions_newest_first() {
    let store = store().await;
    put_file(&store, "/f", 3, "h3", 3).await;
    let mut tx = store.begin().await.unwrap();
    store.add_version(&mut tx, "/f", 1, 1, "h1").await.unwrap();
    store.add_version(&mut tx, "/f", 2, 2, "h2").await.unwrap();
    tx.commit().await.unwrap();

    let versions = store.versions("/f").await.unwrap();
    assert_eq!(versions.iter().map(|v| v.version).collect::<Vec<_>>(), vec![2, 1]);
    assert_eq!(store.version("/f", 1).await.unwrap().unwrap().hash, "h1");
    assert!(store.version("/f", 9).await.unwrap().is_none());
}

#[tokio::test]
async fn test_like_wildcards_in_paths_do_not_leak() {
    let store = store().await;
    put_file(&store, "/a%b/file.txt", 1, "h", 1).await;
    put_file(&store, "/axb/other.txt", 1, "h", 1).await;

    let mut tx = store.begin().await.unwrap();
    let removed = store.delete_subtree(&mut tx, "/a%b").await.unwrap();
    tx.commit().await.unwrap();

    assert_eq!(removed.len(), 2);
    assert!(store.get("/axb/other.txt").await.unwrap().is_some());
}
