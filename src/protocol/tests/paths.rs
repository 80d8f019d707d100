use crate::protocol::{
    file_name, join_path, node_id, normalize_path, parent_path, storage_key, version_key,
};

#[test]
fn test_normalize_path() {
    assert_eq!(normalize_path("/"), "/");
    assert_eq!(normalize_path(""), "/");
    assert_eq!(normalize_path("a/b"), "/a/b");
    assert_eq!(normalize_path("/a//b/"), "/a/b");
    assert_eq!(normalize_path("//docs/./notes.md"), "/docs/notes.md");
    assert_eq!(normalize_path("/a/../b"), "/a/b");
}

#[test]
fn test_parent_path() {
    assert_eq!(parent_path("/"), "/");
    assert_eq!(parent_path("/a"), "/");
    assert_eq!(parent_path("/a/b/c"), "/a/b");
    assert_eq!(parent_path("a/b/"), "/a");
}

#[test]
fn test_file_name() {
    assert_eq!(file_name("/"), "");
    assert_eq!(file_name("/a"), "a");
    assert_eq!(file_name("/a/b/c.txt"), "c.txt");
}

#[test]
fn test_join_path() {
    assert_eq!(join_path("/", "a"), "/a");
    assert_eq!(join_path("/a", "b"), "/a/b");
    assert_eq!(join_path("/a/", "b"), "/a/b");
}

#[test]
fn test_path_round_trip() {
    for path in ["/a", "/a/b", "/deep/ly/nested/file.bin"] {
        assert_eq!(join_path(&parent_path(path), &file_name(path)), path);
    }
}

#[test]
fn test_node_id_stable_and_short() {
    let id = node_id("/docs/notes.md");
    assert_eq!(id.len(), 16);
    assert_eq!(id, node_id("docs/notes.md"));
    assert_ne!(id, node_id("/docs/notes2.md"));
}

#[test]
fn test_storage_keys() {
    assert_eq!(storage_key("/docs/notes.md"), "docs/notes.md");
    assert_eq!(version_key("/docs/notes.md", 3), "_versions/docs/notes.md/3");
}
