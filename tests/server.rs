//! Integration tests for the HTTP server, driven in-process.

mod common;

use std::io::Read;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tower::util::ServiceExt;

use common::{test_server, test_server_with, TestServer};
use tidefs::server::router;

async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap().to_vec()
}

async fn body_json(response: axum::response::Response) -> Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

fn app(server: &TestServer) -> Router {
    router(server.state.clone())
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

async fn upload(server: &TestServer, path: &str, body: &[u8]) -> Value {
    let response = app(server)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/api/v1/content{path}"))
                .header(header::AUTHORIZATION, format!("Bearer {}", server.token))
                .body(Body::from(body.to_vec()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    body_json(response).await
}

async fn get(server: &TestServer, uri: &str) -> axum::response::Response {
    app(server)
        .oneshot(
            Request::builder()
                .uri(uri)
                .header(header::AUTHORIZATION, format!("Bearer {}", server.token))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap()
}

async fn get_with(
    server: &TestServer,
    uri: &str,
    name: header::HeaderName,
    value: &str,
) -> axum::response::Response {
    app(server)
        .oneshot(
            Request::builder()
                .uri(uri)
                .header(header::AUTHORIZATION, format!("Bearer {}", server.token))
                .header(name, value)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap()
}

#[tokio::test]
async fn test_health_and_auth_gate() {
    let server = test_server().await;

    let response =
        app(&server).oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap()).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "ok");

    // protected endpoints require a bearer token
    let response = app(&server)
        .oneshot(Request::builder().uri("/api/v1/tree").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_token_endpoint() {
    let server = test_server().await;
    let response = app(&server)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v1/auth/token")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    r#"{"username":"bob","password":"pw","device_name":"laptop"}"#,
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert!(json["token"].as_str().unwrap().contains('.'));
    assert_eq!(json["user"]["username"], "bob");
}

#[tokio::test]
async fn test_upload_get_round_trip() {
    let server = test_server().await;
    let body = b"Hello, world!\n";
    let reply = upload(&server, "/hello.txt", body).await;
    assert_eq!(reply["path"], "/hello.txt");
    assert_eq!(reply["size"], 14);
    assert_eq!(reply["version"], 1);
    assert_eq!(reply["hash"], sha256_hex(body));

    let response = get(&server, "/api/v1/content/hello.txt").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-version"], "1");
    assert_eq!(
        response.headers()[header::ETAG],
        format!("\"{}\"", sha256_hex(body)).as_str()
    );
    assert_eq!(response.headers()[header::CONTENT_LENGTH], "14");
    let got = body_bytes(response).await;
    assert_eq!(got, body);
    assert_eq!(sha256_hex(&got), sha256_hex(body));
}

#[tokio::test]
async fn test_upload_creates_parent_directories() {
    let server = test_server().await;
    upload(&server, "/docs/deep/notes.md", b"hi").await;

    let response = get(&server, "/api/v1/tree").await;
    let tree = body_json(response).await;
    let root = &tree["root"];
    assert_eq!(root["path"], "/");
    let docs = &root["children"][0];
    assert_eq!(docs["path"], "/docs");
    assert_eq!(docs["is_dir"], true);
    let deep = &docs["children"][0];
    assert_eq!(deep["children"][0]["path"], "/docs/deep/notes.md");
}

#[tokio::test]
async fn test_tree_is_served_from_metadata_only() {
    let server = test_server().await;
    upload(&server, "/a.txt", b"aaa").await;
    upload(&server, "/b/c.txt", b"ccc").await;
    let before = server.store.read_count();

    let response = get(&server, "/api/v1/tree").await;
    assert_eq!(response.status(), StatusCode::OK);
    let _ = body_bytes(response).await;
    let response = get(&server, "/api/v1/tree?path=/b").await;
    assert_eq!(response.status(), StatusCode::OK);

    assert_eq!(server.store.read_count(), before, "tree reads must not touch content");
}

#[tokio::test]
async fn test_tree_gzip_encoding() {
    let server = test_server().await;
    upload(&server, "/a.txt", b"aaa").await;

    let response =
        get_with(&server, "/api/v1/tree", header::ACCEPT_ENCODING, "gzip, deflate").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_ENCODING], "gzip");
    let compressed = body_bytes(response).await;
    let mut decoder = flate2::read::GzDecoder::new(&compressed[..]);
    let mut raw = String::new();
    decoder.read_to_string(&mut raw).unwrap();
    let tree: Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(tree["root"]["children"][0]["name"], "a.txt");
}

#[tokio::test]
async fn test_range_requests() {
    let server = test_server().await;
    upload(&server, "/blob", b"0123456789").await;

    // single-byte closed range
    let response = get_with(&server, "/api/v1/content/blob", header::RANGE, "bytes=0-0").await;
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes 0-0/10");
    assert_eq!(body_bytes(response).await, b"0");

    // suffix range
    let response = get_with(&server, "/api/v1/content/blob", header::RANGE, "bytes=-3").await;
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(body_bytes(response).await, b"789");

    // suffix longer than the file returns the whole file
    let response = get_with(&server, "/api/v1/content/blob", header::RANGE, "bytes=-999").await;
    assert_eq!(body_bytes(response).await, b"0123456789");

    // start past the end
    let response = get_with(&server, "/api/v1/content/blob", header::RANGE, "bytes=10-11").await;
    assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
    assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes */10");
}

#[tokio::test]
async fn test_if_none_match_revalidation() {
    let server = test_server().await;
    let reply = upload(&server, "/a.txt", b"aaa").await;
    let etag = format!("\"{}\"", reply["hash"].as_str().unwrap());

    let response =
        get_with(&server, "/api/v1/content/a.txt", header::IF_NONE_MATCH, &etag).await;
    assert_eq!(response.status(), StatusCode::NOT_MODIFIED);

    let response =
        get_with(&server, "/api/v1/content/a.txt", header::IF_NONE_MATCH, "\"stale\"").await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_optimistic_concurrency_conflict() {
    let server = test_server().await;
    upload(&server, "/notes.md", b"v1").await;
    upload(&server, "/notes.md", b"v2").await;
    let v3 = upload(&server, "/notes.md", b"v3").await;
    let h3 = v3["hash"].as_str().unwrap().to_string();

    // writer A at version 3 wins
    let response = app(&server)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v1/content/notes.md")
                .header(header::AUTHORIZATION, format!("Bearer {}", server.token))
                .header("x-expected-version", "3")
                .header(header::IF_MATCH, format!("\"{h3}\""))
                .body(Body::from("A"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let winner = body_json(response).await;
    assert_eq!(winner["version"], 4);

    // writer B still at version 3 loses with the structured body
    let response = app(&server)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v1/content/notes.md")
                .header(header::AUTHORIZATION, format!("Bearer {}", server.token))
                .header("x-expected-version", "3")
                .header(header::IF_MATCH, format!("\"{h3}\""))
                .body(Body::from("B"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let conflict = body_json(response).await;
    assert_eq!(conflict["expected_version"], 3);
    assert_eq!(conflict["current_version"], 4);
    assert_eq!(conflict["current_hash"], winner["hash"]);

    // and the losing write did not change the content
    let response = get(&server, "/api/v1/content/notes.md").await;
    assert_eq!(body_bytes(response).await, b"A");
}

#[tokio::test]
async fn test_last_write_wins_without_headers() {
    let server = test_server().await;
    assert_eq!(upload(&server, "/f", b"one").await["version"], 1);
    assert_eq!(upload(&server, "/f", b"two").await["version"], 2);
    let response = get(&server, "/api/v1/content/f").await;
    assert_eq!(body_bytes(response).await, b"two");
}

#[tokio::test]
async fn test_upload_size_limit_boundary() {
    let server = test_server_with(16).await;

    // exactly the limit is accepted
    let reply = upload(&server, "/fits", &[0x61; 16]).await;
    assert_eq!(reply["size"], 16);

    // one byte over is rejected with 413
    let response = app(&server)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v1/content/toobig")
                .header(header::AUTHORIZATION, format!("Bearer {}", server.token))
                .body(Body::from(vec![0x61; 17]))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn test_mkdir_idempotent() {
    let server = test_server().await;
    for _ in 0..2 {
        let response = app(&server)
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/api/v1/tree/projects/rust?type=dir")
                    .header(header::AUTHORIZATION, format!("Bearer {}", server.token))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let json = body_json(response).await;
        assert_eq!(json["path"], "/projects/rust");
        assert_eq!(json["isDir"], true);
    }

    let tree = body_json(get(&server, "/api/v1/tree").await).await;
    let projects = &tree["root"]["children"][0];
    assert_eq!(projects["children"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_delete_cascades_and_counts() {
    let server = test_server().await;
    upload(&server, "/d/a.txt", b"a1").await;
    upload(&server, "/d/a.txt", b"a2").await; // creates a version snapshot
    upload(&server, "/d/sub/b.txt", b"b").await;

    let response = app(&server)
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/api/v1/tree/d")
                .header(header::AUTHORIZATION, format!("Bearer {}", server.token))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    // /d, /d/a.txt, /d/sub, /d/sub/b.txt
    assert_eq!(json["deleted"], 4);

    let response = get(&server, "/api/v1/content/d/a.txt").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    // version backups were purged with the file
    assert!(server.state.store.len("_versions/d/a.txt/1").await.is_err());
}

#[tokio::test]
async fn test_version_history_and_content() {
    let server = test_server().await;
    upload(&server, "/config.yaml", b"a").await;
    upload(&server, "/config.yaml", b"b").await;
    upload(&server, "/config.yaml", b"c").await;

    let list = body_json(get(&server, "/api/v1/versions/config.yaml").await).await;
    assert_eq!(list["current_version"], 3);
    let versions = list["versions"].as_array().unwrap();
    assert_eq!(versions.len(), 3);
    let numbers: Vec<u64> = versions.iter().map(|v| v["version"].as_u64().unwrap()).collect();
    assert_eq!(numbers, vec![3, 2, 1]);

    let response = get(&server, "/api/v1/versions/config.yaml?v=2").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-version"], "2");
    assert_eq!(
        response.headers()["x-version-hash"],
        sha256_hex(b"b").as_str()
    );
    assert_eq!(body_bytes(response).await, b"b");

    let response = get(&server, "/api/v1/versions/config.yaml?v=9").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_rollback_creates_new_version() {
    let server = test_server().await;
    upload(&server, "/config.yaml", b"a").await;
    upload(&server, "/config.yaml", b"b").await;
    upload(&server, "/config.yaml", b"c").await;

    let response = app(&server)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v1/versions/config.yaml")
                .header(header::AUTHORIZATION, format!("Bearer {}", server.token))
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(r#"{"version":1}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["restored_version"], 1);
    assert_eq!(json["new_version"], 4);

    let response = get(&server, "/api/v1/content/config.yaml").await;
    assert_eq!(body_bytes(response).await, b"a");

    let list = body_json(get(&server, "/api/v1/versions/config.yaml").await).await;
    assert_eq!(list["current_version"], 4);
    assert_eq!(list["versions"].as_array().unwrap().len(), 4);
}

#[tokio::test]
async fn test_rollback_is_reversible() {
    let server = test_server().await;
    upload(&server, "/f", b"a").await;
    upload(&server, "/f", b"b").await;
    upload(&server, "/f", b"c").await;

    // roll back to 1, then roll back to the pre-rollback current (3)
    for (target, expected_new, expected_body) in [(1, 4, b"a"), (3, 5, b"c")] {
        let response = app(&server)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/versions/f")
                    .header(header::AUTHORIZATION, format!("Bearer {}", server.token))
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(format!("{{\"version\":{target}}}")))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["new_version"], expected_new);

        let response = get(&server, "/api/v1/content/f").await;
        assert_eq!(body_bytes(response).await, expected_body);
    }
}

#[tokio::test]
async fn test_content_of_missing_path_is_404() {
    let server = test_server().await;
    let response = get(&server, "/api/v1/content/ghost.txt").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let response = get(&server, "/api/v1/versions/ghost.txt").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_empty_file_versioning() {
    let server = test_server().await;
    let reply = upload(&server, "/empty", b"").await;
    assert_eq!(reply["size"], 0);
    assert_eq!(reply["version"], 1);

    // overwriting a zero-length file does not snapshot the empty state
    upload(&server, "/empty", b"data").await;
    let list = body_json(get(&server, "/api/v1/versions/empty").await).await;
    assert_eq!(list["current_version"], 2);
    assert_eq!(list["versions"].as_array().unwrap().len(), 1);
}
