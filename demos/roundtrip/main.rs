//! End-to-end demo: boots an in-process server over a temp directory,
//! uploads a file, then drives the placeholder adapter through a cold
//! read, a cache hit and a write-back.
//!
//! Run with `cargo run --example roundtrip`.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use tidefs::client::mount::{Client, MountOptions};
use tidefs::client::transport::Transport;
use tidefs::config::ServerConfig;
use tidefs::meta::MetaStore;
use tidefs::server::{router, AppState, TokenAuth};
use tidefs::store::{LocalStore, ObjectStore};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    // in-process server over throwaway storage
    let storage = tempfile::tempdir()?;
    let store: Arc<dyn ObjectStore> = Arc::new(LocalStore::open(storage.path()).await?);
    let meta = MetaStore::open("sqlite::memory:").await?;
    let auth = Arc::new(TokenAuth::new("demo-secret"));
    let token = auth.issue("demo", "roundtrip")?.token;
    let config = ServerConfig {
        database_url: "sqlite::memory:".into(),
        jwt_secret: "demo-secret".into(),
        ..Default::default()
    };
    let state = Arc::new(AppState::new(config, meta, store, auth));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let base = format!("http://{}", listener.local_addr()?);
    let app = router(state);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    println!("server listening on {base}");

    // seed a file from a second device
    let writer = Transport::new(&base, Some(token.clone()))?;
    writer.upload("/hello.txt", Bytes::from_static(b"Hello, world!\n"), None, None).await?;

    // bring up the client stack
    let cache_dir = tempfile::tempdir()?;
    let client = Client::start(MountOptions {
        server: base,
        mount_point: "/tmp/tidefs-demo".into(),
        cache_dir: cache_dir.path().to_path_buf(),
        max_cache: 64 * 1024 * 1024,
        token: Some(token),
        refresh: Duration::from_secs(30),
        watch: true,
        health_check: Duration::from_secs(30),
        verify_hash: true,
    })
    .await?;

    // cold read hydrates, second read hits the cache
    for pass in ["cold", "cached"] {
        let handle = client.adapter.open("/hello.txt")?;
        let data = client.adapter.read(handle, 0, 64).await?;
        client.adapter.release(handle).await?;
        println!("{pass} read: {:?}", String::from_utf8_lossy(&data));
    }
    let stats = client.adapter.cache().stats();
    println!("cache: {} entries, {} bytes", stats.count, stats.current_size);

    // write-back through the adapter
    let handle = client.adapter.create("/", "reply.txt")?;
    client.adapter.write(handle, 0, b"Hi back!\n").await?;
    client.adapter.release(handle).await?;
    let node = client.mirror.get("/reply.txt").expect("uploaded node");
    println!("wrote /reply.txt at version {} ({} bytes)", node.version, node.size);

    client.shutdown();
    Ok(())
}
