//! Client stack assembly: wires the transport, cache, mirror, adapter
//! and background workers together for the mount frontend.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::client::adapter::{Adapter, AdapterOptions};
use crate::client::cache::ContentCache;
use crate::client::subscriber::EventSubscriber;
use crate::client::transport::{HealthProbe, Transport};
use crate::client::tree::{Mirror, TreeRefresher};
use crate::error::{Error, Result};
use crate::protocol::EventRecord;

/// Everything the `mount` subcommand needs to run a client.
#[derive(Debug, Clone)]
pub struct MountOptions {
    pub server: String,
    pub mount_point: PathBuf,
    pub cache_dir: PathBuf,
    pub max_cache: u64,
    pub token: Option<String>,
    /// Full-tree refresh interval; zero disables the periodic refresh.
    pub refresh: Duration,
    /// Subscribe to the server event stream.
    pub watch: bool,
    pub health_check: Duration,
    pub verify_hash: bool,
}

/// A running client: adapter plus its background workers.
pub struct Client {
    pub adapter: Arc<Adapter>,
    pub mirror: Arc<Mirror>,
    pub transport: Arc<Transport>,
    workers: Vec<JoinHandle<()>>,
}

impl Client {
    /// Brings the whole client stack up. The initial tree fetch must
    /// succeed; everything after that degrades gracefully to offline.
    pub async fn start(options: MountOptions) -> Result<Self> {
        let transport = Transport::new(&options.server, options.token.clone())?;
        let cache = Arc::new(ContentCache::open(&options.cache_dir, options.max_cache).await?);
        let mirror = Arc::new(Mirror::new());

        let root = transport.fetch_tree(None).await?;
        mirror.replace(root);
        info!(server = %options.server, "initial tree loaded");

        let mut workers = Vec::new();
        workers.push(HealthProbe::spawn(transport.clone(), options.health_check));
        workers.push(TreeRefresher::spawn(transport.clone(), mirror.clone(), options.refresh));
        if options.watch {
            let (sender, receiver) = mpsc::unbounded_channel();
            workers.push(EventSubscriber::spawn(transport.clone(), sender));
            workers.push(EventApplier::spawn(receiver, mirror.clone()));
        }

        let adapter = Arc::new(Adapter::new(
            transport.clone(),
            mirror.clone(),
            cache,
            AdapterOptions { verify_hash: options.verify_hash, ..Default::default() },
        ));
        Ok(Self { adapter, mirror, transport, workers })
    }

    /// Stops the background workers.
    pub fn shutdown(self) {
        for worker in &self.workers {
            worker.abort();
        }
        info!("client stack stopped");
    }
}

/// Applies pushed events to the mirror.
struct EventApplier {
    receiver: mpsc::UnboundedReceiver<EventRecord>,
    mirror: Arc<Mirror>,
}

impl EventApplier {
    fn spawn(
        receiver: mpsc::UnboundedReceiver<EventRecord>,
        mirror: Arc<Mirror>,
    ) -> JoinHandle<()> {
        tokio::spawn(Self { receiver, mirror }.run())
    }

    async fn run(mut self) {
        while let Some(event) = self.receiver.recv().await {
            debug!(kind = ?event.kind, path = %event.path, "applying pushed event");
            self.mirror.apply_event(&event);
        }
    }
}

/// Runs a mounted client until interrupted.
pub async fn run_mount(options: MountOptions) -> Result<()> {
    if options.mount_point.as_os_str().is_empty() {
        return Err(Error::BadRequest("mount point is required".into()));
    }
    let client = Client::start(options.clone()).await?;
    info!(mount = %options.mount_point.display(), "client ready; serving the kernel binding");
    let _ = tokio::signal::ctrl_c().await;
    client.shutdown();
    Ok(())
}
