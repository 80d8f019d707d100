use std::io::IsTerminal;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use tidefs::cli::{CacheAction, Cli, Command};
use tidefs::client::cache::ContentCache;
use tidefs::client::mount::{run_mount, MountOptions};
use tidefs::client::transport::Transport;
use tidefs::config::{parse_size, ServerConfig};

/// Normal shutdown.
const EXIT_OK: u8 = 0;
/// Configuration or startup failure.
const EXIT_CONFIG: u8 = 1;
/// Mount or filesystem error.
const EXIT_MOUNT: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let code = match cli.command {
        Command::Serve { config } => serve(config).await,
        Command::Mount {
            mount,
            server,
            cache,
            max_cache,
            token,
            refresh,
            watch,
            health_check,
            verify_hash,
        } => {
            let max_cache = match parse_size(&max_cache) {
                Ok(size) => size,
                Err(err) => {
                    error!(error = %err, "invalid --max-cache");
                    return ExitCode::from(EXIT_CONFIG);
                }
            };
            let options = MountOptions {
                server,
                mount_point: mount,
                cache_dir: cache,
                max_cache,
                token,
                refresh: Duration::from_secs(refresh),
                watch,
                health_check: Duration::from_secs(health_check),
                verify_hash,
            };
            match run_mount(options).await {
                Ok(()) => EXIT_OK,
                Err(err) => {
                    error!(error = %err, "mount failed");
                    EXIT_MOUNT
                }
            }
        }
        Command::Login { server, username, device } => login(&server, &username, &device).await,
        Command::Cache { dir, action } => cache_maintenance(dir, action).await,
    };
    ExitCode::from(code)
}

async fn serve(config: Option<std::path::PathBuf>) -> u8 {
    let config = match ServerConfig::load(config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "configuration error");
            return EXIT_CONFIG;
        }
    };
    match tidefs::server::serve(config).await {
        Ok(()) => EXIT_OK,
        Err(err) => {
            error!(error = %err, "server failed");
            EXIT_CONFIG
        }
    }
}

async fn login(server: &str, username: &str, device: &str) -> u8 {
    if std::io::stdin().is_terminal() {
        eprint!("Password: ");
    }
    let mut password = String::new();
    if std::io::stdin().read_line(&mut password).is_err() {
        error!("failed to read password from stdin");
        return EXIT_CONFIG;
    }
    match Transport::login(server, username, password.trim_end(), device).await {
        Ok(reply) => {
            println!("{}", reply.token);
            EXIT_OK
        }
        Err(err) => {
            error!(error = %err, "login failed");
            EXIT_CONFIG
        }
    }
}

async fn cache_maintenance(dir: std::path::PathBuf, action: CacheAction) -> u8 {
    // maintenance never ingests, so the capacity is irrelevant here
    let cache = match ContentCache::open(&dir, u64::MAX).await {
        Ok(cache) => cache,
        Err(err) => {
            error!(error = %err, dir = %dir.display(), "cannot open cache");
            return EXIT_CONFIG;
        }
    };
    let result = match action {
        CacheAction::Stats => {
            let stats = cache.stats();
            println!("entries: {}  pinned: {}  bytes: {}", stats.count, stats.pinned, stats.current_size);
            for (id, size, pinned) in cache.entries() {
                println!("{}  {:>12}  {}", if pinned { "pin" } else { "   " }, size, id);
            }
            Ok(())
        }
        CacheAction::Pin { id } => cache.pin(&id).await,
        CacheAction::Unpin { id } => cache.unpin(&id).await,
        CacheAction::Evict { id } => cache.evict(&id).await,
    };
    match result {
        Ok(()) => EXIT_OK,
        Err(err) => {
            error!(error = %err, "cache operation failed");
            EXIT_CONFIG
        }
    }
}
