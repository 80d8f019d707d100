//! Command-line interface of the `tidefs` binary.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Self-hosted on-demand file synchronization.
#[derive(Debug, Parser)]
#[command(name = "tidefs", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the tidefs server.
    Serve {
        /// Path to the TOML configuration file; TIDEFS_* environment
        /// variables override file values.
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Mount the remote tree as a local placeholder filesystem.
    Mount {
        /// Mount point served to the kernel binding.
        #[arg(long)]
        mount: PathBuf,
        /// Server base URL, e.g. https://files.example.org:8080.
        #[arg(long)]
        server: String,
        /// Cache directory.
        #[arg(long, default_value = "./tidefs-cache")]
        cache: PathBuf,
        /// Cache capacity (accepts 512KiB / 4MiB / 1GiB suffixes).
        #[arg(long = "max-cache", default_value = "1GiB")]
        max_cache: String,
        /// Bearer token obtained via `tidefs login`.
        #[arg(long, env = "TIDEFS_TOKEN")]
        token: Option<String>,
        /// Full-tree refresh interval in seconds; 0 disables.
        #[arg(long, default_value_t = 30)]
        refresh: u64,
        /// Subscribe to the server event stream.
        #[arg(long)]
        watch: bool,
        /// Health probe interval in seconds.
        #[arg(long = "health-check", default_value_t = 30)]
        health_check: u64,
        /// Verify SHA-256 of downloaded content.
        #[arg(long = "verify-hash")]
        verify_hash: bool,
    },
    /// Obtain a bearer token (reads the password from stdin).
    Login {
        #[arg(long)]
        server: String,
        #[arg(long)]
        username: String,
        /// Device name recorded with the token.
        #[arg(long, default_value = "cli")]
        device: String,
    },
    /// Offline maintenance of a cache directory.
    Cache {
        /// Cache directory to operate on.
        #[arg(long)]
        dir: PathBuf,
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Debug, Subcommand)]
pub enum CacheAction {
    /// Print cache statistics and entries.
    Stats,
    /// Exempt an entry from eviction.
    Pin { id: String },
    /// Clear an entry's pin flag.
    Unpin { id: String },
    /// Remove an entry (refused for pinned entries).
    Evict { id: String },
}
