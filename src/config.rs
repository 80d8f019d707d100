//! Server configuration: TOML file with `TIDEFS_*` environment overrides.

#[cfg(test)]
mod tests;

use std::env;
use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Default bind address of the HTTP listener.
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";
/// Default cap on upload bodies (64 MiB).
pub const DEFAULT_MAX_UPLOAD: u64 = 64 * 1024 * 1024;

/// Which object store backs file content.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ContentBackend {
    #[default]
    Local,
    S3,
}

/// S3-compatible object store settings.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct S3Config {
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub bucket: String,
    #[serde(default)]
    pub access_key: String,
    #[serde(default)]
    pub secret_key: String,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default = "default_true")]
    pub use_ssl: bool,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_true() -> bool {
    true
}

/// Full server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// SQLite connection string, e.g. `sqlite://tidefs.db`. Required.
    #[serde(default)]
    pub database_url: String,
    /// HS256 secret for issued tokens. Required.
    #[serde(default)]
    pub jwt_secret: String,
    #[serde(default)]
    pub content_backend: ContentBackend,
    #[serde(default = "default_storage_path")]
    pub local_storage_path: String,
    #[serde(default)]
    pub s3: S3Config,
    #[serde(default = "default_max_upload")]
    pub max_upload_size: u64,
    #[serde(default)]
    pub tls_cert_file: String,
    #[serde(default)]
    pub tls_key_file: String,
}

fn default_listen_addr() -> String {
    DEFAULT_LISTEN_ADDR.to_string()
}

fn default_storage_path() -> String {
    "./tidefs-data".to_string()
}

fn default_max_upload() -> u64 {
    DEFAULT_MAX_UPLOAD
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            database_url: String::new(),
            jwt_secret: String::new(),
            content_backend: ContentBackend::Local,
            local_storage_path: default_storage_path(),
            s3: S3Config::default(),
            max_upload_size: DEFAULT_MAX_UPLOAD,
            tls_cert_file: String::new(),
            tls_key_file: String::new(),
        }
    }
}

impl ServerConfig {
    /// Loads configuration from an optional TOML file, then applies
    /// `TIDEFS_*` environment overrides, then validates.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)?;
                toml::from_str(&raw)
                    .map_err(|err| Error::BadRequest(format!("config parse error: {err}")))?
            }
            None => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(v) = env::var("TIDEFS_LISTEN_ADDR") {
            self.listen_addr = v;
        }
        if let Ok(v) = env::var("TIDEFS_DATABASE_URL") {
            self.database_url = v;
        }
        if let Ok(v) = env::var("TIDEFS_JWT_SECRET") {
            self.jwt_secret = v;
        }
        if let Ok(v) = env::var("TIDEFS_CONTENT_BACKEND") {
            self.content_backend =
                if v.eq_ignore_ascii_case("s3") { ContentBackend::S3 } else { ContentBackend::Local };
        }
        if let Ok(v) = env::var("TIDEFS_LOCAL_STORAGE_PATH") {
            self.local_storage_path = v;
        }
        if let Ok(v) = env::var("TIDEFS_MAX_UPLOAD_SIZE") {
            if let Ok(parsed) = parse_size(&v) {
                self.max_upload_size = parsed;
            }
        }
        if let Ok(v) = env::var("TIDEFS_S3_ENDPOINT") {
            self.s3.endpoint = v;
        }
        if let Ok(v) = env::var("TIDEFS_S3_BUCKET") {
            self.s3.bucket = v;
        }
        if let Ok(v) = env::var("TIDEFS_S3_ACCESS_KEY") {
            self.s3.access_key = v;
        }
        if let Ok(v) = env::var("TIDEFS_S3_SECRET_KEY") {
            self.s3.secret_key = v;
        }
        if let Ok(v) = env::var("TIDEFS_S3_REGION") {
            self.s3.region = v;
        }
        if let Ok(v) = env::var("TIDEFS_TLS_CERT_FILE") {
            self.tls_cert_file = v;
        }
        if let Ok(v) = env::var("TIDEFS_TLS_KEY_FILE") {
            self.tls_key_file = v;
        }
    }

    fn validate(&self) -> Result<()> {
        if self.database_url.is_empty() {
            return Err(Error::BadRequest("database_url is required".into()));
        }
        if self.jwt_secret.is_empty() {
            return Err(Error::BadRequest("jwt_secret is required".into()));
        }
        if self.content_backend == ContentBackend::S3 && self.s3.bucket.is_empty() {
            return Err(Error::BadRequest("s3.bucket is required for the s3 backend".into()));
        }
        if self.tls_cert_file.is_empty() != self.tls_key_file.is_empty() {
            return Err(Error::BadRequest(
                "tls_cert_file and tls_key_file must be set together".into(),
            ));
        }
        Ok(())
    }

    pub fn tls_enabled(&self) -> bool {
        !self.tls_cert_file.is_empty()
    }
}

/// Parses a byte count with an optional binary or decimal suffix.
///
/// Accepts `1048576`, `512KiB`, `4MiB`, `1GiB`, `100KB`, `2MB`, `1GB`.
pub fn parse_size(input: &str) -> Result<u64> {
    let input = input.trim();
    let split = input.find(|c: char| !c.is_ascii_digit()).unwrap_or(input.len());
    let (digits, suffix) = input.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| Error::BadRequest(format!("invalid size: {input}")))?;
    let multiplier = match suffix.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "kib" | "k" => 1024,
        "mib" | "m" => 1024 * 1024,
        "gib" | "g" => 1024 * 1024 * 1024,
        "kb" => 1000,
        "mb" => 1_000_000,
        "gb" => 1_000_000_000,
        other => return Err(Error::BadRequest(format!("unknown size suffix: {other}"))),
    };
    value
        .checked_mul(multiplier)
        .ok_or_else(|| Error::BadRequest(format!("size overflows u64: {input}")))
}
