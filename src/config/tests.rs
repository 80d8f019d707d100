#![cfg(test)]

use crate::config::{parse_size, ContentBackend, ServerConfig, DEFAULT_MAX_UPLOAD};

#[test]
fn test_parse_size() {
    assert_eq!(parse_size("14").unwrap(), 14);
    assert_eq!(parse_size("512KiB").unwrap(), 512 * 1024);
    assert_eq!(parse_size("4MiB").unwrap(), 4 * 1024 * 1024);
    assert_eq!(parse_size("1GiB").unwrap(), 1024 * 1024 * 1024);
    assert_eq!(parse_size("2MB").unwrap(), 2_000_000);
    assert_eq!(parse_size(" 1 GiB ").unwrap(), 1024 * 1024 * 1024);
}

#[test]
fn test_parse_size_rejects_garbage() {
    assert!(parse_size("").is_err());
    assert!(parse_size("MiB").is_err());
    assert!(parse_size("12parsecs").is_err());
}

#[test]
fn test_toml_round_trip() {
    let raw = r#"
        listen_addr = "127.0.0.1:9000"
        database_url = "sqlite://meta.db"
        jwt_secret = "secret"
        content_backend = "s3"
        max_upload_size = 1024

        [s3]
        endpoint = "http://127.0.0.1:9001"
        bucket = "tidefs"
        access_key = "ak"
        secret_key = "sk"
    "#;
    let config: ServerConfig = toml::from_str(raw).unwrap();
    assert_eq!(config.listen_addr, "127.0.0.1:9000");
    assert_eq!(config.content_backend, ContentBackend::S3);
    assert_eq!(config.max_upload_size, 1024);
    assert_eq!(config.s3.bucket, "tidefs");
    assert_eq!(config.s3.region, "us-east-1");
}

#[test]
fn test_defaults() {
    let config: ServerConfig = toml::from_str("").unwrap();
    assert_eq!(config.listen_addr, "0.0.0.0:8080");
    assert_eq!(config.max_upload_size, DEFAULT_MAX_UPLOAD);
    assert_eq!(config.content_backend, ContentBackend::Local);
    assert!(!config.tls_enabled());
}

#[test]
fn test_validation_requires_database_and_secret() {
    let mut config = ServerConfig { database_url: "sqlite::memory:".into(), ..Default::default() };
    assert!(config.validate().is_err());
    config.jwt_secret = "s".into();
    assert!(config.validate().is_ok());
}

#[test]
fn test_validation_requires_paired_tls_files() {
    let mut config = ServerConfig {
        database_url: "sqlite::memory:".into(),
        jwt_secret: "s".into(),
        tls_cert_file: "cert.pem".into(),
        ..Default::default()
    };
    assert!(config.validate().is_err());
    config.tls_key_file = "key.pem".into();
    assert!(config.validate().is_ok());
    assert!(config.tls_enabled());
}
