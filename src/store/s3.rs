//! S3-compatible [`ObjectStore`] backend.

use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use bytes::Bytes;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

use crate::config::S3Config;
use crate::error::{Error, Result};
use crate::store::{ByteRange, ObjectReader, ObjectStore};

/// Characters left verbatim when encoding an `x-amz-copy-source` key.
/// Everything else must be percent-encoded or S3 misparses the source.
const COPY_SOURCE_SAFE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'/')
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// `bucket/key` value for `CopySource`, with the key percent-encoded.
pub(crate) fn copy_source(bucket: &str, key: &str) -> String {
    format!("{}/{}", bucket, utf8_percent_encode(key, COPY_SOURCE_SAFE))
}

/// Content store backed by an S3-compatible service (AWS, MinIO, ...).
///
/// Path-style addressing is forced so that bucket names do not have to be
/// DNS-resolvable on self-hosted deployments.
pub struct S3Store {
    client: Client,
    bucket: String,
}

impl S3Store {
    pub fn new(config: &S3Config) -> Result<Self> {
        if config.bucket.is_empty() {
            return Err(Error::BadRequest("s3 bucket is not configured".into()));
        }
        let credentials =
            Credentials::new(&config.access_key, &config.secret_key, None, None, "tidefs");
        let mut builder = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .credentials_provider(credentials)
            .force_path_style(true);
        if !config.endpoint.is_empty() {
            let endpoint = if config.endpoint.contains("://") {
                config.endpoint.clone()
            } else if config.use_ssl {
                format!("https://{}", config.endpoint)
            } else {
                format!("http://{}", config.endpoint)
            };
            builder = builder.endpoint_url(endpoint);
        }
        Ok(Self { client: Client::from_conf(builder.build()), bucket: config.bucket.clone() })
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn get(&self, key: &str, range: Option<ByteRange>) -> Result<ObjectReader> {
        let mut request = self.client.get_object().bucket(&self.bucket).key(key);
        if let Some(range) = range {
            request = request.range(range.to_header());
        }
        let output = request.send().await.map_err(|err| {
            let service = err.into_service_error();
            if service.is_no_such_key() {
                Error::NotFound(key.to_string())
            } else {
                Error::Storage(service.to_string())
            }
        })?;
        Ok(Box::new(output.body.into_async_read()) as ObjectReader)
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|err| Error::Storage(err.into_service_error().to_string()))?;
        Ok(())
    }

    async fn copy(&self, from: &str, to: &str) -> Result<()> {
        self.client
            .copy_object()
            .bucket(&self.bucket)
            .copy_source(copy_source(&self.bucket, from))
            .key(to)
            .send()
            .await
            .map_err(|err| Error::Storage(err.into_service_error().to_string()))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| Error::Storage(err.into_service_error().to_string()))?;
        Ok(())
    }

    async fn len(&self, key: &str) -> Result<u64> {
        let output = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| {
                let service = err.into_service_error();
                if service.is_not_found() {
                    Error::NotFound(key.to_string())
                } else {
                    Error::Storage(service.to_string())
                }
            })?;
        Ok(output.content_length().unwrap_or_default() as u64)
    }
}
