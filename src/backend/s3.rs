//! S3 backend
//!
//! Objects are stored at `<keypath>/<name>` in one bucket. Credentials come
//! from the config when both keys are set, otherwise from the default AWS
//! provider chain.
//!
//! # Example
//!
//! ```no_run
//! use kura::backend::S3Backend;
//! use kura::config::S3Config;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let backend = S3Backend::new(&S3Config {
//!     bucket: "traces".into(),
//!     region: "us-east-1".into(),
//!     endpoint: Some("http://localhost:9000".into()),
//!     access_key: Some("minio".into()),
//!     secret_key: Some("minio123".into()),
//!     force_path_style: true,
//! })
//! .await?;
//! # Ok(())
//! # }
//! ```

use super::{BackendError, RawBackend, Result};
use crate::config::S3Config;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use bytes::Bytes;

pub struct S3Backend {
    client: Client,
    bucket: String,
}

fn s3_error<E: std::error::Error>(e: E) -> BackendError {
    BackendError::S3Error(DisplayErrorContext(e).to_string())
}

fn prefix_of(keypath: &[String]) -> String {
    if keypath.is_empty() {
        String::new()
    } else {
        format!("{}/", keypath.join("/"))
    }
}

fn key_of(name: &str, keypath: &[String]) -> String {
    format!("{}{}", prefix_of(keypath), name)
}

impl S3Backend {
    pub async fn new(config: &S3Config) -> Result<Self> {
        if config.bucket.is_empty() {
            return Err(BackendError::ConfigError("S3 bucket is required".into()));
        }

        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()));

        if let (Some(access_key), Some(secret_key)) = (&config.access_key, &config.secret_key) {
            loader = loader.credentials_provider(Credentials::new(
                access_key.clone(),
                secret_key.clone(),
                None,
                None,
                "kura-static",
            ));
        }
        if let Some(endpoint) = &config.endpoint {
            loader = loader.endpoint_url(endpoint.clone());
        }

        let shared = loader.load().await;
        let s3_config = aws_sdk_s3::config::Builder::from(&shared)
            .force_path_style(config.force_path_style)
            .build();

        tracing::info!(
            bucket = %config.bucket,
            region = %config.region,
            endpoint = ?config.endpoint,
            "S3 backend configured"
        );

        Ok(Self {
            client: Client::from_conf(s3_config),
            bucket: config.bucket.clone(),
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn get(&self, key: String, range: Option<String>) -> Result<Bytes> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .set_range(range)
            .send()
            .await;

        let output = match result {
            Ok(output) => output,
            Err(e) => {
                let missing = e
                    .as_service_error()
                    .map(|se| se.is_no_such_key())
                    .unwrap_or(false);
                return Err(if missing {
                    BackendError::NotFound(key)
                } else {
                    s3_error(e)
                });
            }
        };

        let body = output.body.collect().await.map_err(s3_error)?;
        Ok(body.into_bytes())
    }
}

#[async_trait]
impl RawBackend for S3Backend {
    #[tracing::instrument(name = "s3.list", skip(self), fields(s3.bucket = %self.bucket), err)]
    async fn list(&self, keypath: &[String]) -> Result<Vec<String>> {
        let prefix = prefix_of(keypath);
        let mut names = Vec::new();

        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(&prefix)
            .delimiter("/")
            .into_paginator()
            .send();

        while let Some(page) = pages.next().await {
            let page = page.map_err(s3_error)?;
            for common in page.common_prefixes() {
                if let Some(p) = common.prefix() {
                    let name = p[prefix.len().min(p.len())..].trim_end_matches('/');
                    if !name.is_empty() {
                        names.push(name.to_string());
                    }
                }
            }
            for object in page.contents() {
                if let Some(key) = object.key() {
                    let name = &key[prefix.len().min(key.len())..];
                    if !name.is_empty() {
                        names.push(name.to_string());
                    }
                }
            }
        }

        names.sort();
        names.dedup();
        Ok(names)
    }

    #[tracing::instrument(name = "s3.get_object", skip(self), fields(s3.bucket = %self.bucket), err)]
    async fn read(&self, name: &str, keypath: &[String]) -> Result<Bytes> {
        self.get(key_of(name, keypath), None).await
    }

    #[tracing::instrument(name = "s3.get_object_range", skip(self), fields(s3.bucket = %self.bucket), err)]
    async fn read_range(
        &self,
        name: &str,
        keypath: &[String],
        offset: u64,
        len: u64,
    ) -> Result<Bytes> {
        if len == 0 {
            return Ok(Bytes::new());
        }
        let range = format!("bytes={}-{}", offset, offset + len - 1);
        self.get(key_of(name, keypath), Some(range)).await
    }

    #[tracing::instrument(
        name = "s3.put_object",
        skip(self, data),
        fields(s3.bucket = %self.bucket, bytes = data.len()),
        err
    )]
    async fn write(&self, name: &str, keypath: &[String], data: Bytes) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key_of(name, keypath))
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(s3_error)?;
        Ok(())
    }

    #[tracing::instrument(name = "s3.delete_object", skip(self), fields(s3.bucket = %self.bucket), err)]
    async fn delete(&self, name: &str, keypath: &[String]) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key_of(name, keypath))
            .send()
            .await
            .map_err(s3_error)?;
        Ok(())
    }
}
