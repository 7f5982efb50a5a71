//! Object storage backends
//!
//! Blocks live under `<tenant>/<block id>/`:
//!
//! | Object | Contents |
//! |--------|----------|
//! | `meta.json` | [`BlockMeta`], written last |
//! | `meta.compacted.json` | [`CompactedBlockMeta`], replaces `meta.json` |
//! | `bloom-<n>` | one bloom filter shard |
//! | `index` | sorted records plus checksum |
//! | `data` | pages of framed objects |
//!
//! [`RawBackend`] moves opaque bytes; [`Backend`] layers block-level reads and
//! writes on top of it.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

pub mod local;
pub mod memory;
pub mod meta;
pub mod s3;

pub use local::LocalBackend;
pub use memory::MemoryBackend;
pub use meta::{BlockMeta, CompactedBlockMeta};
pub use s3::S3Backend;

pub const META_NAME: &str = "meta.json";
pub const COMPACTED_META_NAME: &str = "meta.compacted.json";
pub const INDEX_NAME: &str = "index";
pub const DATA_NAME: &str = "data";
const BLOOM_PREFIX: &str = "bloom-";

/// Backend errors
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("S3 error: {0}")]
    S3Error(String),

    #[error("Invalid block meta: {0}")]
    InvalidMeta(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl BackendError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, BackendError::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, BackendError>;

/// Name of one bloom shard object
pub fn bloom_name(shard: usize) -> String {
    format!("{}{}", BLOOM_PREFIX, shard)
}

/// Key path of a block
pub fn block_keypath(block_id: &Uuid, tenant: &str) -> Vec<String> {
    vec![tenant.to_string(), block_id.to_string()]
}

/// Byte-level object store
#[async_trait]
pub trait RawBackend: Send + Sync {
    /// Names directly under `keypath`, both objects and nested prefixes.
    async fn list(&self, keypath: &[String]) -> Result<Vec<String>>;

    /// Whole object. [`BackendError::NotFound`] when absent.
    async fn read(&self, name: &str, keypath: &[String]) -> Result<Bytes>;

    /// `len` bytes starting at `offset`.
    async fn read_range(&self, name: &str, keypath: &[String], offset: u64, len: u64)
        -> Result<Bytes>;

    async fn write(&self, name: &str, keypath: &[String], data: Bytes) -> Result<()>;

    /// Remove an object. Removing a missing object succeeds.
    async fn delete(&self, name: &str, keypath: &[String]) -> Result<()>;
}

/// Block-level operations over a [`RawBackend`]
#[derive(Clone)]
pub struct Backend {
    raw: Arc<dyn RawBackend>,
}

impl Backend {
    pub fn new(raw: Arc<dyn RawBackend>) -> Self {
        Self { raw }
    }

    pub async fn tenants(&self) -> Result<Vec<String>> {
        let mut tenants = self.raw.list(&[]).await?;
        tenants.sort();
        Ok(tenants)
    }

    /// Block ids of a tenant, live or compacted. Entries that are not block
    /// ids are skipped.
    pub async fn blocks(&self, tenant: &str) -> Result<Vec<Uuid>> {
        let names = self.raw.list(&[tenant.to_string()]).await?;
        Ok(names
            .iter()
            .filter_map(|name| match Uuid::parse_str(name) {
                Ok(id) => Some(id),
                Err(_) => {
                    tracing::debug!(tenant = %tenant, name = %name, "Skipping non-block entry");
                    None
                }
            })
            .collect())
    }

    pub async fn block_meta(&self, block_id: &Uuid, tenant: &str) -> Result<BlockMeta> {
        let bytes = self
            .raw
            .read(META_NAME, &block_keypath(block_id, tenant))
            .await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub async fn compacted_block_meta(
        &self,
        block_id: &Uuid,
        tenant: &str,
    ) -> Result<CompactedBlockMeta> {
        let bytes = self
            .raw
            .read(COMPACTED_META_NAME, &block_keypath(block_id, tenant))
            .await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub async fn write_block_meta(&self, meta: &BlockMeta) -> Result<()> {
        let json = serde_json::to_vec(meta)?;
        self.raw
            .write(
                META_NAME,
                &block_keypath(&meta.block_id, &meta.tenant_id),
                Bytes::from(json),
            )
            .await
    }

    pub async fn bloom(&self, block_id: &Uuid, tenant: &str, shard: usize) -> Result<Bytes> {
        self.raw
            .read(&bloom_name(shard), &block_keypath(block_id, tenant))
            .await
    }

    pub async fn index(&self, block_id: &Uuid, tenant: &str) -> Result<Bytes> {
        self.raw
            .read(INDEX_NAME, &block_keypath(block_id, tenant))
            .await
    }

    pub async fn read_data(
        &self,
        block_id: &Uuid,
        tenant: &str,
        offset: u64,
        len: u64,
    ) -> Result<Bytes> {
        self.raw
            .read_range(DATA_NAME, &block_keypath(block_id, tenant), offset, len)
            .await
    }

    /// Write a complete block. `meta.json` goes last so a block is never
    /// visible before its data, index and blooms exist.
    #[tracing::instrument(
        name = "backend.write_block",
        skip(self, meta, data, index, blooms),
        fields(tenant = %meta.tenant_id, block_id = %meta.block_id, bytes = data.len()),
        err
    )]
    pub async fn write_block_objects(
        &self,
        meta: &BlockMeta,
        data: Bytes,
        index: Bytes,
        blooms: Vec<Vec<u8>>,
    ) -> Result<()> {
        let keypath = block_keypath(&meta.block_id, &meta.tenant_id);

        self.raw.write(DATA_NAME, &keypath, data).await?;
        self.raw.write(INDEX_NAME, &keypath, index).await?;
        for (shard, bloom) in blooms.into_iter().enumerate() {
            self.raw
                .write(&bloom_name(shard), &keypath, Bytes::from(bloom))
                .await?;
        }
        self.write_block_meta(meta).await
    }

    /// Replace `meta.json` with `meta.compacted.json`.
    pub async fn mark_block_compacted(&self, block_id: &Uuid, tenant: &str) -> Result<()> {
        let meta = self.block_meta(block_id, tenant).await?;
        let compacted = CompactedBlockMeta {
            meta,
            compacted_time: Utc::now(),
        };
        let keypath = block_keypath(block_id, tenant);

        self.raw
            .write(
                COMPACTED_META_NAME,
                &keypath,
                Bytes::from(serde_json::to_vec(&compacted)?),
            )
            .await?;
        self.raw.delete(META_NAME, &keypath).await
    }

    /// Delete every object of a block.
    pub async fn clear_block(&self, block_id: &Uuid, tenant: &str) -> Result<()> {
        let keypath = block_keypath(block_id, tenant);
        let names = self.raw.list(&keypath).await?;

        // meta files go first so a half-cleared block is never polled as live
        let (metas, rest): (Vec<String>, Vec<String>) = names
            .into_iter()
            .partition(|n| n == META_NAME || n == COMPACTED_META_NAME);
        for name in metas.iter().chain(rest.iter()) {
            self.raw.delete(name, &keypath).await?;
        }
        Ok(())
    }
}
