//! Ingester
//!
//! Accepts trace objects per tenant into WAL head blocks, cuts blocks by size
//! or age and flushes them to the backend.
//!
//! ```text
//! push ──► Instance (tenant) ──► HeadBlock (WAL)
//!                                   │ cut
//!                                   ▼
//!                         flush queue ──► StreamingBlock ──► Backend
//!                                                              │
//!                                          Store::add_block ◄──┘
//! ```

use crate::backend::Backend;
use crate::block::{BlockError, HeadBlock};
use crate::block::head::parse_wal_filename;
use crate::config::{BlockConfig, IngesterConfig};
use crate::encoding::{Encoding, EncodingError};
use crate::metrics;
use crate::search::{SearchError, SearchRequest, SearchResponse, SearchResults};
use crate::store::Store;
use crate::util::BoundedWaitGroup;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::watch;

mod instance;

pub use instance::Instance;

/// Ingest errors
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Trace too large: {size} bytes exceeds max {max}")]
    TraceTooLarge { size: usize, max: usize },

    #[error("Block error: {0}")]
    Block(#[from] BlockError),

    #[error("Search error: {0}")]
    Search(#[from] SearchError),

    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, IngestError>;

pub struct Ingester {
    config: IngesterConfig,
    block_config: BlockConfig,
    wal_dir: PathBuf,
    backend: Backend,
    store: Arc<Store>,
    log_per_second: u32,
    instances: DashMap<String, Arc<Instance>>,
    flush_lock: tokio::sync::Mutex<()>,
}

impl Ingester {
    pub fn new(
        config: IngesterConfig,
        block_config: BlockConfig,
        wal_dir: impl Into<PathBuf>,
        backend: Backend,
        store: Arc<Store>,
        log_per_second: u32,
    ) -> Result<Self> {
        let wal_dir = wal_dir.into();
        std::fs::create_dir_all(&wal_dir)?;

        Ok(Self {
            config,
            block_config,
            wal_dir,
            backend,
            store,
            log_per_second,
            instances: DashMap::new(),
            flush_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn wal_dir(&self) -> &Path {
        &self.wal_dir
    }

    fn encoding(&self) -> Encoding {
        self.block_config.encoding
    }

    /// Instance for a tenant, created on first use.
    pub fn instance(&self, tenant: &str) -> Result<Arc<Instance>> {
        if let Some(instance) = self.instances.get(tenant) {
            return Ok(instance.value().clone());
        }

        let entry = self.instances.entry(tenant.to_string());
        let instance = match entry {
            dashmap::mapref::entry::Entry::Occupied(e) => e.get().clone(),
            dashmap::mapref::entry::Entry::Vacant(e) => {
                let instance = Arc::new(Instance::new(
                    tenant,
                    &self.wal_dir,
                    self.encoding(),
                    self.config.max_bytes_per_trace,
                    self.log_per_second,
                )?);
                e.insert(instance.clone());
                instance
            }
        };
        Ok(instance)
    }

    /// Rebuild blocks left in the WAL directory and queue them for flushing.
    /// Returns the number of blocks recovered.
    pub fn replay_wal(&self) -> Result<usize> {
        // listed up front: replay creates fresh head files in the same directory
        let mut paths = Vec::new();
        for entry in std::fs::read_dir(&self.wal_dir)? {
            paths.push(entry?.path());
        }
        paths.sort();

        let mut replayed = 0;
        for path in paths {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some((_, tenant, suffix)) = parse_wal_filename(name) else {
                continue;
            };
            if suffix.parse::<Encoding>().is_err() {
                // search files are picked up with their block
                continue;
            }

            let block = match HeadBlock::replay(&path) {
                Ok(block) => block,
                Err(e) => {
                    tracing::error!(path = %path.display(), error = %e, "Failed to replay WAL block");
                    continue;
                }
            };
            if block.length() == 0 {
                block.clear()?;
                continue;
            }

            self.instance(&tenant)?.add_replayed(block);
            replayed += 1;
        }

        if replayed > 0 {
            tracing::info!(blocks = replayed, "Replayed WAL");
        }
        Ok(replayed)
    }

    pub fn push(
        &self,
        tenant: &str,
        id: &[u8],
        object: &[u8],
        start: u32,
        end: u32,
        tags: &BTreeMap<String, String>,
    ) -> Result<()> {
        self.instance(tenant)?.push(id, object, start, end, tags)
    }

    /// Stored object for `id` in the tenant's live blocks.
    pub fn find(&self, tenant: &str, id: &[u8]) -> Result<Option<Vec<u8>>> {
        let started = Instant::now();
        let found = match self.instances.get(tenant) {
            Some(instance) => instance.value().find(id)?,
            None => None,
        };
        metrics::record_find_duration("ingester", started.elapsed().as_secs_f64());
        Ok(found)
    }

    pub fn search(&self, tenant: &str, request: &SearchRequest) -> Result<SearchResponse> {
        let mut results = SearchResults::new(request.limit);
        if let Some(instance) = self.instances.get(tenant) {
            instance.value().search(request, &mut results)?;
        }
        Ok(results.into_response())
    }

    /// Cut ready blocks and flush every queued block. With `immediate` every
    /// non-empty head block is cut.
    pub async fn sweep(&self, immediate: bool) {
        let _flushing = self.flush_lock.lock().await;
        let instances: Vec<Arc<Instance>> =
            self.instances.iter().map(|e| e.value().clone()).collect();

        for instance in &instances {
            if let Err(e) = instance.cut_block_if_ready(
                self.config.max_block_bytes,
                self.config.max_block_duration(),
                immediate,
            ) {
                tracing::error!(tenant = %instance.tenant(), error = %e, "Failed to cut block");
            }
        }

        let wg = BoundedWaitGroup::new(self.config.concurrent_flushes);
        let mut handles = Vec::new();
        for instance in &instances {
            for block in instance.blocks_to_flush() {
                let guard = wg.add().await;
                let instance = instance.clone();
                let backend = self.backend.clone();
                let store = self.store.clone();
                let block_config = self.block_config.clone();
                let timeout = self.config.flush_timeout();

                handles.push(tokio::spawn(async move {
                    let _guard = guard;
                    flush_block(&instance, &block, &block_config, &backend, &store, timeout).await
                }));
            }
        }

        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Flush task failed");
            }
        }

        self.clear_flushed_blocks(&instances, self.config.complete_block_timeout());
    }

    fn clear_flushed_blocks(&self, instances: &[Arc<Instance>], timeout: std::time::Duration) {
        for instance in instances {
            instance.clear_flushed_blocks(timeout);
        }
    }

    /// Sweep on every flush check period until `shutdown` flips, then cut and
    /// flush everything.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.flush_check_period());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.sweep(false).await,
                _ = shutdown.changed() => break,
            }
        }
        self.shutdown().await;
    }

    /// Cut and flush everything, then drop the WAL of every flushed block.
    pub async fn shutdown(&self) {
        tracing::info!("Flushing ingester before shutdown");
        self.sweep(true).await;

        let _flushing = self.flush_lock.lock().await;
        let instances: Vec<Arc<Instance>> =
            self.instances.iter().map(|e| e.value().clone()).collect();
        self.clear_flushed_blocks(&instances, std::time::Duration::ZERO);
    }

    pub fn max_bytes_per_trace(&self) -> usize {
        self.config.max_bytes_per_trace
    }
}

async fn flush_block(
    instance: &Instance,
    block: &HeadBlock,
    block_config: &BlockConfig,
    backend: &Backend,
    store: &Store,
    timeout: std::time::Duration,
) {
    let started = Instant::now();
    let result = tokio::time::timeout(timeout, block.complete(block_config, backend)).await;
    let elapsed = started.elapsed().as_secs_f64();

    match result {
        Ok(Ok(meta)) => {
            metrics::record_flush(true, elapsed);
            store.add_block(meta);
            instance.flushed(&block.block_id());
        }
        Ok(Err(e)) => {
            metrics::record_flush(false, elapsed);
            tracing::error!(
                tenant = %instance.tenant(),
                block_id = %block.block_id(),
                error = %e,
                "Block flush failed, will retry"
            );
        }
        Err(_) => {
            metrics::record_flush(false, elapsed);
            tracing::error!(
                tenant = %instance.tenant(),
                block_id = %block.block_id(),
                timeout_secs = timeout.as_secs(),
                "Block flush timed out, will retry"
            );
        }
    }
}
