//! Compaction and retention
//!
//! Each maintenance cycle polls the blocklist, merges windows of blocks into
//! fewer, larger blocks one level up, and expires old blocks.
//!
//! ```text
//! level 0:  [a][b][c][d]   input_blocks = 4
//!               │ k-way merge by id, duplicates combined
//!               ▼
//! level 1:  [   e   ][   f   ]   output_blocks = 2
//! ```

use crate::backend::{BackendError, BlockMeta};
use crate::block::{combine_objects, BackendBlock, BackendBlockIterator, BlockError, StreamingBlock};
use crate::config::{BlockConfig, CompactorConfig};
use crate::encoding::ID;
use crate::metrics;
use crate::store::{Store, StoreError};
use crate::util::BoundedWaitGroup;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::watch;
use uuid::Uuid;

/// Compaction errors
#[derive(Error, Debug)]
pub enum CompactionError {
    #[error("Block error: {0}")]
    Block(#[from] BlockError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Need at least two blocks to compact, got {0}")]
    TooFewBlocks(usize),
}

pub type Result<T> = std::result::Result<T, CompactionError>;

pub struct Compactor {
    config: CompactorConfig,
    block_config: BlockConfig,
    store: Arc<Store>,
    max_workers: usize,
}

impl Compactor {
    pub fn new(
        config: CompactorConfig,
        block_config: BlockConfig,
        store: Arc<Store>,
        max_workers: usize,
    ) -> Self {
        Self {
            config,
            block_config,
            store,
            max_workers,
        }
    }

    /// Run maintenance cycles until `shutdown` flips.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.maintenance_cycle());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.maintenance_cycle().await,
                _ = shutdown.changed() => break,
            }
        }
        tracing::info!("Compactor stopped");
    }

    /// Poll, compact every tenant, then apply retention.
    pub async fn maintenance_cycle(&self) {
        if let Err(e) = self.store.poll_blocklist().await {
            tracing::error!(error = %e, "Blocklist poll failed");
            return;
        }

        for tenant in self.store.tenants() {
            self.compact_tenant(&tenant).await;
        }
        self.do_retention().await;
    }

    /// Compact every window currently available for a tenant. Returns the
    /// number of successful compactions.
    pub async fn compact_tenant(&self, tenant: &str) -> usize {
        // windows are picked up front: each compaction reshapes the blocklist
        let mut windows = Vec::new();
        let mut cursor = Some(0);
        while let Some(at) = cursor {
            let (window, next) = self.store.blocks_to_compact(
                tenant,
                at,
                self.config.input_blocks,
                self.config.max_compaction_range(),
            );
            if !window.is_empty() {
                windows.push(window);
            }
            cursor = next;
        }

        let mut compacted = 0;
        for window in windows {
            match self.compact(&window, tenant).await {
                Ok(_) => compacted += 1,
                Err(e) => {
                    metrics::COMPACTION_ERRORS.inc();
                    tracing::error!(tenant = %tenant, error = %e, "Compaction failed");
                }
            }
        }
        compacted
    }

    /// Merge `metas` into at most `output_blocks` new blocks and mark the
    /// inputs compacted. Returns the new metas.
    #[tracing::instrument(name = "compactor.compact", skip(self, metas), fields(inputs = metas.len()), err)]
    pub async fn compact(&self, metas: &[BlockMeta], tenant: &str) -> Result<Vec<BlockMeta>> {
        if metas.len() < 2 {
            return Err(CompactionError::TooFewBlocks(metas.len()));
        }
        metrics::COMPACTION_RUNS.inc();
        let started = Instant::now();

        let backend = self.store.backend().clone();
        let level = metas
            .iter()
            .map(|m| m.compaction_level)
            .max()
            .unwrap_or(0)
            .saturating_add(1);
        let total: u64 = metas.iter().map(|m| m.total_objects).sum();
        let per_block = total / self.config.output_blocks.max(1) as u64 + 1;

        let mut cursors = Vec::with_capacity(metas.len());
        for meta in metas {
            let block = BackendBlock::new(meta.clone(), backend.clone());
            let mut iter = block.iterator(self.config.chunk_size_bytes).await?;
            let head = iter.next().await?;
            cursors.push(Cursor { iter, head });
        }

        let mut outputs = Vec::new();
        let mut current: Option<StreamingBlock> = None;
        let (mut written, mut combined) = (0u64, 0u64);

        while let Some(min_id) = lowest_id(&cursors) {
            let mut object: Option<Vec<u8>> = None;
            for cursor in cursors.iter_mut() {
                let matches = cursor.head.as_ref().is_some_and(|(id, _)| *id == min_id);
                if !matches {
                    continue;
                }
                if let Some((_, next)) = cursor.head.take() {
                    object = Some(match object {
                        Some(prev) => {
                            combined += 1;
                            combine_objects(&prev, &next)?
                        }
                        None => next,
                    });
                }
                cursor.head = cursor.iter.next().await?;
            }
            let Some(object) = object else {
                continue;
            };

            let block = current.get_or_insert_with(|| {
                StreamingBlock::new(tenant, Uuid::new_v4(), &self.block_config, per_block as usize)
                    .with_compaction_level(level)
            });
            block.append(&min_id, &object)?;
            written += 1;

            if block.length() as u64 >= per_block {
                if let Some(full) = current.take() {
                    outputs.push(full.complete(&backend).await?);
                }
            }
        }
        if let Some(last) = current.take() {
            if last.length() > 0 {
                outputs.push(last.complete(&backend).await?);
            }
        }

        let input_ids: Vec<Uuid> = metas.iter().map(|m| m.block_id).collect();
        for meta in &outputs {
            self.store.add_block(meta.clone());
        }
        for block_id in &input_ids {
            backend.mark_block_compacted(block_id, tenant).await?;
        }
        self.store.remove_blocks(tenant, &input_ids);

        metrics::record_compaction(level, written, combined, started.elapsed().as_secs_f64());
        tracing::info!(
            tenant = %tenant,
            inputs = metas.len(),
            outputs = outputs.len(),
            objects = written,
            combined = combined,
            level = level,
            "Compaction complete"
        );
        Ok(outputs)
    }

    /// Mark expired live blocks compacted and clear compacted blocks past
    /// their grace period.
    pub async fn do_retention(&self) {
        let now = Utc::now();
        let block_cutoff = cutoff(now, self.config.block_retention());
        let compacted_cutoff = cutoff(now, self.config.compacted_block_retention());

        let wg = BoundedWaitGroup::new(self.max_workers);

        for tenant in self.store.tenants() {
            for meta in self.store.blocklist(&tenant) {
                if meta.end_time >= block_cutoff {
                    continue;
                }
                let guard = wg.add().await;
                let store = self.store.clone();
                let tenant = tenant.clone();
                tokio::spawn(async move {
                    let _guard = guard;
                    match store.backend().mark_block_compacted(&meta.block_id, &tenant).await {
                        Ok(()) => {
                            metrics::RETENTION_MARKED.inc();
                            store.remove_blocks(&tenant, &[meta.block_id]);
                            tracing::info!(tenant = %tenant, block_id = %meta.block_id, "Marked block for deletion");
                        }
                        Err(e) => {
                            metrics::RETENTION_ERRORS.inc();
                            tracing::error!(tenant = %tenant, block_id = %meta.block_id, error = %e, "Failed to mark block");
                        }
                    }
                });
            }

            for compacted in self.store.compacted_blocklist(&tenant) {
                if compacted.compacted_time > compacted_cutoff {
                    continue;
                }
                let guard = wg.add().await;
                let store = self.store.clone();
                let tenant = tenant.clone();
                let block_id = compacted.meta.block_id;
                tokio::spawn(async move {
                    let _guard = guard;
                    match store.backend().clear_block(&block_id, &tenant).await {
                        Ok(()) => {
                            metrics::RETENTION_CLEARED.inc();
                            tracing::info!(tenant = %tenant, block_id = %block_id, "Cleared compacted block");
                        }
                        Err(e) => {
                            metrics::RETENTION_ERRORS.inc();
                            tracing::error!(tenant = %tenant, block_id = %block_id, error = %e, "Failed to clear block");
                        }
                    }
                });
            }
        }

        // guards drop on completion or unwind
        wg.wait().await;
    }
}

struct Cursor {
    iter: BackendBlockIterator,
    head: Option<(ID, Vec<u8>)>,
}

fn cutoff(now: DateTime<Utc>, retention: std::time::Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(retention)
        .ok()
        .and_then(|r| now.checked_sub_signed(r))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn lowest_id(cursors: &[Cursor]) -> Option<ID> {
    cursors
        .iter()
        .filter_map(|c| c.head.as_ref().map(|(id, _)| id))
        .min()
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::meta::unix_to_time;
    use crate::backend::{Backend, MemoryBackend};
    use crate::block::{unwrap_object, wrap_object};
    use crate::encoding::id::pad_id;

    fn compactor(config: CompactorConfig) -> (Arc<Store>, Compactor) {
        let store = Arc::new(Store::new(Backend::new(Arc::new(MemoryBackend::new())), 4));
        let compactor = Compactor::new(config, BlockConfig::default(), store.clone(), 4);
        (store, compactor)
    }

    async fn write_block(store: &Store, ids: &[u8], payload_len: usize, start: u32) -> BlockMeta {
        let mut block = StreamingBlock::new("t1", Uuid::new_v4(), &BlockConfig::default(), ids.len());
        for id in ids {
            block
                .append(&[*id], &wrap_object(start, start + 10, &vec![*id; payload_len]))
                .unwrap();
        }
        let meta = block.complete(store.backend()).await.unwrap();
        store.add_block(meta.clone());
        meta
    }

    #[tokio::test]
    async fn test_compact_merges_and_combines() {
        let (store, compactor) = compactor(CompactorConfig {
            output_blocks: 2,
            ..CompactorConfig::default()
        });
        let a = write_block(&store, &[1, 3, 5, 7], 10, 100).await;
        let b = write_block(&store, &[2, 3, 6, 8], 20, 200).await;

        let outputs = compactor.compact(&[a.clone(), b.clone()], "t1").await.unwrap();

        // 8 inputs, 7 distinct ids, 8 / 2 + 1 = 5 per block
        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[0].total_objects, 5);
        assert_eq!(outputs[1].total_objects, 2);
        assert!(outputs.iter().all(|m| m.compaction_level == 1));
        assert!(outputs[0].max_id < outputs[1].min_id);

        // the duplicate kept the larger payload and both time ranges
        let found = store.find("t1", &pad_id(&[3]).unwrap()).await.unwrap().unwrap();
        let (start, end, payload) = unwrap_object(&found).unwrap();
        assert_eq!(payload.len(), 20);
        assert_eq!((start, end), (100, 210));

        let live: Vec<Uuid> = store.blocklist("t1").iter().map(|m| m.block_id).collect();
        assert!(!live.contains(&a.block_id));
        assert!(!live.contains(&b.block_id));
        assert_eq!(live.len(), 2);
        assert!(store
            .backend()
            .compacted_block_meta(&a.block_id, "t1")
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_compact_needs_two_blocks() {
        let (store, compactor) = compactor(CompactorConfig::default());
        let a = write_block(&store, &[1], 4, 100).await;
        assert!(matches!(
            compactor.compact(&[a], "t1").await,
            Err(CompactionError::TooFewBlocks(1))
        ));
    }

    #[tokio::test]
    async fn test_maintenance_cycle_compacts_tenant() {
        let (store, compactor) = compactor(CompactorConfig {
            input_blocks: 2,
            output_blocks: 1,
            max_compaction_range_seconds: 3600,
            block_retention_seconds: u32::MAX as u64,
            ..CompactorConfig::default()
        });
        let now = crate::util::unix_now();
        for n in 0..4u8 {
            write_block(&store, &[n * 2 + 1, n * 2 + 2], 8, now - 100 + n as u32).await;
        }

        compactor.maintenance_cycle().await;

        let live = store.blocklist("t1");
        assert_eq!(live.len(), 2);
        assert!(live.iter().all(|m| m.compaction_level == 1 && m.total_objects == 4));
        assert_eq!(store.compacted_blocklist("t1").len(), 0);

        // the next poll sees the compacted inputs
        store.poll_blocklist().await.unwrap();
        assert_eq!(store.compacted_blocklist("t1").len(), 4);
    }

    #[tokio::test]
    async fn test_retention_marks_then_clears() {
        let (store, compactor) = compactor(CompactorConfig {
            block_retention_seconds: 3600,
            compacted_block_retention_seconds: 0,
            ..CompactorConfig::default()
        });
        let now = crate::util::unix_now();
        let old = write_block(&store, &[1], 4, 1000).await;
        let fresh = write_block(&store, &[2], 4, now).await;
        assert_eq!(old.end_time, unix_to_time(1010));

        compactor.do_retention().await;
        let live: Vec<Uuid> = store.blocklist("t1").iter().map(|m| m.block_id).collect();
        assert_eq!(live, vec![fresh.block_id]);

        store.poll_blocklist().await.unwrap();
        assert_eq!(store.compacted_blocklist("t1").len(), 1);

        compactor.do_retention().await;
        store.poll_blocklist().await.unwrap();
        assert!(store.compacted_blocklist("t1").is_empty());
        assert!(store.backend().blocks("t1").await.unwrap() == vec![fresh.block_id]);
    }

    #[tokio::test]
    async fn test_retention_with_one_worker_finishes_every_block() {
        let store = Arc::new(Store::new(Backend::new(Arc::new(MemoryBackend::new())), 4));
        let config = CompactorConfig {
            block_retention_seconds: 3600,
            ..CompactorConfig::default()
        };
        let compactor = Compactor::new(config, BlockConfig::default(), store.clone(), 1);
        for id in 0..6u8 {
            write_block(&store, &[id], 4, 1000).await;
        }

        compactor.do_retention().await;

        assert!(store.blocklist("t1").is_empty());
        store.poll_blocklist().await.unwrap();
        assert_eq!(store.compacted_blocklist("t1").len(), 6);
    }
}
