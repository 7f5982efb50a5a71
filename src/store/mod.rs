//! Blocklist and backend lookups
//!
//! The store keeps, per tenant, the live and compacted block metas found by
//! the last poll. Trace lookups fan out over the live blocks whose id range
//! covers the requested id.

use crate::backend::{Backend, BackendError, BlockMeta, CompactedBlockMeta};
use crate::block::{combine_objects, BackendBlock, BlockError};
use crate::metrics;
use crate::util::BoundedWaitGroup;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;
use uuid::Uuid;

/// Store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Block error: {0}")]
    Block(#[from] BlockError),

    #[error("Task failed: {0}")]
    TaskFailed(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

enum PolledMeta {
    Live(BlockMeta),
    Compacted(CompactedBlockMeta),
    Missing,
}

pub struct Store {
    backend: Backend,
    max_workers: usize,
    blocklists: DashMap<String, Vec<BlockMeta>>,
    compacted: DashMap<String, Vec<CompactedBlockMeta>>,
    /// Blocks registered through `add_block` that a running poll may not
    /// have listed yet
    added: Mutex<Vec<(Instant, BlockMeta)>>,
}

impl Store {
    pub fn new(backend: Backend, max_workers: usize) -> Self {
        Self {
            backend,
            max_workers,
            blocklists: DashMap::new(),
            compacted: DashMap::new(),
            added: Mutex::new(Vec::new()),
        }
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    /// Tenants with at least one live or compacted block
    pub fn tenants(&self) -> Vec<String> {
        let mut tenants: Vec<String> = self
            .blocklists
            .iter()
            .map(|e| e.key().clone())
            .chain(self.compacted.iter().map(|e| e.key().clone()))
            .collect();
        tenants.sort();
        tenants.dedup();
        tenants
    }

    /// Live blocks of a tenant, sorted by start time
    pub fn blocklist(&self, tenant: &str) -> Vec<BlockMeta> {
        self.blocklists
            .get(tenant)
            .map(|l| l.value().clone())
            .unwrap_or_default()
    }

    pub fn compacted_blocklist(&self, tenant: &str) -> Vec<CompactedBlockMeta> {
        self.compacted
            .get(tenant)
            .map(|l| l.value().clone())
            .unwrap_or_default()
    }

    /// Refresh every tenant's blocklist from the backend.
    ///
    /// A tenant that fails to poll keeps its previous lists. Blocks added
    /// after the poll started are kept even when the listing missed them.
    pub async fn poll_blocklist(&self) -> Result<()> {
        let started = Instant::now();
        let tenants = self.backend.tenants().await?;

        for tenant in &tenants {
            match self.poll_tenant(tenant).await {
                Ok((mut live, compacted)) => {
                    for meta in self.added_since(tenant, started) {
                        let listed = live.iter().any(|m| m.block_id == meta.block_id)
                            || compacted.iter().any(|c| c.meta.block_id == meta.block_id);
                        if !listed {
                            live.push(meta);
                        }
                    }
                    sort_live(&mut live);

                    metrics::record_blocklist_length(tenant, live.len());
                    tracing::debug!(
                        tenant = %tenant,
                        live = live.len(),
                        compacted = compacted.len(),
                        "Polled blocklist"
                    );
                    self.blocklists.insert(tenant.clone(), live);
                    self.compacted.insert(tenant.clone(), compacted);
                }
                Err(e) => {
                    metrics::record_blocklist_poll_error(tenant);
                    tracing::error!(tenant = %tenant, error = %e, "Blocklist poll failed");
                }
            }
        }

        self.blocklists
            .retain(|t, _| tenants.contains(t) || !self.added_since(t, started).is_empty());
        self.compacted.retain(|t, _| tenants.contains(t));
        // anything older was written before this poll listed the backend
        self.added.lock().retain(|(at, _)| *at >= started);
        metrics::record_blocklist_poll(started.elapsed().as_secs_f64());
        Ok(())
    }

    async fn poll_tenant(&self, tenant: &str) -> Result<(Vec<BlockMeta>, Vec<CompactedBlockMeta>)> {
        let block_ids = self.backend.blocks(tenant).await?;
        let wg = BoundedWaitGroup::new(self.max_workers);
        let mut handles = Vec::with_capacity(block_ids.len());

        for block_id in block_ids {
            let guard = wg.add().await;
            let backend = self.backend.clone();
            let tenant = tenant.to_string();
            handles.push(tokio::spawn(async move {
                let _guard = guard;
                fetch_meta(&backend, &block_id, &tenant).await
            }));
        }

        let mut live = Vec::new();
        let mut compacted = Vec::new();
        for handle in handles {
            match handle
                .await
                .map_err(|e| StoreError::TaskFailed(e.to_string()))??
            {
                PolledMeta::Live(meta) => live.push(meta),
                PolledMeta::Compacted(meta) => compacted.push(meta),
                PolledMeta::Missing => {}
            }
        }

        sort_live(&mut live);
        compacted.sort_by(|a, b| a.meta.start_time.cmp(&b.meta.start_time));
        Ok((live, compacted))
    }

    /// Make a freshly written block visible before the next poll.
    pub fn add_block(&self, meta: BlockMeta) {
        self.added.lock().push((Instant::now(), meta.clone()));

        let mut list = self.blocklists.entry(meta.tenant_id.clone()).or_default();
        list.retain(|m| m.block_id != meta.block_id);
        let at = list.partition_point(|m| m.start_time <= meta.start_time);
        list.insert(at, meta);
    }

    /// Drop blocks from the live list once they have been compacted away.
    pub fn remove_blocks(&self, tenant: &str, block_ids: &[Uuid]) {
        if let Some(mut list) = self.blocklists.get_mut(tenant) {
            list.retain(|m| !block_ids.contains(&m.block_id));
        }
        self.added
            .lock()
            .retain(|(_, m)| m.tenant_id != tenant || !block_ids.contains(&m.block_id));
    }

    fn added_since(&self, tenant: &str, since: Instant) -> Vec<BlockMeta> {
        self.added
            .lock()
            .iter()
            .filter(|(at, m)| *at >= since && m.tenant_id == tenant)
            .map(|(_, m)| m.clone())
            .collect()
    }

    /// Stored object for a padded `id` across the tenant's live blocks.
    #[tracing::instrument(name = "store.find", skip(self, id), err)]
    pub async fn find(&self, tenant: &str, id: &[u8]) -> Result<Option<Vec<u8>>> {
        let started = Instant::now();
        let candidates: Vec<BlockMeta> = self
            .blocklist(tenant)
            .into_iter()
            .filter(|m| m.may_contain(id))
            .collect();

        let wg = BoundedWaitGroup::new(self.max_workers);
        let mut handles = Vec::with_capacity(candidates.len());
        for meta in candidates {
            let guard = wg.add().await;
            let block = BackendBlock::new(meta, self.backend.clone());
            let id = id.to_vec();
            handles.push(tokio::spawn(async move {
                let _guard = guard;
                block.find(&id).await
            }));
        }

        let mut found: Option<Vec<u8>> = None;
        for handle in handles {
            let result = handle
                .await
                .map_err(|e| StoreError::TaskFailed(e.to_string()))??;
            if let Some(object) = result {
                found = Some(match found {
                    Some(prev) => combine_objects(&prev, &object)?,
                    None => object,
                });
            }
        }

        metrics::record_find_duration("store", started.elapsed().as_secs_f64());
        Ok(found)
    }

    /// Next window of blocks to compact for a tenant.
    ///
    /// Starting at `cursor` in the start-time ordered blocklist, returns the
    /// first run of `input_blocks` consecutive blocks whose combined time span
    /// is under `max_range`, together with the cursor to resume from. The
    /// cursor is `None` once no further window exists.
    pub fn blocks_to_compact(
        &self,
        tenant: &str,
        cursor: usize,
        input_blocks: usize,
        max_range: Duration,
    ) -> (Vec<BlockMeta>, Option<usize>) {
        let list = self.blocklist(tenant);
        let input_blocks = input_blocks.max(2);

        let mut i = cursor;
        while i + input_blocks <= list.len() {
            let window = &list[i..i + input_blocks];
            let start = window.iter().map(|m| m.start_time).min();
            let end = window.iter().map(|m| m.end_time).max();

            if let (Some(start), Some(end)) = (start, end) {
                let span = (end - start).to_std().unwrap_or_default();
                if span < max_range {
                    return (window.to_vec(), Some(i + input_blocks));
                }
            }
            i += 1;
        }
        (Vec::new(), None)
    }
}

fn sort_live(live: &mut [BlockMeta]) {
    live.sort_by(|a, b| a.start_time.cmp(&b.start_time).then(a.block_id.cmp(&b.block_id)));
}

async fn fetch_meta(backend: &Backend, block_id: &Uuid, tenant: &str) -> Result<PolledMeta> {
    match backend.block_meta(block_id, tenant).await {
        Ok(meta) => return Ok(PolledMeta::Live(meta)),
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(e.into()),
    }

    match backend.compacted_block_meta(block_id, tenant).await {
        Ok(meta) => Ok(PolledMeta::Compacted(meta)),
        Err(e) if e.is_not_found() => {
            // mid-write or mid-clear
            Ok(PolledMeta::Missing)
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::meta::unix_to_time;
    use crate::backend::MemoryBackend;
    use crate::block::{unwrap_object, wrap_object, StreamingBlock};
    use crate::config::BlockConfig;
    use crate::encoding::id::pad_id;
    use crate::encoding::Encoding;
    use std::sync::Arc;

    fn store() -> Store {
        Store::new(Backend::new(Arc::new(MemoryBackend::new())), 4)
    }

    async fn write_block(store: &Store, tenant: &str, objects: &[(u8, &str)], start: u32) -> BlockMeta {
        let mut block =
            StreamingBlock::new(tenant, Uuid::new_v4(), &BlockConfig::default(), objects.len());
        for (id, payload) in objects {
            block
                .append(&[*id], &wrap_object(start, start + 10, payload.as_bytes()))
                .unwrap();
        }
        block.complete(store.backend()).await.unwrap()
    }

    fn meta_at(start: u32, end: u32) -> BlockMeta {
        let mut meta = BlockMeta::new("t1", Uuid::new_v4(), Encoding::None);
        meta.object_added(&[1], start, end);
        meta
    }

    #[tokio::test]
    async fn test_poll_splits_live_and_compacted() {
        let store = store();
        let a = write_block(&store, "t1", &[(1, "a")], 300).await;
        let b = write_block(&store, "t1", &[(2, "b")], 100).await;
        let c = write_block(&store, "t2", &[(3, "c")], 200).await;
        store.backend().mark_block_compacted(&c.block_id, "t2").await.unwrap();

        store.poll_blocklist().await.unwrap();

        let live: Vec<Uuid> = store.blocklist("t1").iter().map(|m| m.block_id).collect();
        assert_eq!(live, vec![b.block_id, a.block_id]);
        assert!(store.blocklist("t2").is_empty());
        assert_eq!(store.compacted_blocklist("t2").len(), 1);
        assert_eq!(store.tenants(), vec!["t1".to_string(), "t2".to_string()]);
    }

    #[tokio::test]
    async fn test_poll_forgets_removed_tenants() {
        let store = store();
        let a = write_block(&store, "t1", &[(1, "a")], 100).await;
        store.poll_blocklist().await.unwrap();
        assert_eq!(store.blocklist("t1").len(), 1);

        store.backend().clear_block(&a.block_id, "t1").await.unwrap();
        store.poll_blocklist().await.unwrap();
        assert!(store.tenants().is_empty());
    }

    #[tokio::test]
    async fn test_find_combines_across_blocks() {
        let store = store();
        write_block(&store, "t1", &[(1, "short"), (5, "five")], 100).await;
        write_block(&store, "t1", &[(1, "much longer"), (9, "nine")], 200).await;
        store.poll_blocklist().await.unwrap();

        let found = store.find("t1", &pad_id(&[1]).unwrap()).await.unwrap().unwrap();
        let (start, end, payload) = unwrap_object(&found).unwrap();
        assert_eq!(payload, b"much longer");
        assert_eq!((start, end), (100, 210));

        assert!(store.find("t1", &pad_id(&[7]).unwrap()).await.unwrap().is_none());
        assert!(store.find("t2", &pad_id(&[1]).unwrap()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_add_block_visible_without_poll() {
        let store = store();
        let meta = write_block(&store, "t1", &[(4, "four")], 100).await;
        store.add_block(meta.clone());
        store.add_block(meta);

        assert_eq!(store.blocklist("t1").len(), 1);
        assert!(store.find("t1", &pad_id(&[4]).unwrap()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_poll_drops_added_blocks_missing_from_backend() {
        let store = store();
        let listed = write_block(&store, "t1", &[(1, "a")], 100).await;
        let gone = meta_at(200, 210);
        store.add_block(listed.clone());
        store.add_block(gone);

        store.poll_blocklist().await.unwrap();
        let live: Vec<Uuid> = store.blocklist("t1").iter().map(|m| m.block_id).collect();
        assert_eq!(live, vec![listed.block_id]);

        store.poll_blocklist().await.unwrap();
        assert_eq!(store.blocklist("t1").len(), 1);
    }

    #[test]
    fn test_add_block_keeps_start_order() {
        let store = store();
        let late = meta_at(300, 310);
        let early = meta_at(100, 110);
        let mid = meta_at(200, 210);
        store.add_block(late.clone());
        store.add_block(early.clone());
        store.add_block(mid.clone());

        let starts: Vec<i64> = store
            .blocklist("t1")
            .iter()
            .map(|m| m.start_time.timestamp())
            .collect();
        assert_eq!(starts, vec![100, 200, 300]);

        store.remove_blocks("t1", &[mid.block_id]);
        assert_eq!(store.blocklist("t1").len(), 2);
    }

    #[test]
    fn test_blocks_to_compact_windows() {
        let store = store();
        for start in [0u32, 100, 200, 300, 5000, 5100] {
            store.add_block(meta_at(start, start + 50));
        }
        let range = Duration::from_secs(1000);

        let (window, cursor) = store.blocks_to_compact("t1", 0, 2, range);
        assert_eq!(window.len(), 2);
        assert_eq!(window[0].start_time, unix_to_time(0));
        assert_eq!(cursor, Some(2));

        let (window, cursor) = store.blocks_to_compact("t1", 2, 2, range);
        assert_eq!(window[0].start_time, unix_to_time(200));
        assert_eq!(cursor, Some(4));

        let (window, cursor) = store.blocks_to_compact("t1", 4, 2, range);
        assert_eq!(window[0].start_time, unix_to_time(5000));
        assert_eq!(cursor, Some(6));

        let (window, cursor) = store.blocks_to_compact("t1", 6, 2, range);
        assert!(window.is_empty());
        assert_eq!(cursor, None);
    }

    #[test]
    fn test_blocks_to_compact_skips_wide_windows() {
        let store = store();
        for start in [0u32, 5000, 5100] {
            store.add_block(meta_at(start, start + 50));
        }

        let (window, cursor) = store.blocks_to_compact("t1", 0, 2, Duration::from_secs(1000));
        assert_eq!(window[0].start_time, unix_to_time(5000));
        assert_eq!(cursor, Some(3));

        let (window, cursor) = store.blocks_to_compact("t2", 0, 2, Duration::from_secs(1000));
        assert!(window.is_empty());
        assert_eq!(cursor, None);
    }
}
