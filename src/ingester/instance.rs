//! Per-tenant ingest state

use super::{IngestError, Result};
use crate::block::{combine_objects, HeadBlock};
use crate::encoding::Encoding;
use crate::logging::RateLimitedLogger;
use crate::metrics;
use crate::search::{SearchEntryBuilder, SearchRequest, SearchResults};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// A cut block, queryable from its WAL file until some time after its flush
struct CompleteBlock {
    block: Arc<HeadBlock>,
    flushed_at: Option<Instant>,
}

/// One tenant's head block plus its cut blocks, unflushed and recently flushed
pub struct Instance {
    tenant: String,
    wal_dir: PathBuf,
    encoding: Encoding,
    max_bytes_per_trace: usize,
    head: RwLock<Arc<HeadBlock>>,
    complete: Mutex<Vec<CompleteBlock>>,
    rejections: RateLimitedLogger,
}

impl Instance {
    pub fn new(
        tenant: &str,
        wal_dir: &Path,
        encoding: Encoding,
        max_bytes_per_trace: usize,
        log_per_second: u32,
    ) -> Result<Self> {
        let head = HeadBlock::create(wal_dir, tenant, encoding)?;
        Ok(Self {
            tenant: tenant.to_string(),
            wal_dir: wal_dir.to_path_buf(),
            encoding,
            max_bytes_per_trace,
            head: RwLock::new(Arc::new(head)),
            complete: Mutex::new(Vec::new()),
            rejections: RateLimitedLogger::new(log_per_second),
        })
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    /// Append an object to the head block, plus a search entry when tags are
    /// given.
    pub fn push(
        &self,
        id: &[u8],
        object: &[u8],
        start: u32,
        end: u32,
        tags: &BTreeMap<String, String>,
    ) -> Result<()> {
        if object.len() > self.max_bytes_per_trace {
            metrics::record_push_rejected(&self.tenant, "trace_too_large");
            self.rejections.warn(format_args!(
                "tenant {} trace {} rejected: {} bytes exceeds max {}",
                self.tenant,
                hex::encode(id),
                object.len(),
                self.max_bytes_per_trace
            ));
            return Err(IngestError::TraceTooLarge {
                size: object.len(),
                max: self.max_bytes_per_trace,
            });
        }

        // built first so an invalid entry rejects the push before anything is stored
        let entry = if tags.is_empty() {
            None
        } else {
            let mut entry = SearchEntryBuilder::new(id).time_range(start, end);
            for (key, value) in tags {
                entry.add_tag(key.as_str(), value.as_str());
            }
            Some(entry.build()?)
        };

        // held across the append so a cut never races a write
        let head = self.head.read();
        let appended = head.append(id, object, start, end).and_then(|()| match &entry {
            Some(entry) => head.append_search(id, entry),
            None => Ok(()),
        });
        if let Err(e) = appended {
            let failed = head.is_failed();
            drop(head);
            if failed {
                self.replace_failed_head();
            }
            return Err(e.into());
        }

        metrics::record_push(&self.tenant, object.len());
        Ok(())
    }

    /// Swap out a head block whose WAL writer failed. Its intact objects are
    /// queued for flushing.
    fn replace_failed_head(&self) {
        let mut head = self.head.write();
        if !head.is_failed() {
            return;
        }
        let fresh = match HeadBlock::create(&self.wal_dir, &self.tenant, self.encoding) {
            Ok(fresh) => Arc::new(fresh),
            Err(e) => {
                tracing::error!(tenant = %self.tenant, error = %e, "Failed to replace head block");
                return;
            }
        };

        let failed = std::mem::replace(&mut *head, fresh);
        tracing::warn!(
            tenant = %self.tenant,
            block_id = %failed.block_id(),
            objects = failed.length(),
            "Replaced head block after a WAL write error"
        );
        if failed.length() > 0 {
            self.queue(failed);
        } else if let Err(e) = failed.clear() {
            tracing::warn!(block_id = %failed.block_id(), error = %e, "Failed to clear WAL block");
        }
    }

    fn queue(&self, block: Arc<HeadBlock>) {
        self.complete.lock().push(CompleteBlock {
            block,
            flushed_at: None,
        });
    }

    /// Move the head block to the flush queue when it is big or old enough,
    /// or whenever it holds data if `immediate`. Returns true on a cut.
    pub fn cut_block_if_ready(
        &self,
        max_block_bytes: u64,
        max_block_duration: Duration,
        immediate: bool,
    ) -> Result<bool> {
        let mut head = self.head.write();
        if head.length() == 0 {
            return Ok(false);
        }

        let ready = immediate
            || head.data_length() >= max_block_bytes
            || head.age() >= max_block_duration;
        if !ready {
            return Ok(false);
        }

        let fresh = Arc::new(HeadBlock::create(&self.wal_dir, &self.tenant, self.encoding)?);
        let cut = std::mem::replace(&mut *head, fresh);
        tracing::info!(
            tenant = %self.tenant,
            block_id = %cut.block_id(),
            objects = cut.length(),
            bytes = cut.data_length(),
            "Cut head block"
        );
        self.queue(cut);
        Ok(true)
    }

    /// Queue a block rebuilt from the WAL for flushing.
    pub fn add_replayed(&self, block: HeadBlock) {
        self.queue(Arc::new(block));
    }

    /// Cut blocks waiting for a flush
    pub fn blocks_to_flush(&self) -> Vec<Arc<HeadBlock>> {
        self.complete
            .lock()
            .iter()
            .filter(|c| c.flushed_at.is_none())
            .map(|c| c.block.clone())
            .collect()
    }

    /// Mark a block as written to the backend. It stays queryable until
    /// [`clear_flushed_blocks`](Self::clear_flushed_blocks) drops it.
    pub fn flushed(&self, block_id: &Uuid) {
        for complete in self.complete.lock().iter_mut() {
            if complete.block.block_id() == *block_id && complete.flushed_at.is_none() {
                complete.flushed_at = Some(Instant::now());
            }
        }
    }

    /// Drop blocks flushed at least `timeout` ago and remove their WAL files.
    /// Returns the number of blocks cleared.
    pub fn clear_flushed_blocks(&self, timeout: Duration) -> usize {
        let expired: Vec<Arc<HeadBlock>> = {
            let mut complete = self.complete.lock();
            let (expired, kept): (Vec<CompleteBlock>, Vec<CompleteBlock>) = complete
                .drain(..)
                .partition(|c| c.flushed_at.is_some_and(|at| at.elapsed() >= timeout));
            *complete = kept;
            expired.into_iter().map(|c| c.block).collect()
        };

        for block in &expired {
            if let Err(e) = block.clear() {
                tracing::warn!(block_id = %block.block_id(), error = %e, "Failed to clear WAL block");
            }
            tracing::debug!(tenant = %self.tenant, block_id = %block.block_id(), "Cleared flushed block");
        }
        expired.len()
    }

    pub fn head(&self) -> Arc<HeadBlock> {
        self.head.read().clone()
    }

    /// Cut blocks still held, flushed or not, oldest first
    fn complete_blocks(&self) -> Vec<Arc<HeadBlock>> {
        self.complete.lock().iter().map(|c| c.block.clone()).collect()
    }

    /// Stored object for `id` across the head and every held cut block.
    pub fn find(&self, id: &[u8]) -> Result<Option<Vec<u8>>> {
        // head first: a cut in between shows the block twice, never zero times
        let mut blocks = vec![self.head()];
        blocks.extend(self.complete_blocks());

        let mut found: Option<Vec<u8>> = None;
        for block in blocks {
            if let Some(object) = block.find(id)? {
                found = Some(match found {
                    Some(prev) => combine_objects(&prev, &object)?,
                    None => object,
                });
            }
        }
        Ok(found)
    }

    /// Offer the search entries of every live block, newest first.
    pub fn search(&self, request: &SearchRequest, results: &mut SearchResults) -> Result<()> {
        self.head().search(request, results)?;
        for block in self.complete_blocks().iter().rev() {
            if results.is_full() {
                break;
            }
            block.search(request, results)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::unwrap_object;
    use crate::search::SearchError;
    use tempfile::TempDir;

    fn instance(dir: &TempDir, max_bytes_per_trace: usize) -> Instance {
        Instance::new("t1", dir.path(), Encoding::Lz4, max_bytes_per_trace, 10).unwrap()
    }

    fn no_tags() -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    #[test]
    fn test_push_and_find() {
        let dir = TempDir::new().unwrap();
        let instance = instance(&dir, 1024);
        instance.push(&[1], b"hello", 10, 20, &no_tags()).unwrap();

        let found = instance.find(&[1]).unwrap().unwrap();
        assert_eq!(unwrap_object(&found).unwrap().2, b"hello");
        assert!(instance.find(&[2]).unwrap().is_none());
    }

    #[test]
    fn test_push_too_large_rejected() {
        let dir = TempDir::new().unwrap();
        let instance = instance(&dir, 4);

        let err = instance.push(&[1], b"too big", 1, 2, &no_tags()).unwrap_err();
        assert!(matches!(err, IngestError::TraceTooLarge { size: 7, max: 4 }));
        assert_eq!(instance.head().length(), 0);
    }

    #[test]
    fn test_cut_moves_head_to_queue() {
        let dir = TempDir::new().unwrap();
        let instance = instance(&dir, 1024);
        let hour = Duration::from_secs(3600);

        assert!(!instance.cut_block_if_ready(1 << 20, hour, true).unwrap());

        instance.push(&[1], b"one", 1, 2, &no_tags()).unwrap();
        assert!(!instance.cut_block_if_ready(1 << 20, hour, false).unwrap());
        assert!(instance.cut_block_if_ready(1, hour, false).unwrap());
        assert_eq!(instance.blocks_to_flush().len(), 1);
        assert_eq!(instance.head().length(), 0);

        // still found while waiting for a flush
        assert!(instance.find(&[1]).unwrap().is_some());

        let cut = instance.blocks_to_flush()[0].block_id();
        instance.flushed(&cut);
        assert!(instance.blocks_to_flush().is_empty());
    }

    #[test]
    fn test_flushed_block_queryable_until_cleared() {
        let dir = TempDir::new().unwrap();
        let instance = instance(&dir, 1024);
        instance.push(&[1], b"one", 1, 2, &no_tags()).unwrap();
        instance
            .cut_block_if_ready(0, Duration::from_secs(3600), true)
            .unwrap();
        let cut = instance.blocks_to_flush()[0].clone();
        instance.flushed(&cut.block_id());

        assert_eq!(instance.clear_flushed_blocks(Duration::from_secs(3600)), 0);
        assert!(instance.find(&[1]).unwrap().is_some());
        assert!(cut.path().exists());

        assert_eq!(instance.clear_flushed_blocks(Duration::ZERO), 1);
        assert!(instance.find(&[1]).unwrap().is_none());
        assert!(!cut.path().exists());
    }

    #[test]
    fn test_unflushed_blocks_are_never_cleared() {
        let dir = TempDir::new().unwrap();
        let instance = instance(&dir, 1024);
        instance.push(&[1], b"one", 1, 2, &no_tags()).unwrap();
        instance
            .cut_block_if_ready(0, Duration::from_secs(3600), true)
            .unwrap();

        assert_eq!(instance.clear_flushed_blocks(Duration::ZERO), 0);
        assert_eq!(instance.blocks_to_flush().len(), 1);
    }

    #[test]
    fn test_invalid_search_entry_rejects_push_before_append() {
        let dir = TempDir::new().unwrap();
        let instance = instance(&dir, 1024);
        let mut tags = BTreeMap::new();
        tags.insert("service.name".to_string(), "x".repeat(70_000));

        let err = instance.push(&[1], b"trace", 1, 2, &tags).unwrap_err();
        assert!(matches!(err, IngestError::Search(SearchError::InvalidEntry(_))));
        assert!(instance.find(&[1]).unwrap().is_none());
        assert_eq!(instance.head().length(), 0);
    }

    #[test]
    fn test_find_combines_head_and_queue() {
        let dir = TempDir::new().unwrap();
        let instance = instance(&dir, 1024);
        instance.push(&[1], b"longer payload", 100, 110, &no_tags()).unwrap();
        instance
            .cut_block_if_ready(0, Duration::from_secs(3600), true)
            .unwrap();
        instance.push(&[1], b"short", 200, 210, &no_tags()).unwrap();

        let found = instance.find(&[1]).unwrap().unwrap();
        let (start, end, payload) = unwrap_object(&found).unwrap();
        assert_eq!(payload, b"longer payload");
        assert_eq!((start, end), (100, 210));
    }

    #[test]
    fn test_search_over_live_blocks() {
        let dir = TempDir::new().unwrap();
        let instance = instance(&dir, 1024);
        let mut tags = BTreeMap::new();
        tags.insert("service.name".to_string(), "checkout".to_string());

        instance.push(&[1], b"a", 10, 20, &tags).unwrap();
        instance
            .cut_block_if_ready(0, Duration::from_secs(3600), true)
            .unwrap();
        instance.push(&[2], b"b", 30, 40, &tags).unwrap();
        instance.push(&[3], b"c", 30, 40, &no_tags()).unwrap();

        let request = SearchRequest::new().with_tag("service.name", "check");
        let mut results = SearchResults::new(10);
        instance.search(&request, &mut results).unwrap();

        let response = results.into_response();
        assert_eq!(response.traces.len(), 2);
        assert_eq!(response.metrics.inspected_blocks, 2);
    }
}
