//! Reads against a block stored in the backend

use super::Result;
use crate::backend::{Backend, BlockMeta};
use crate::encoding::bloom::{shard_for, BloomShard};
use crate::encoding::object::{find_object, ObjectIter};
use crate::encoding::page::decode_pages;
use crate::encoding::record::{find_record, unmarshal_records};
use crate::encoding::{Record, ID};
use crate::metrics;
use std::collections::VecDeque;

#[derive(Clone)]
pub struct BackendBlock {
    meta: BlockMeta,
    backend: Backend,
}

impl BackendBlock {
    pub fn new(meta: BlockMeta, backend: Backend) -> Self {
        Self { meta, backend }
    }

    pub fn meta(&self) -> &BlockMeta {
        &self.meta
    }

    /// Stored object for a padded `id`.
    ///
    /// Checks the id range, then one bloom shard, then the index, and reads a
    /// single page range from `data`.
    pub async fn find(&self, id: &[u8]) -> Result<Option<Vec<u8>>> {
        if !self.meta.may_contain(id) {
            return Ok(None);
        }
        let (block_id, tenant) = (&self.meta.block_id, self.meta.tenant_id.as_str());

        let shards = (self.meta.bloom_shards as usize).max(1);
        metrics::record_find_read("bloom");
        let bloom = self.backend.bloom(block_id, tenant, shard_for(id, shards)).await?;
        if !BloomShard::from_bytes(&bloom)?.test(id) {
            return Ok(None);
        }

        metrics::record_find_read("index");
        let index = self.backend.index(block_id, tenant).await?;
        let Some(record) = find_record(id, &index)? else {
            return Ok(None);
        };

        metrics::record_find_read("data");
        let pages = self
            .backend
            .read_data(block_id, tenant, record.start, record.length as u64)
            .await?;
        let decoded = decode_pages(&pages, self.meta.encoding)?;
        Ok(find_object(&decoded, id)?.map(<[u8]>::to_vec))
    }

    /// Iterate every object in id order, reading about `chunk_size_bytes` of
    /// pages per backend request.
    pub async fn iterator(&self, chunk_size_bytes: u32) -> Result<BackendBlockIterator> {
        let index = self
            .backend
            .index(&self.meta.block_id, &self.meta.tenant_id)
            .await?;
        let records = unmarshal_records(&index)?;

        Ok(BackendBlockIterator {
            block: self.clone(),
            records: records.into(),
            chunk_size_bytes: chunk_size_bytes.max(1) as u64,
            buffered: VecDeque::new(),
        })
    }
}

/// Sequential reader over a [`BackendBlock`]
pub struct BackendBlockIterator {
    block: BackendBlock,
    records: VecDeque<Record>,
    chunk_size_bytes: u64,
    buffered: VecDeque<(ID, Vec<u8>)>,
}

impl BackendBlockIterator {
    /// Next `(id, stored object)`, or `None` once the block is exhausted.
    pub async fn next(&mut self) -> Result<Option<(ID, Vec<u8>)>> {
        while self.buffered.is_empty() {
            if !self.read_chunk().await? {
                return Ok(None);
            }
        }
        Ok(self.buffered.pop_front())
    }

    /// Read consecutive pages up to the chunk size. False when none remain.
    async fn read_chunk(&mut self) -> Result<bool> {
        let Some(first) = self.records.pop_front() else {
            return Ok(false);
        };
        let start = first.start;
        let mut end = first.end();

        while let Some(next) = self.records.front() {
            if next.start != end || next.end() - start > self.chunk_size_bytes {
                break;
            }
            end = next.end();
            self.records.pop_front();
        }

        let meta = &self.block.meta;
        let pages = self
            .block
            .backend
            .read_data(&meta.block_id, &meta.tenant_id, start, end - start)
            .await?;
        let decoded = decode_pages(&pages, meta.encoding)?;
        for entry in ObjectIter::new(&decoded) {
            let (id, object) = entry?;
            self.buffered.push_back((id.to_vec(), object.to_vec()));
        }
        Ok(true)
    }
}
