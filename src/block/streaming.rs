//! Backend block builder
//!
//! Fed objects in ascending id order, a [`StreamingBlock`] keeps the data
//! pages in memory, tracks meta and bloom as it goes and on `complete` writes
//! data, index, bloom shards and finally `meta.json`.

use super::{unwrap_object, BlockError, Result};
use crate::backend::{Backend, BlockMeta};
use crate::config::BlockConfig;
use crate::encoding::id::pad_id;
use crate::encoding::record::marshal_records;
use crate::encoding::{BufferedAppender, PagedDataWriter, RecordAppender, ShardedBloomFilter};
use bytes::Bytes;
use uuid::Uuid;

pub struct StreamingBlock {
    meta: BlockMeta,
    bloom: ShardedBloomFilter,
    appender: BufferedAppender<PagedDataWriter<Vec<u8>>>,
    index_page_size: usize,
    last_id: Option<Vec<u8>>,
}

impl StreamingBlock {
    pub fn new(tenant: &str, block_id: Uuid, config: &BlockConfig, estimated_objects: usize) -> Self {
        Self {
            meta: BlockMeta::new(tenant, block_id, config.encoding),
            bloom: ShardedBloomFilter::new(
                config.bloom_fp,
                config.bloom_shard_size_bytes,
                estimated_objects,
            ),
            appender: BufferedAppender::new(
                PagedDataWriter::new(Vec::new(), config.encoding),
                config.index_downsample_bytes,
            ),
            index_page_size: config.index_downsample_bytes,
            last_id: None,
        }
    }

    /// Set the compaction level recorded in the meta.
    pub fn with_compaction_level(mut self, level: u8) -> Self {
        self.meta.compaction_level = level;
        self
    }

    /// Append a stored object. Ids must arrive in ascending order.
    pub fn append(&mut self, id: &[u8], object: &[u8]) -> Result<()> {
        let id = pad_id(id)?;
        if let Some(last) = &self.last_id {
            if id <= *last {
                return Err(BlockError::InvalidObject(format!(
                    "id {} appended after {}",
                    hex::encode(&id),
                    hex::encode(last)
                )));
            }
        }

        let (start, end, _) = unwrap_object(object)?;
        self.appender.append(&id, object)?;
        self.bloom.add(&id);
        self.meta.object_added(&id, start, end);
        self.last_id = Some(id);
        Ok(())
    }

    pub fn length(&self) -> usize {
        self.appender.length()
    }

    /// Bytes of pages cut so far
    pub fn data_length(&self) -> u64 {
        self.appender.data_length()
    }

    pub fn meta(&self) -> &BlockMeta {
        &self.meta
    }

    /// Flush the last page and write the block.
    pub async fn complete(self, backend: &Backend) -> Result<BlockMeta> {
        let Self {
            mut meta,
            bloom,
            appender,
            index_page_size,
            ..
        } = self;

        appender.complete()?;
        let records = appender.records();
        let index = marshal_records(&records)?;
        let data = appender.into_writer().into_inner();
        let blooms = bloom.marshal();

        meta.size = data.len() as u64;
        meta.total_records = records.len() as u32;
        meta.index_page_size = index_page_size as u32;
        meta.bloom_shards = blooms.len() as u32;

        backend
            .write_block_objects(&meta, Bytes::from(data), Bytes::from(index), blooms)
            .await?;

        tracing::info!(
            tenant = %meta.tenant_id,
            block_id = %meta.block_id,
            objects = meta.total_objects,
            size = meta.size,
            level = meta.compaction_level,
            "Wrote block"
        );
        Ok(meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::block::wrap_object;
    use crate::encoding::record::unmarshal_records;
    use crate::encoding::Encoding;
    use std::sync::Arc;

    fn config(downsample: usize) -> BlockConfig {
        BlockConfig {
            encoding: Encoding::Zstd,
            index_downsample_bytes: downsample,
            ..BlockConfig::default()
        }
    }

    #[test]
    fn test_out_of_order_append_rejected() {
        let mut block = StreamingBlock::new("t1", Uuid::new_v4(), &config(1024), 10);
        block.append(&[5], &wrap_object(1, 2, b"a")).unwrap();

        assert!(block.append(&[5], &wrap_object(1, 2, b"b")).is_err());
        assert!(block.append(&[4], &wrap_object(1, 2, b"c")).is_err());
        assert!(block.append(&[6], &wrap_object(1, 2, b"d")).is_ok());
        assert_eq!(block.length(), 2);
    }

    #[tokio::test]
    async fn test_complete_writes_all_objects() {
        let raw = Arc::new(MemoryBackend::new());
        let backend = Backend::new(raw.clone());

        let mut block = StreamingBlock::new("t1", Uuid::new_v4(), &config(100), 50)
            .with_compaction_level(2);
        for n in 0..50u8 {
            block
                .append(&[n + 1], &wrap_object(1000 + n as u32, 1010 + n as u32, &[n; 40]))
                .unwrap();
        }
        let meta = block.complete(&backend).await.unwrap();

        assert_eq!(meta.total_objects, 50);
        assert_eq!(meta.compaction_level, 2);
        assert_eq!(meta.index_page_size, 100);
        assert!(meta.total_records > 1 && meta.total_records < 50);
        assert!(meta.bloom_shards >= 1);
        assert_eq!(meta.start_time.timestamp(), 1000);
        assert_eq!(meta.end_time.timestamp(), 1059);

        let stored = backend.block_meta(&meta.block_id, "t1").await.unwrap();
        assert_eq!(stored, meta);

        let index = backend.index(&meta.block_id, "t1").await.unwrap();
        let records = unmarshal_records(&index).unwrap();
        assert_eq!(records.len() as u32, meta.total_records);
        assert_eq!(records.last().unwrap().id, pad_id(&[50]).unwrap());
        assert_eq!(records.last().unwrap().end(), meta.size);
    }
}
