//! WAL head block
//!
//! Objects pushed for a tenant are appended to `<wal>/<block id>+<tenant>+<encoding>`,
//! one compressed page per object. The block can be searched by id while it
//! is being written, rebuilt from its file after a restart and finally turned
//! into a backend block.

use super::streaming::StreamingBlock;
use super::{combine_objects, unwrap_object, wrap_object, BlockError, Result};
use crate::backend::{Backend, BlockMeta};
use crate::config::BlockConfig;
use crate::encoding::id::pad_id;
use crate::encoding::object::{find_object, ObjectIter};
use crate::encoding::page::{decode_pages, PageReader};
use crate::encoding::record::sort_by_id;
use crate::encoding::{Appender, Encoding, PagedDataWriter, Record, RecordAppender, ID};
use crate::search::{SearchRequest, SearchResults, StreamingSearchBlock};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, ErrorKind, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Instant;
use uuid::Uuid;

/// Parts of a WAL file name: block id, tenant and suffix
pub fn parse_wal_filename(name: &str) -> Option<(Uuid, String, String)> {
    let (id, rest) = name.split_once('+')?;
    let (tenant, suffix) = rest.rsplit_once('+')?;
    if tenant.is_empty() {
        return None;
    }
    let id = Uuid::parse_str(id).ok()?;
    Some((id, tenant.to_string(), suffix.to_string()))
}

pub struct HeadBlock {
    block_id: Uuid,
    tenant: String,
    encoding: Encoding,
    dir: PathBuf,
    path: PathBuf,
    created: Instant,
    meta: Mutex<BlockMeta>,
    appender: Appender<PagedDataWriter<File>>,
    reader: Mutex<File>,
    search: Mutex<Option<StreamingSearchBlock>>,
}

impl HeadBlock {
    pub fn filename(block_id: &Uuid, tenant: &str, encoding: Encoding) -> String {
        format!("{}+{}+{}", block_id, tenant, encoding)
    }

    /// Start a new head block in `dir`.
    pub fn create(dir: &Path, tenant: &str, encoding: Encoding) -> Result<Self> {
        let block_id = Uuid::new_v4();
        let path = dir.join(Self::filename(&block_id, tenant, encoding));
        let writer = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&path)?;
        let reader = File::open(&path)?;

        tracing::debug!(tenant = %tenant, block_id = %block_id, "Created head block");

        Ok(Self {
            block_id,
            tenant: tenant.to_string(),
            encoding,
            dir: dir.to_path_buf(),
            path,
            created: Instant::now(),
            meta: Mutex::new(BlockMeta::new(tenant, block_id, encoding)),
            appender: Appender::new(PagedDataWriter::new(writer, encoding)),
            reader: Mutex::new(reader),
            search: Mutex::new(None),
        })
    }

    /// Rebuild a head block from a WAL file. The result is read only; a torn
    /// trailing page is dropped.
    pub fn replay(path: &Path) -> Result<Self> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| BlockError::InvalidWalFile(path.display().to_string()))?;
        let (block_id, tenant, suffix) = parse_wal_filename(name)
            .ok_or_else(|| BlockError::InvalidWalFile(name.to_string()))?;
        let encoding: Encoding = suffix.parse()?;

        let mut meta = BlockMeta::new(&tenant, block_id, encoding);
        let mut records = Vec::new();
        let mut reader = PageReader::new(BufReader::new(File::open(path)?));

        loop {
            let page = match reader.next_page() {
                Ok(Some(page)) => page,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Dropping torn WAL page");
                    break;
                }
            };
            let data = encoding.decompress(&page.data)?;
            if let Some(entry) = ObjectIter::new(&data).next() {
                let (id, object) = entry?;
                let (start, end, _) = unwrap_object(object)?;
                meta.object_added(id, start, end);
                records.push(Record::new(id, page.offset, page.length));
            }
        }

        let dir = path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();
        let search_path = dir.join(StreamingSearchBlock::filename(&block_id, &tenant));
        let search = if search_path.exists() {
            Some(StreamingSearchBlock::replay(&search_path)?)
        } else {
            None
        };

        tracing::info!(
            tenant = %tenant,
            block_id = %block_id,
            objects = records.len(),
            "Replayed WAL block"
        );

        Ok(Self {
            block_id,
            tenant,
            encoding,
            dir,
            path: path.to_path_buf(),
            created: Instant::now(),
            meta: Mutex::new(meta),
            appender: Appender::from_records(records, reader.offset()),
            reader: Mutex::new(File::open(path)?),
            search: Mutex::new(search),
        })
    }

    /// Append one object with its time range.
    pub fn append(&self, id: &[u8], payload: &[u8], start: u32, end: u32) -> Result<()> {
        let id = pad_id(id)?;
        self.appender
            .append(&id, &wrap_object(start, end, payload))?;
        self.meta.lock().object_added(&id, start, end);
        Ok(())
    }

    /// Append a search entry, creating the search file on first use.
    pub fn append_search(&self, id: &[u8], entry: &[u8]) -> Result<()> {
        let mut search = self.search.lock();
        if search.is_none() {
            *search = Some(StreamingSearchBlock::create(
                &self.dir,
                &self.block_id,
                &self.tenant,
            )?);
        }
        if let Some(search) = search.as_ref() {
            search.append(id, entry)?;
        }
        Ok(())
    }

    /// Stored object for `id`, duplicates combined.
    pub fn find(&self, id: &[u8]) -> Result<Option<Vec<u8>>> {
        let id = pad_id(id)?;
        let mut found: Option<Vec<u8>> = None;

        for record in self.appender.records_for_id(&id) {
            let page = self.read_page(&record)?;
            if let Some(object) = find_object(&page, &id)? {
                found = Some(match found {
                    Some(prev) => combine_objects(&prev, object)?,
                    None => object.to_vec(),
                });
            }
        }
        Ok(found)
    }

    pub fn search(&self, request: &SearchRequest, results: &mut SearchResults) -> Result<()> {
        if let Some(search) = self.search.lock().as_ref() {
            search.search(request, results)?;
        }
        Ok(())
    }

    /// Every object in id order, duplicates combined.
    pub fn objects_by_id(&self) -> Result<Vec<(ID, Vec<u8>)>> {
        let mut records = self.appender.records();
        sort_by_id(&mut records);

        let mut objects: Vec<(ID, Vec<u8>)> = Vec::with_capacity(records.len());
        for record in &records {
            let page = self.read_page(record)?;
            let object = find_object(&page, &record.id)?.ok_or_else(|| {
                BlockError::InvalidObject(format!("record at offset {} has no object", record.start))
            })?;

            match objects.last_mut() {
                Some((last_id, last)) if *last_id == record.id => {
                    *last = combine_objects(last, object)?;
                }
                _ => objects.push((record.id.clone(), object.to_vec())),
            }
        }
        Ok(objects)
    }

    /// Write this block to the backend under the same block id.
    #[tracing::instrument(
        name = "head_block.complete",
        skip(self, config, backend),
        fields(tenant = %self.tenant, block_id = %self.block_id),
        err
    )]
    pub async fn complete(&self, config: &BlockConfig, backend: &Backend) -> Result<BlockMeta> {
        let objects = self.objects_by_id()?;
        let mut block = StreamingBlock::new(&self.tenant, self.block_id, config, objects.len());
        for (id, object) in &objects {
            block.append(id, object)?;
        }
        block.complete(backend).await
    }

    /// Remove the WAL and search files.
    pub fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        if let Some(search) = self.search.lock().as_ref() {
            search.clear()?;
        }
        Ok(())
    }

    pub fn block_id(&self) -> Uuid {
        self.block_id
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn meta(&self) -> BlockMeta {
        let mut meta = self.meta.lock().clone();
        meta.size = self.appender.data_length();
        meta
    }

    /// Objects appended
    pub fn length(&self) -> usize {
        self.appender.length()
    }

    /// Bytes written to the WAL file
    pub fn data_length(&self) -> u64 {
        self.appender.data_length()
    }

    /// True after a WAL write error; the block takes no more appends.
    pub fn is_failed(&self) -> bool {
        self.appender.is_failed()
    }

    pub fn age(&self) -> std::time::Duration {
        self.created.elapsed()
    }

    fn read_page(&self, record: &Record) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; record.length as usize];
        {
            let mut file = self.reader.lock();
            file.seek(SeekFrom::Start(record.start))?;
            file.read_exact(&mut buf)?;
        }
        Ok(decode_pages(&buf, self.encoding)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::block::BackendBlock;
    use crate::search::SearchEntryBuilder;
    use std::io::Write;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn id(n: u8) -> Vec<u8> {
        pad_id(&[n]).unwrap()
    }

    #[test]
    fn test_parse_wal_filename() {
        let block_id = Uuid::new_v4();
        let name = HeadBlock::filename(&block_id, "tenant-a", Encoding::Zstd);

        let (parsed, tenant, suffix) = parse_wal_filename(&name).unwrap();
        assert_eq!(parsed, block_id);
        assert_eq!(tenant, "tenant-a");
        assert_eq!(suffix, "zstd");

        assert!(parse_wal_filename("not-a-wal-file").is_none());
        assert!(parse_wal_filename("nope+t+none").is_none());
    }

    #[test]
    fn test_append_and_find() {
        let dir = TempDir::new().unwrap();
        let block = HeadBlock::create(dir.path(), "t1", Encoding::Lz4).unwrap();

        block.append(&[1], b"first", 100, 110).unwrap();
        block.append(&[2], b"second", 105, 120).unwrap();

        let found = block.find(&[2]).unwrap().unwrap();
        let (start, end, payload) = unwrap_object(&found).unwrap();
        assert_eq!(payload, b"second");
        assert_eq!((start, end), (105, 120));
        assert!(block.find(&[3]).unwrap().is_none());

        let meta = block.meta();
        assert_eq!(meta.total_objects, 2);
        assert_eq!(meta.start_time.timestamp(), 100);
        assert_eq!(meta.end_time.timestamp(), 120);
        assert_eq!(meta.size, block.data_length());
        assert_eq!(block.length(), 2);
    }

    #[test]
    fn test_duplicate_appends_combine() {
        let dir = TempDir::new().unwrap();
        let block = HeadBlock::create(dir.path(), "t1", Encoding::None).unwrap();

        block.append(&[7], b"short", 50, 60).unwrap();
        block.append(&[7], b"the longer one", 40, 55).unwrap();
        block.append(&[7], b"mid size", 70, 80).unwrap();

        let (start, end, payload) = unwrap_object(&block.find(&[7]).unwrap().unwrap())
            .map(|(s, e, p)| (s, e, p.to_vec()))
            .unwrap();
        assert_eq!(payload, b"the longer one");
        assert_eq!((start, end), (40, 80));

        let objects = block.objects_by_id().unwrap();
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].0, id(7));
    }

    #[test]
    fn test_objects_by_id_sorted() {
        let dir = TempDir::new().unwrap();
        let block = HeadBlock::create(dir.path(), "t1", Encoding::Zstd).unwrap();
        for n in [9u8, 3, 5, 1] {
            block.append(&[n], &[n; 4], 1, 2).unwrap();
        }

        let ids: Vec<ID> = block.objects_by_id().unwrap().into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![id(1), id(3), id(5), id(9)]);
    }

    #[test]
    fn test_replay_rebuilds_block() {
        let dir = TempDir::new().unwrap();
        let block = HeadBlock::create(dir.path(), "t1", Encoding::Zstd).unwrap();
        block.append(&[1], b"one", 10, 20).unwrap();
        block.append(&[2], b"two", 30, 40).unwrap();
        let entry = SearchEntryBuilder::new(&[2]).tag("service.name", "api").build().unwrap();
        block.append_search(&[2], &entry).unwrap();

        let replayed = HeadBlock::replay(block.path()).unwrap();
        assert_eq!(replayed.block_id(), block.block_id());
        assert_eq!(replayed.tenant(), "t1");
        assert_eq!(replayed.encoding(), Encoding::Zstd);
        assert_eq!(replayed.length(), 2);
        assert_eq!(replayed.data_length(), block.data_length());
        assert_eq!(replayed.meta().start_time.timestamp(), 10);
        assert_eq!(replayed.meta().end_time.timestamp(), 40);

        let found = replayed.find(&[1]).unwrap().unwrap();
        assert_eq!(unwrap_object(&found).unwrap().2, b"one");

        let request = SearchRequest::new().with_tag("service.name", "api");
        let mut results = SearchResults::new(10);
        replayed.search(&request, &mut results).unwrap();
        assert_eq!(results.into_response().traces.len(), 1);

        assert!(replayed.append(&[3], b"x", 1, 1).is_err());
    }

    #[test]
    fn test_replay_drops_torn_tail() {
        let dir = TempDir::new().unwrap();
        let block = HeadBlock::create(dir.path(), "t1", Encoding::None).unwrap();
        block.append(&[1], b"kept", 1, 2).unwrap();
        let good_len = block.data_length();

        let mut file = OpenOptions::new().append(true).open(block.path()).unwrap();
        file.write_all(&[200, 0, 0, 0, 0, 0, 1, 2]).unwrap();

        let replayed = HeadBlock::replay(block.path()).unwrap();
        assert_eq!(replayed.length(), 1);
        assert_eq!(replayed.data_length(), good_len);
    }

    #[test]
    fn test_clear_removes_files() {
        let dir = TempDir::new().unwrap();
        let block = HeadBlock::create(dir.path(), "t1", Encoding::None).unwrap();
        block.append(&[1], b"x", 1, 2).unwrap();
        let entry = SearchEntryBuilder::new(&[1]).tag("k", "v").build().unwrap();
        block.append_search(&[1], &entry).unwrap();

        block.clear().unwrap();
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
        block.clear().unwrap();
    }

    #[tokio::test]
    async fn test_complete_writes_backend_block() {
        let dir = TempDir::new().unwrap();
        let block = HeadBlock::create(dir.path(), "t1", Encoding::Lz4).unwrap();
        for n in 1..=20u8 {
            block.append(&[n], &vec![n; 32], n as u32, n as u32 + 5).unwrap();
        }

        let backend = Backend::new(Arc::new(MemoryBackend::new()));
        let config = BlockConfig {
            index_downsample_bytes: 200,
            ..BlockConfig::default()
        };
        let meta = block.complete(&config, &backend).await.unwrap();

        assert_eq!(meta.block_id, block.block_id());
        assert_eq!(meta.total_objects, 20);
        assert_eq!(meta.start_time.timestamp(), 1);
        assert_eq!(meta.end_time.timestamp(), 25);

        let backend_block = BackendBlock::new(meta, backend);
        let found = backend_block.find(&id(13)).await.unwrap().unwrap();
        assert_eq!(unwrap_object(&found).unwrap().2, vec![13u8; 32].as_slice());
    }
}
