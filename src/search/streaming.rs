//! Search file attached to a head block
//!
//! Entries are appended through an [`Appender`] as `(trace id, search entry)`
//! objects, one page each, to `<wal>/<block id>+<tenant>+search`.

use super::{SearchData, SearchError, SearchRequest, SearchResults};
use crate::encoding::object::ObjectIter;
use crate::encoding::page::PageReader;
use crate::encoding::{Appender, Encoding, PagedDataWriter, Record, RecordAppender};
use std::fs::{self, File, OpenOptions};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub const SEARCH_FILE_SUFFIX: &str = "search";

pub struct StreamingSearchBlock {
    path: PathBuf,
    appender: Appender<PagedDataWriter<File>>,
}

impl StreamingSearchBlock {
    pub fn filename(block_id: &Uuid, tenant: &str) -> String {
        format!("{}+{}+{}", block_id, tenant, SEARCH_FILE_SUFFIX)
    }

    /// Create a new, empty search file.
    pub fn create(dir: &Path, block_id: &Uuid, tenant: &str) -> Result<Self, SearchError> {
        let path = dir.join(Self::filename(block_id, tenant));
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&path)?;

        Ok(Self {
            path,
            appender: Appender::new(PagedDataWriter::new(file, Encoding::None)),
        })
    }

    /// Reopen a search file left by a previous process. The result is read
    /// only. A torn trailing page is dropped.
    pub fn replay(path: &Path) -> Result<Self, SearchError> {
        let mut reader = PageReader::new(BufReader::new(File::open(path)?));
        let mut records = Vec::new();

        loop {
            match reader.next_page() {
                Ok(Some(page)) => {
                    if let Some(Ok((id, _))) = ObjectIter::new(&page.data).next() {
                        records.push(Record::new(id, page.offset, page.length));
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Dropping torn search page");
                    break;
                }
            }
        }

        Ok(Self {
            path: path.to_path_buf(),
            appender: Appender::from_records(records, reader.offset()),
        })
    }

    pub fn append(&self, trace_id: &[u8], entry: &[u8]) -> Result<(), SearchError> {
        self.appender.append(trace_id, entry)?;
        Ok(())
    }

    pub fn length(&self) -> usize {
        self.appender.length()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Scan every entry, offering matches to `results`.
    pub fn search(
        &self,
        request: &SearchRequest,
        results: &mut SearchResults,
    ) -> Result<(), SearchError> {
        results.block_inspected();
        let data_length = self.appender.data_length();
        let mut reader = PageReader::new(BufReader::new(File::open(&self.path)?));

        while reader.offset() < data_length {
            let Some(page) = reader.next_page()? else {
                break;
            };
            for object in ObjectIter::new(&page.data) {
                let (_, entry) = object?;
                let data = SearchData::open(entry)?;
                if !results.offer(request, &data) {
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Remove the file.
    pub fn clear(&self) -> Result<(), SearchError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
