//! Append-only record indexes
//!
//! An appender writes objects to a [`DataWriter`] and remembers the
//! [`Record`] for each page it cut, so an object can later be read back with a
//! single ranged read.
//!
//! - [`Appender`] cuts a page per object and keeps records in hash buckets,
//!   which suits the unordered writes of a head block.
//! - [`BufferedAppender`] cuts a page whenever the buffered bytes reach the
//!   index downsample size and keeps one record per page, which suits the
//!   id-ordered writes of a block being built for the backend.

use super::id::hash_id;
use super::{DataWriter, EncodingError, Record, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;

/// Common surface of both appenders
pub trait RecordAppender: Send + Sync {
    /// Write one object and record where it landed.
    fn append(&self, id: &[u8], object: &[u8]) -> Result<()>;

    /// Snapshot of all records, ordered by start offset.
    fn records(&self) -> Vec<Record>;

    /// Records that may hold `id`.
    fn records_for_id(&self, id: &[u8]) -> Vec<Record>;

    /// Number of objects appended.
    fn length(&self) -> usize;

    /// Bytes written to the data stream.
    fn data_length(&self) -> u64;

    /// Flush and close the writer. Later appends fail.
    fn complete(&self) -> Result<()>;
}

struct WriterState<W> {
    writer: Option<W>,
    data_length: u64,
    completed: bool,
    // the stream may hold a partial page past `data_length`
    failed: bool,
}

#[derive(Default)]
struct Buckets {
    by_hash: HashMap<u64, Vec<Record>>,
    count: usize,
}

/// Appender that cuts one page per object
pub struct Appender<W: DataWriter> {
    state: Mutex<WriterState<W>>,
    buckets: RwLock<Buckets>,
}

impl<W: DataWriter> Appender<W> {
    pub fn new(writer: W) -> Self {
        Self {
            state: Mutex::new(WriterState {
                writer: Some(writer),
                data_length: 0,
                completed: false,
                failed: false,
            }),
            buckets: RwLock::new(Buckets::default()),
        }
    }

    /// Rebuild an appender from replayed records. It has no writer, so
    /// appends fail with [`EncodingError::NoWriter`].
    pub fn from_records(records: Vec<Record>, data_length: u64) -> Self {
        let appender = Self {
            state: Mutex::new(WriterState {
                writer: None,
                data_length,
                completed: false,
                failed: false,
            }),
            buckets: RwLock::new(Buckets::default()),
        };
        for record in records {
            appender.add_record(record);
        }
        appender
    }

    /// Take the writer back.
    pub fn into_writer(self) -> Option<W> {
        self.state.into_inner().writer
    }

    /// True once a writer error left the stream in an unknown state. Every
    /// later append fails with [`EncodingError::Failed`].
    pub fn is_failed(&self) -> bool {
        self.state.lock().failed
    }

    fn add_record(&self, record: Record) {
        let hash = hash_id(&record.id);
        let mut buckets = self.buckets.write();
        buckets.by_hash.entry(hash).or_default().push(record);
        buckets.count += 1;
    }
}

impl<W: DataWriter> RecordAppender for Appender<W> {
    fn append(&self, id: &[u8], object: &[u8]) -> Result<()> {
        let record = {
            let mut state = self.state.lock();
            if state.completed {
                return Err(EncodingError::Completed);
            }
            if state.failed {
                return Err(EncodingError::Failed);
            }

            let start = state.data_length;
            let writer = state.writer.as_mut().ok_or(EncodingError::NoWriter)?;
            let length = match writer.write(id, object).and_then(|_| writer.cut_page()) {
                Ok(length) => length,
                Err(e) => {
                    state.failed = true;
                    return Err(e);
                }
            };
            state.data_length += length as u64;

            Record::new(id, start, length as u32)
        };

        self.add_record(record);
        Ok(())
    }

    fn records(&self) -> Vec<Record> {
        let mut records: Vec<Record> = {
            let buckets = self.buckets.read();
            buckets.by_hash.values().flatten().cloned().collect()
        };
        records.sort_by_key(|r| r.start);
        records
    }

    fn records_for_id(&self, id: &[u8]) -> Vec<Record> {
        let buckets = self.buckets.read();
        buckets
            .by_hash
            .get(&hash_id(id))
            .map(|bucket| bucket.iter().filter(|r| r.id == id).cloned().collect())
            .unwrap_or_default()
    }

    fn length(&self) -> usize {
        self.buckets.read().count
    }

    fn data_length(&self) -> u64 {
        self.state.lock().data_length
    }

    fn complete(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.completed {
            return Ok(());
        }
        if let Some(writer) = state.writer.as_mut() {
            writer.complete()?;
        }
        state.completed = true;
        Ok(())
    }
}

struct BufferedState<W> {
    writer: W,
    records: Vec<Record>,
    last_id: Vec<u8>,
    buffered: usize,
    data_length: u64,
    count: usize,
    completed: bool,
}

impl<W: DataWriter> BufferedState<W> {
    fn flush_page(&mut self) -> Result<()> {
        let length = self.writer.cut_page()?;
        if length > 0 {
            self.records
                .push(Record::new(self.last_id.clone(), self.data_length, length as u32));
            self.data_length += length as u64;
        }
        self.buffered = 0;
        Ok(())
    }
}

/// Appender that groups objects into pages of roughly `index_downsample_bytes`
///
/// Input must arrive sorted by id; each record carries the last id of its page
/// so the index can be searched for the first record `>= id`.
pub struct BufferedAppender<W: DataWriter> {
    state: Mutex<BufferedState<W>>,
    index_downsample_bytes: usize,
}

impl<W: DataWriter> BufferedAppender<W> {
    pub fn new(writer: W, index_downsample_bytes: usize) -> Self {
        Self {
            state: Mutex::new(BufferedState {
                writer,
                records: Vec::new(),
                last_id: Vec::new(),
                buffered: 0,
                data_length: 0,
                count: 0,
                completed: false,
            }),
            index_downsample_bytes: index_downsample_bytes.max(1),
        }
    }

    pub fn into_writer(self) -> W {
        self.state.into_inner().writer
    }
}

impl<W: DataWriter> RecordAppender for BufferedAppender<W> {
    fn append(&self, id: &[u8], object: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        if state.completed {
            return Err(EncodingError::Completed);
        }

        let written = state.writer.write(id, object)?;
        state.buffered += written;
        state.last_id = id.to_vec();
        state.count += 1;

        if state.buffered >= self.index_downsample_bytes {
            state.flush_page()?;
        }
        Ok(())
    }

    fn records(&self) -> Vec<Record> {
        let mut records = self.state.lock().records.clone();
        records.sort_by_key(|r| r.start);
        records
    }

    fn records_for_id(&self, id: &[u8]) -> Vec<Record> {
        let state = self.state.lock();
        let i = state.records.partition_point(|r| r.id.as_slice() < id);
        state.records.get(i).cloned().into_iter().collect()
    }

    fn length(&self) -> usize {
        self.state.lock().count
    }

    fn data_length(&self) -> u64 {
        self.state.lock().data_length
    }

    fn complete(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.completed {
            return Ok(());
        }
        state.flush_page()?;
        state.writer.complete()?;
        state.completed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::object::{find_object, framed_len};
    use crate::encoding::page::{decode_pages, PAGE_FRAME_LEN};
    use crate::encoding::{Encoding, PagedDataWriter};
    use std::io;
    use std::sync::Arc;
    use std::thread;

    type VecAppender = Appender<PagedDataWriter<Vec<u8>>>;

    fn appender() -> VecAppender {
        Appender::new(PagedDataWriter::new(Vec::new(), Encoding::None))
    }

    fn page_len(id: &[u8], object: &[u8]) -> u64 {
        (PAGE_FRAME_LEN + framed_len(id, object)) as u64
    }

    #[test]
    fn test_single_append_records_start_zero() {
        let a = appender();
        a.append(b"trace1", b"payload").unwrap();

        let records = a.records_for_id(b"trace1");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].start, 0);
        assert_eq!(records[0].length as u64, page_len(b"trace1", b"payload"));
    }

    #[test]
    fn test_data_length_is_sum_of_cuts() {
        let a = appender();
        let objects: Vec<(Vec<u8>, Vec<u8>)> = (0..20u8)
            .map(|i| (vec![i; 4], vec![i; i as usize * 3]))
            .collect();

        for (id, object) in &objects {
            a.append(id, object).unwrap();
        }

        let expected: u64 = objects.iter().map(|(id, o)| page_len(id, o)).sum();
        assert_eq!(a.data_length(), expected);
        assert_eq!(a.records().iter().map(|r| r.length as u64).sum::<u64>(), expected);

        let written = a.into_writer().unwrap().into_inner();
        assert_eq!(written.len() as u64, expected);
    }

    #[test]
    fn test_records_sorted_by_start_and_idempotent() {
        let a = appender();
        for i in (0..50u8).rev() {
            a.append(&[i], b"x").unwrap();
        }

        let first = a.records();
        let second = a.records();
        assert_eq!(first, second);
        assert!(first.windows(2).all(|w| w[0].start < w[1].start));
        assert_eq!(first[0].id, vec![49]);
    }

    #[test]
    fn test_length_counts_appends_not_buckets() {
        let a = appender();
        a.append(b"same", b"1").unwrap();
        a.append(b"same", b"22").unwrap();
        a.append(b"other", b"3").unwrap();

        assert_eq!(a.length(), 3);
        assert_eq!(a.records_for_id(b"same").len(), 2);
    }

    #[test]
    fn test_records_for_unknown_id() {
        let a = appender();
        a.append(b"known", b"1").unwrap();
        assert!(a.records_for_id(b"unknown").is_empty());
    }

    #[test]
    fn test_append_after_complete_fails() {
        let a = appender();
        a.append(b"a", b"1").unwrap();
        a.complete().unwrap();

        assert!(matches!(a.append(b"b", b"2"), Err(EncodingError::Completed)));
        assert_eq!(a.length(), 1);
    }

    #[test]
    fn test_from_records_rejects_appends() {
        let records = vec![Record::new(b"a".to_vec(), 0, 10), Record::new(b"b".to_vec(), 10, 12)];
        let a = VecAppender::from_records(records, 22);

        assert_eq!(a.length(), 2);
        assert_eq!(a.data_length(), 22);
        assert_eq!(a.records_for_id(b"b")[0].start, 10);
        assert!(matches!(a.append(b"c", b"3"), Err(EncodingError::NoWriter)));
    }

    struct FailingWriter;

    impl DataWriter for FailingWriter {
        fn write(&mut self, _id: &[u8], _object: &[u8]) -> Result<usize> {
            Err(io::Error::new(io::ErrorKind::Other, "disk full").into())
        }

        fn cut_page(&mut self) -> Result<usize> {
            Ok(0)
        }

        fn complete(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_writer_error_propagates_without_record() {
        let a = Appender::new(FailingWriter);
        let err = a.append(b"a", b"1").unwrap_err();

        assert!(matches!(err, EncodingError::IoError(_)));
        assert_eq!(a.length(), 0);
        assert_eq!(a.data_length(), 0);
    }

    /// Accepts `capacity` bytes, then writes short and fails
    struct ShortWrite {
        data: Vec<u8>,
        capacity: usize,
    }

    impl io::Write for ShortWrite {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let room = self.capacity.saturating_sub(self.data.len());
            if room == 0 {
                return Err(io::Error::new(io::ErrorKind::Other, "disk full"));
            }
            let n = room.min(buf.len());
            self.data.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_torn_write_stops_appender_and_keeps_earlier_records() {
        let first = page_len(b"one", b"first object");
        let a = Appender::new(PagedDataWriter::new(
            ShortWrite {
                data: Vec::new(),
                capacity: first as usize + 10,
            },
            Encoding::None,
        ));

        a.append(b"one", b"first object").unwrap();
        assert!(matches!(
            a.append(b"two", b"second object"),
            Err(EncodingError::IoError(_))
        ));
        assert!(a.is_failed());
        assert!(matches!(a.append(b"three", b"3"), Err(EncodingError::Failed)));

        assert_eq!(a.length(), 1);
        assert_eq!(a.data_length(), first);
        assert!(a.records_for_id(b"two").is_empty());

        let record = a.records_for_id(b"one")[0].clone();
        let data = a.into_writer().unwrap().into_inner().data;
        assert!(data.len() as u64 > first);

        let page = &data[record.start as usize..record.end() as usize];
        let decoded = decode_pages(page, Encoding::None).unwrap();
        assert_eq!(find_object(&decoded, b"one").unwrap(), Some(&b"first object"[..]));
    }

    #[test]
    fn test_concurrent_append_and_records() {
        let a = Arc::new(appender());
        let writers = 8;
        let per_writer = 200;

        let mut handles = Vec::new();
        for w in 0..writers {
            let a = Arc::clone(&a);
            handles.push(thread::spawn(move || {
                for i in 0..per_writer {
                    let id = format!("trace-{}-{}", w, i);
                    a.append(id.as_bytes(), b"span data").unwrap();
                }
            }));
        }
        for _ in 0..4 {
            let a = Arc::clone(&a);
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    let records = a.records();
                    assert!(records.windows(2).all(|w| w[0].start <= w[1].start));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let records = a.records();
        assert_eq!(records.len(), writers * per_writer);
        assert_eq!(a.length(), writers * per_writer);
        assert!(records.windows(2).all(|w| w[0].end() == w[1].start));
    }

    #[test]
    fn test_buffered_appender_groups_pages() {
        let a = BufferedAppender::new(PagedDataWriter::new(Vec::new(), Encoding::None), 38);
        for i in 1..=10u8 {
            a.append(&[i], &[0u8; 10]).unwrap();
        }
        a.complete().unwrap();

        // 19 framed bytes per object, two objects per page
        let records = a.records();
        assert_eq!(records.len(), 5);
        assert_eq!(records[0].id, vec![2]);
        assert_eq!(records[4].id, vec![10]);
        assert_eq!(a.length(), 10);

        assert_eq!(a.records_for_id(&[3]), vec![records[1].clone()]);
        assert!(a.records_for_id(&[11]).is_empty());

        let data_length = a.data_length();
        assert_eq!(a.into_writer().into_inner().len() as u64, data_length);
    }

    #[test]
    fn test_buffered_appender_flushes_partial_page_on_complete() {
        let a = BufferedAppender::new(PagedDataWriter::new(Vec::new(), Encoding::None), 1 << 20);
        a.append(b"a", b"1").unwrap();
        assert!(a.records().is_empty());

        a.complete().unwrap();
        assert_eq!(a.records().len(), 1);
        assert!(matches!(a.append(b"b", b"2"), Err(EncodingError::Completed)));
    }
}
