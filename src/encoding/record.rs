//! Index records
//!
//! A record locates one page of a data stream: `id[16] | start u64 | length u32`,
//! little endian. A marshalled index is the records sorted by id followed by an
//! 8-byte xxh3 checksum of the record bytes.

use super::id::ID_LEN;
use super::{EncodingError, Result, ID};
use xxhash_rust::xxh3::xxh3_64;

/// Size of one marshalled record
pub const RECORD_LEN: usize = ID_LEN + 8 + 4;

const CHECKSUM_LEN: usize = 8;

/// Location of an object (or a page of objects) in a data stream
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Record {
    pub id: ID,
    pub start: u64,
    pub length: u32,
}

impl Record {
    pub fn new(id: impl Into<ID>, start: u64, length: u32) -> Self {
        Self {
            id: id.into(),
            start,
            length,
        }
    }

    /// Exclusive end offset
    pub fn end(&self) -> u64 {
        self.start + self.length as u64
    }
}

/// Sort by id, ties broken by start offset.
pub fn sort_by_id(records: &mut [Record]) {
    records.sort_by(|a, b| a.id.cmp(&b.id).then(a.start.cmp(&b.start)));
}

/// Marshal records into an index. Records must already be sorted by id and
/// carry [`ID_LEN`]-byte ids.
pub fn marshal_records(records: &[Record]) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(records.len() * RECORD_LEN + CHECKSUM_LEN);
    for record in records {
        if record.id.len() != ID_LEN {
            return Err(EncodingError::InvalidId(format!(
                "index ids must be {} bytes, got {}",
                ID_LEN,
                record.id.len()
            )));
        }
        buf.extend_from_slice(&record.id);
        buf.extend_from_slice(&record.start.to_le_bytes());
        buf.extend_from_slice(&record.length.to_le_bytes());
    }

    let checksum = xxh3_64(&buf);
    buf.extend_from_slice(&checksum.to_le_bytes());
    Ok(buf)
}

/// Unmarshal every record of an index.
pub fn unmarshal_records(index: &[u8]) -> Result<Vec<Record>> {
    let body = verify(index)?;
    Ok((0..body.len() / RECORD_LEN)
        .map(|i| record_at(body, i))
        .collect())
}

/// Find the record for the page that may contain `id`: the first record whose
/// id is `>= id`.
pub fn find_record(id: &[u8], index: &[u8]) -> Result<Option<Record>> {
    let body = verify(index)?;
    let count = body.len() / RECORD_LEN;

    let (mut lo, mut hi) = (0usize, count);
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if id_at(body, mid) < id {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }

    Ok((lo < count).then(|| record_at(body, lo)))
}

fn verify(index: &[u8]) -> Result<&[u8]> {
    if index.len() < CHECKSUM_LEN {
        return Err(EncodingError::CorruptIndex(format!(
            "index of {} bytes has no checksum",
            index.len()
        )));
    }

    let (body, trailer) = index.split_at(index.len() - CHECKSUM_LEN);
    if body.len() % RECORD_LEN != 0 {
        return Err(EncodingError::CorruptIndex(format!(
            "index body of {} bytes is not a multiple of {}",
            body.len(),
            RECORD_LEN
        )));
    }

    let mut expected = [0u8; CHECKSUM_LEN];
    expected.copy_from_slice(trailer);
    if xxh3_64(body) != u64::from_le_bytes(expected) {
        return Err(EncodingError::CorruptIndex("checksum mismatch".into()));
    }

    Ok(body)
}

fn id_at(body: &[u8], i: usize) -> &[u8] {
    let at = i * RECORD_LEN;
    &body[at..at + ID_LEN]
}

fn record_at(body: &[u8], i: usize) -> Record {
    let at = i * RECORD_LEN;
    let mut start = [0u8; 8];
    start.copy_from_slice(&body[at + ID_LEN..at + ID_LEN + 8]);
    let mut length = [0u8; 4];
    length.copy_from_slice(&body[at + ID_LEN + 8..at + RECORD_LEN]);

    Record {
        id: body[at..at + ID_LEN].to_vec(),
        start: u64::from_le_bytes(start),
        length: u32::from_le_bytes(length),
    }
}
