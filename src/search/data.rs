//! Flat search entries
//!
//! A search entry describes one trace for tag search without decoding the
//! trace object itself:
//!
//! ```text
//! version u8 | trace id [16] | start u32 | end u32 | kv_count u32
//! offsets [u32; kv_count]
//! entries: key_len u16 | key | value_count u16 | (value_len u16 | value)*
//! ```
//!
//! Entries are written in descending key order and values of a key are
//! de-duplicated and sorted, so a key is located by binary search over the
//! offset table.

use super::SearchError;
use crate::encoding::id::{pad_id, ID_LEN};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

pub const SEARCH_DATA_VERSION: u8 = 1;

const HEADER_LEN: usize = 1 + ID_LEN + 4 + 4 + 4;

/// Binary search over `0..n` with a tri-state comparator.
///
/// `compare(i)` reports where element `i` sits relative to the target in the
/// collection's order. Returns the index of an element comparing `Equal`.
pub fn binary_search<F>(n: usize, mut compare: F) -> Option<usize>
where
    F: FnMut(usize) -> Ordering,
{
    let (mut lo, mut hi) = (0usize, n);
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        match compare(mid) {
            Ordering::Equal => return Some(mid),
            Ordering::Less => lo = mid + 1,
            Ordering::Greater => hi = mid,
        }
    }
    None
}

/// Read-only view over a validated search entry buffer
#[derive(Debug, Clone)]
pub struct SearchData<'a> {
    buf: &'a [u8],
    offsets: Vec<usize>,
}

impl<'a> SearchData<'a> {
    /// Validate `buf` and build a view over it.
    pub fn open(buf: &'a [u8]) -> Result<Self, SearchError> {
        if buf.len() < HEADER_LEN {
            return Err(malformed(format!(
                "{} bytes is shorter than the header",
                buf.len()
            )));
        }
        if buf[0] != SEARCH_DATA_VERSION {
            return Err(malformed(format!("unsupported version {}", buf[0])));
        }

        let count = read_u32(buf, HEADER_LEN - 4) as usize;
        let table_end = count
            .checked_mul(4)
            .and_then(|n| n.checked_add(HEADER_LEN))
            .filter(|end| *end <= buf.len())
            .ok_or_else(|| malformed(format!("offset table for {} entries overflows", count)))?;

        let offsets: Vec<usize> = (0..count)
            .map(|i| read_u32(buf, HEADER_LEN + i * 4) as usize)
            .collect();

        for (i, offset) in offsets.iter().enumerate() {
            if *offset < table_end {
                return Err(malformed(format!("entry {} points into the header", i)));
            }
            validate_entry(buf, *offset).map_err(|e| malformed(format!("entry {}: {}", i, e)))?;
        }

        Ok(Self { buf, offsets })
    }

    pub fn trace_id(&self) -> &'a [u8] {
        &self.buf[1..1 + ID_LEN]
    }

    /// Start of the trace in unix seconds
    pub fn start(&self) -> u32 {
        read_u32(self.buf, 1 + ID_LEN)
    }

    /// End of the trace in unix seconds
    pub fn end(&self) -> u32 {
        read_u32(self.buf, 1 + ID_LEN + 4)
    }

    pub fn tag_count(&self) -> usize {
        self.offsets.len()
    }

    fn key_at(&self, i: usize) -> &'a [u8] {
        let at = self.offsets[i];
        let len = read_u16(self.buf, at) as usize;
        &self.buf[at + 2..at + 2 + len]
    }

    fn values_at(&self, i: usize) -> ValueIter<'a> {
        let at = self.offsets[i];
        let key_len = read_u16(self.buf, at) as usize;
        let count_at = at + 2 + key_len;
        ValueIter {
            buf: self.buf,
            pos: count_at + 2,
            remaining: read_u16(self.buf, count_at) as usize,
        }
    }

    fn find_key(&self, key: &[u8]) -> Option<usize> {
        binary_search(self.offsets.len(), |i| key.cmp(self.key_at(i)))
    }

    /// True when `key` is present and one of its values contains `value`.
    pub fn contains_tag(&self, key: &str, value: &str) -> bool {
        match self.find_key(key.as_bytes()) {
            Some(i) => self
                .values_at(i)
                .any(|v| contains_bytes(v, value.as_bytes())),
            None => false,
        }
    }

    /// First value of `key`.
    pub fn find_tag(&self, key: &str) -> Option<&'a str> {
        let i = self.find_key(key.as_bytes())?;
        self.values_at(i)
            .next()
            .and_then(|v| std::str::from_utf8(v).ok())
    }

    /// All `(key, values)` pairs in stored order.
    pub fn tags(&self) -> Vec<(String, Vec<String>)> {
        (0..self.offsets.len())
            .map(|i| {
                let key = String::from_utf8_lossy(self.key_at(i)).into_owned();
                let values = self
                    .values_at(i)
                    .map(|v| String::from_utf8_lossy(v).into_owned())
                    .collect();
                (key, values)
            })
            .collect()
    }
}

struct ValueIter<'a> {
    buf: &'a [u8],
    pos: usize,
    remaining: usize,
}

impl<'a> Iterator for ValueIter<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let len = read_u16(self.buf, self.pos) as usize;
        let value = &self.buf[self.pos + 2..self.pos + 2 + len];
        self.pos += 2 + len;
        self.remaining -= 1;
        Some(value)
    }
}

/// Collects tags for one trace and emits a search entry buffer
#[derive(Debug, Clone, Default)]
pub struct SearchEntryBuilder {
    trace_id: Vec<u8>,
    start: u32,
    end: u32,
    tags: BTreeMap<String, BTreeSet<String>>,
}

impl SearchEntryBuilder {
    pub fn new(trace_id: &[u8]) -> Self {
        Self {
            trace_id: trace_id.to_vec(),
            ..Default::default()
        }
    }

    pub fn time_range(mut self, start: u32, end: u32) -> Self {
        self.start = start;
        self.end = end;
        self
    }

    pub fn add_tag(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.tags.entry(key.into()).or_default().insert(value.into());
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.add_tag(key, value);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn build(&self) -> Result<Vec<u8>, SearchError> {
        let id = pad_id(&self.trace_id).map_err(|e| SearchError::InvalidEntry(e.to_string()))?;

        let mut entries = Vec::new();
        let mut offsets = Vec::with_capacity(self.tags.len());
        let table_end = HEADER_LEN + self.tags.len() * 4;

        for (key, values) in self.tags.iter().rev() {
            offsets.push(table_end + entries.len());
            push_str(&mut entries, key)?;
            push_u16(&mut entries, values.len(), "value count")?;
            for value in values {
                push_str(&mut entries, value)?;
            }
        }

        if table_end + entries.len() > u32::MAX as usize {
            return Err(SearchError::InvalidEntry("search entry too large".into()));
        }

        let mut buf = Vec::with_capacity(table_end + entries.len());
        buf.push(SEARCH_DATA_VERSION);
        buf.extend_from_slice(&id);
        buf.extend_from_slice(&self.start.to_le_bytes());
        buf.extend_from_slice(&self.end.to_le_bytes());
        buf.extend_from_slice(&(offsets.len() as u32).to_le_bytes());
        for offset in offsets {
            buf.extend_from_slice(&(offset as u32).to_le_bytes());
        }
        buf.extend_from_slice(&entries);
        Ok(buf)
    }
}

fn push_u16(buf: &mut Vec<u8>, n: usize, what: &str) -> Result<(), SearchError> {
    let n = u16::try_from(n)
        .map_err(|_| SearchError::InvalidEntry(format!("{} {} exceeds u16", what, n)))?;
    buf.extend_from_slice(&n.to_le_bytes());
    Ok(())
}

fn push_str(buf: &mut Vec<u8>, s: &str) -> Result<(), SearchError> {
    push_u16(buf, s.len(), "length")?;
    buf.extend_from_slice(s.as_bytes());
    Ok(())
}

fn validate_entry(buf: &[u8], at: usize) -> Result<(), String> {
    let take = |pos: usize, len: usize| -> Result<usize, String> {
        let end = pos.checked_add(len).ok_or("offset overflow")?;
        if end > buf.len() {
            return Err(format!("needs {} bytes at {}", len, pos));
        }
        Ok(end)
    };

    let pos = take(at, 2)?;
    let pos = take(pos, read_u16(buf, at) as usize)?;
    let count_at = pos;
    let mut pos = take(pos, 2)?;
    for _ in 0..read_u16(buf, count_at) {
        let len_at = pos;
        pos = take(pos, 2)?;
        pos = take(pos, read_u16(buf, len_at) as usize)?;
    }
    Ok(())
}

fn contains_bytes(haystack: &[u8], needle: &[u8]) -> bool {
    needle.is_empty() || haystack.windows(needle.len()).any(|w| w == needle)
}

fn malformed(msg: String) -> SearchError {
    SearchError::Malformed(msg)
}

fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}
