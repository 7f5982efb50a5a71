//! Trace ID helpers

use super::{EncodingError, Result};
use xxhash_rust::xxh3::xxh3_64;

/// Length of an id stored in a backend index
pub const ID_LEN: usize = 16;

/// Trace ID bytes
pub type ID = Vec<u8>;

/// Left-pad an id with zeros to [`ID_LEN`] bytes.
pub fn pad_id(id: &[u8]) -> Result<ID> {
    if id.is_empty() {
        return Err(EncodingError::InvalidId("empty id".into()));
    }
    if id.len() > ID_LEN {
        return Err(EncodingError::InvalidId(format!(
            "id is {} bytes, maximum is {}",
            id.len(),
            ID_LEN
        )));
    }

    let mut padded = vec![0u8; ID_LEN - id.len()];
    padded.extend_from_slice(id);
    Ok(padded)
}

/// Parse a hex trace id (odd lengths allowed) and pad it.
pub fn parse_hex_id(s: &str) -> Result<ID> {
    let s = s.trim();
    let decoded = if s.len() % 2 == 1 {
        hex::decode(format!("0{}", s))
    } else {
        hex::decode(s)
    }
    .map_err(|e| EncodingError::InvalidId(format!("{}: {}", s, e)))?;

    pad_id(&decoded)
}

/// Lowercase hex rendering with leading zero bytes trimmed.
pub fn id_to_hex(id: &[u8]) -> String {
    let first = id.iter().position(|b| *b != 0).unwrap_or(id.len());
    if first == id.len() {
        return "0".to_string();
    }
    hex::encode(&id[first..])
}

/// 64-bit hash used for appender buckets and bloom shard selection
#[inline]
pub fn hash_id(id: &[u8]) -> u64 {
    xxh3_64(id)
}
