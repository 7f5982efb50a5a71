//! Blocks
//!
//! A trace object moves through three kinds of block:
//!
//! 1. [`HeadBlock`]: the WAL file an ingester appends to, one page per push.
//! 2. [`StreamingBlock`]: an in-memory builder fed id-ordered objects that
//!    writes a finished block to the backend.
//! 3. [`BackendBlock`]: an immutable block read through its bloom, index and
//!    a single ranged data read.
//!
//! Every stored object carries its time range in front of the payload:
//! `start u32 LE | end u32 LE | payload`. Duplicate ids are combined by
//! keeping the larger payload and widening the range.

use crate::backend::BackendError;
use crate::encoding::EncodingError;
use crate::search::SearchError;
use thiserror::Error;

pub mod backend_block;
pub mod head;
pub mod streaming;

pub use backend_block::{BackendBlock, BackendBlockIterator};
pub use head::HeadBlock;
pub use streaming::StreamingBlock;

/// Bytes of time range in front of each payload
pub const OBJECT_TIME_LEN: usize = 8;

/// Block errors
#[derive(Error, Debug)]
pub enum BlockError {
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Search error: {0}")]
    Search(#[from] SearchError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid WAL file name: {0}")]
    InvalidWalFile(String),

    #[error("Invalid object: {0}")]
    InvalidObject(String),
}

pub type Result<T> = std::result::Result<T, BlockError>;

/// Prefix a payload with its time range.
pub fn wrap_object(start: u32, end: u32, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(OBJECT_TIME_LEN + payload.len());
    buf.extend_from_slice(&start.to_le_bytes());
    buf.extend_from_slice(&end.max(start).to_le_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Split a stored object into `(start, end, payload)`.
pub fn unwrap_object(object: &[u8]) -> Result<(u32, u32, &[u8])> {
    if object.len() < OBJECT_TIME_LEN {
        return Err(BlockError::InvalidObject(format!(
            "object of {} bytes has no time range",
            object.len()
        )));
    }
    let start = u32::from_le_bytes([object[0], object[1], object[2], object[3]]);
    let end = u32::from_le_bytes([object[4], object[5], object[6], object[7]]);
    Ok((start, end, &object[OBJECT_TIME_LEN..]))
}

/// Combine two stored objects for the same id.
pub fn combine_objects(a: &[u8], b: &[u8]) -> Result<Vec<u8>> {
    let (a_start, a_end, a_payload) = unwrap_object(a)?;
    let (b_start, b_end, b_payload) = unwrap_object(b)?;
    let payload = if b_payload.len() > a_payload.len() {
        b_payload
    } else {
        a_payload
    };
    Ok(wrap_object(
        a_start.min(b_start),
        a_end.max(b_end),
        payload,
    ))
}

/// Keep whichever of two optional results is larger.
pub fn largest(a: Option<Vec<u8>>, b: Option<Vec<u8>>) -> Option<Vec<u8>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(if b.len() > a.len() { b } else { a }),
        (a, None) => a,
        (None, b) => b,
    }
}
