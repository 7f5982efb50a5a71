//! Block encoding
//!
//! On-disk framing shared by head blocks and backend blocks:
//!
//! - **Objects**: `total_len u32 | id_len u32 | id | object`
//! - **Pages**: `total_len u32 | header_len u16 | header | data`, where data is a
//!   run of framed objects compressed with the block [`Encoding`]
//! - **Index**: fixed-size [`Record`]s sorted by id plus a checksum trailer
//! - **Bloom**: independently stored shards of a [`ShardedBloomFilter`]
//!
//! The [`Appender`] and [`BufferedAppender`] sit on top of a [`DataWriter`] and
//! remember where every object landed.
//!
//! # Example
//!
//! ```
//! use kura::encoding::{Appender, Encoding, PagedDataWriter, RecordAppender};
//!
//! let appender = Appender::new(PagedDataWriter::new(Vec::new(), Encoding::None));
//! appender.append(b"trace-1", b"payload").unwrap();
//!
//! let records = appender.records_for_id(b"trace-1");
//! assert_eq!(records.len(), 1);
//! assert_eq!(records[0].start, 0);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub mod appender;
pub mod bloom;
pub mod id;
pub mod object;
pub mod page;
pub mod record;

pub use appender::{Appender, BufferedAppender, RecordAppender};
pub use bloom::{BloomShard, ShardedBloomFilter};
pub use id::{ID, ID_LEN};
pub use page::{DataWriter, PagedDataWriter};
pub use record::Record;

const ZSTD_LEVEL: i32 = 3;

/// Encoding errors
#[derive(Error, Debug)]
pub enum EncodingError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Appender is complete")]
    Completed,

    #[error("Appender has no writer")]
    NoWriter,

    #[error("Appender stopped after a write error")]
    Failed,

    #[error("Invalid trace id: {0}")]
    InvalidId(String),

    #[error("Corrupt page: {0}")]
    CorruptPage(String),

    #[error("Corrupt object: {0}")]
    CorruptObject(String),

    #[error("Corrupt index: {0}")]
    CorruptIndex(String),

    #[error("Corrupt bloom filter: {0}")]
    CorruptBloom(String),

    #[error("Unknown encoding: {0}")]
    UnknownEncoding(String),
}

pub type Result<T> = std::result::Result<T, EncodingError>;

/// Compression applied to data pages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    #[default]
    None,
    Lz4,
    Zstd,
}

impl Encoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            Encoding::None => "none",
            Encoding::Lz4 => "lz4",
            Encoding::Zstd => "zstd",
        }
    }

    /// Compress a page payload
    pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Encoding::None => Ok(data.to_vec()),
            Encoding::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
            Encoding::Zstd => Ok(zstd::bulk::compress(data, ZSTD_LEVEL)?),
        }
    }

    /// Decompress a page payload
    pub fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Encoding::None => Ok(data.to_vec()),
            Encoding::Lz4 => lz4_flex::decompress_size_prepended(data)
                .map_err(|e| EncodingError::CorruptPage(format!("lz4: {}", e))),
            Encoding::Zstd => Ok(zstd::stream::decode_all(data)?),
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Encoding {
    type Err = EncodingError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(Encoding::None),
            "lz4" => Ok(Encoding::Lz4),
            "zstd" => Ok(Encoding::Zstd),
            other => Err(EncodingError::UnknownEncoding(other.to_string())),
        }
    }
}
