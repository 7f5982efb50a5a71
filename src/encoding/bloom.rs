//! Sharded bloom filter for block ids
//!
//! A block's bloom filter is split into shards so a lookup only has to fetch
//! the one shard that could hold the id. The shard is chosen by
//! `xxh3(id) % shard_count`, and each shard is stored as its own backend
//! object (`bloom-<n>`).
//!
//! Shard wire format: `bits u64 | hashes u32 | sip keys [u64; 4] | bitmap`.

use super::id::hash_id;
use super::{EncodingError, Result};
use bloomfilter::Bloom;

/// Upper bound on shards per block
pub const MAX_SHARDS: usize = 1000;

const SHARD_HEADER_LEN: usize = 8 + 4 + 32;

/// Number of shards needed so each stays under `shard_size_bytes`.
pub fn shard_count(fp: f64, shard_size_bytes: usize, estimated_objects: usize) -> usize {
    let n = estimated_objects.max(1) as f64;
    let bits = -(n * fp.ln()) / (std::f64::consts::LN_2 * std::f64::consts::LN_2);
    let bytes = (bits / 8.0).ceil() as usize;
    bytes.div_ceil(shard_size_bytes.max(1)).clamp(1, MAX_SHARDS)
}

/// Shard responsible for `id`
pub fn shard_for(id: &[u8], shards: usize) -> usize {
    (hash_id(id) % shards.max(1) as u64) as usize
}

/// One stored shard of a block bloom filter
pub struct BloomShard {
    bloom: Bloom<[u8]>,
}

impl BloomShard {
    fn new(items: usize, fp: f64) -> Self {
        Self {
            bloom: Bloom::new_for_fp_rate(items.max(1), fp),
        }
    }

    pub fn add(&mut self, id: &[u8]) {
        self.bloom.set(id);
    }

    /// False means `id` is definitely absent.
    pub fn test(&self, id: &[u8]) -> bool {
        self.bloom.check(id)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let bitmap = self.bloom.bitmap();
        let sip_keys = self.bloom.sip_keys();

        let mut buf = Vec::with_capacity(SHARD_HEADER_LEN + bitmap.len());
        buf.extend_from_slice(&self.bloom.number_of_bits().to_le_bytes());
        buf.extend_from_slice(&self.bloom.number_of_hash_functions().to_le_bytes());
        for (k0, k1) in sip_keys {
            buf.extend_from_slice(&k0.to_le_bytes());
            buf.extend_from_slice(&k1.to_le_bytes());
        }
        buf.extend_from_slice(&bitmap);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < SHARD_HEADER_LEN {
            return Err(EncodingError::CorruptBloom(format!(
                "{} bytes is shorter than a shard header",
                data.len()
            )));
        }

        let bits = read_u64(data, 0);
        let hashes = u32::from_le_bytes([data[8], data[9], data[10], data[11]]);
        let sip_keys = [
            (read_u64(data, 12), read_u64(data, 20)),
            (read_u64(data, 28), read_u64(data, 36)),
        ];
        let bitmap = &data[SHARD_HEADER_LEN..];

        if bits == 0 || hashes == 0 || (bitmap.len() as u64) * 8 < bits {
            return Err(EncodingError::CorruptBloom(format!(
                "bitmap of {} bytes cannot hold {} bits with {} hashes",
                bitmap.len(),
                bits,
                hashes
            )));
        }

        Ok(Self {
            bloom: Bloom::from_existing(bitmap, bits, hashes, sip_keys),
        })
    }
}

/// Bloom filter split into independently stored shards
pub struct ShardedBloomFilter {
    shards: Vec<BloomShard>,
}

impl ShardedBloomFilter {
    pub fn new(fp: f64, shard_size_bytes: usize, estimated_objects: usize) -> Self {
        let count = shard_count(fp, shard_size_bytes, estimated_objects);
        let per_shard = estimated_objects.max(1).div_ceil(count);
        Self {
            shards: (0..count).map(|_| BloomShard::new(per_shard, fp)).collect(),
        }
    }

    pub fn add(&mut self, id: &[u8]) {
        let shard = shard_for(id, self.shards.len());
        self.shards[shard].add(id);
    }

    pub fn test(&self, id: &[u8]) -> bool {
        self.shards[shard_for(id, self.shards.len())].test(id)
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// One byte buffer per shard, in shard order.
    pub fn marshal(&self) -> Vec<Vec<u8>> {
        self.shards.iter().map(BloomShard::to_bytes).collect()
    }
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(bytes)
}
