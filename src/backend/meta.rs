//! Block meta files
//!
//! `meta.json` describes a live block; `meta.compacted.json` replaces it once
//! the block has been compacted away or expired.

use crate::encoding::Encoding;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CURRENT_FORMAT: &str = "v2";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockMeta {
    pub format: String,
    #[serde(rename = "blockID")]
    pub block_id: Uuid,
    #[serde(rename = "minID", with = "hex_bytes")]
    pub min_id: Vec<u8>,
    #[serde(rename = "maxID", with = "hex_bytes")]
    pub max_id: Vec<u8>,
    #[serde(rename = "tenantID")]
    pub tenant_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub total_objects: u64,
    pub size: u64,
    pub compaction_level: u8,
    pub encoding: Encoding,
    #[serde(default)]
    pub index_page_size: u32,
    #[serde(default)]
    pub total_records: u32,
    #[serde(default)]
    pub bloom_shards: u32,
}

impl BlockMeta {
    pub fn new(tenant_id: &str, block_id: Uuid, encoding: Encoding) -> Self {
        Self {
            format: CURRENT_FORMAT.to_string(),
            block_id,
            min_id: Vec::new(),
            max_id: Vec::new(),
            tenant_id: tenant_id.to_string(),
            start_time: DateTime::<Utc>::default(),
            end_time: DateTime::<Utc>::default(),
            total_objects: 0,
            size: 0,
            compaction_level: 0,
            encoding,
            index_page_size: 0,
            total_records: 0,
            bloom_shards: 0,
        }
    }

    /// Widen the id and time range for one more object.
    pub fn object_added(&mut self, id: &[u8], start: u32, end: u32) {
        let (start, end) = (unix_to_time(start), unix_to_time(end.max(start)));

        if self.total_objects == 0 {
            self.min_id = id.to_vec();
            self.max_id = id.to_vec();
            self.start_time = start;
            self.end_time = end;
        } else {
            if id < self.min_id.as_slice() {
                self.min_id = id.to_vec();
            }
            if id > self.max_id.as_slice() {
                self.max_id = id.to_vec();
            }
            self.start_time = self.start_time.min(start);
            self.end_time = self.end_time.max(end);
        }
        self.total_objects += 1;
    }

    /// True when `id` falls inside `[min_id, max_id]`.
    pub fn may_contain(&self, id: &[u8]) -> bool {
        self.total_objects > 0 && id >= self.min_id.as_slice() && id <= self.max_id.as_slice()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactedBlockMeta {
    #[serde(flatten)]
    pub meta: BlockMeta,
    pub compacted_time: DateTime<Utc>,
}

/// Unix seconds to a UTC timestamp
pub fn unix_to_time(secs: u32) -> DateTime<Utc> {
    Utc.timestamp_opt(secs as i64, 0)
        .single()
        .unwrap_or_default()
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_added_widens_range() {
        let mut meta = BlockMeta::new("t1", Uuid::new_v4(), Encoding::None);
        assert!(!meta.may_contain(&[5]));

        meta.object_added(&[5], 100, 110);
        meta.object_added(&[2], 120, 130);
        meta.object_added(&[9], 90, 95);

        assert_eq!(meta.min_id, vec![2]);
        assert_eq!(meta.max_id, vec![9]);
        assert_eq!(meta.start_time.timestamp(), 90);
        assert_eq!(meta.end_time.timestamp(), 130);
        assert_eq!(meta.total_objects, 3);

        assert!(meta.may_contain(&[2]));
        assert!(meta.may_contain(&[7]));
        assert!(!meta.may_contain(&[10]));
        assert!(!meta.may_contain(&[1]));
    }

    #[test]
    fn test_end_never_precedes_start() {
        let mut meta = BlockMeta::new("t1", Uuid::new_v4(), Encoding::None);
        meta.object_added(&[1], 200, 100);
        assert_eq!(meta.end_time.timestamp(), 200);
    }

    #[test]
    fn test_json_field_names() {
        let mut meta = BlockMeta::new("tenant-a", Uuid::nil(), Encoding::Zstd);
        meta.object_added(&[0xab, 0xcd], 1, 2);

        let json: serde_json::Value = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["blockID"], "00000000-0000-0000-0000-000000000000");
        assert_eq!(json["tenantID"], "tenant-a");
        assert_eq!(json["minID"], "abcd");
        assert_eq!(json["totalObjects"], 1);
        assert_eq!(json["encoding"], "zstd");

        let back: BlockMeta = serde_json::from_value(json).unwrap();
        assert_eq!(back, meta);
    }

    #[test]
    fn test_compacted_meta_flattens() {
        let meta = BlockMeta::new("t1", Uuid::new_v4(), Encoding::Lz4);
        let compacted = CompactedBlockMeta {
            meta: meta.clone(),
            compacted_time: unix_to_time(1000),
        };

        let json = serde_json::to_value(&compacted).unwrap();
        assert_eq!(json["tenantID"], "t1");
        assert!(json["compactedTime"].is_string());

        let back: CompactedBlockMeta = serde_json::from_value(json).unwrap();
        assert_eq!(back.meta, meta);
    }
}
