//! Tag search over live blocks
//!
//! Every push that carries tags appends a flat search entry
//! ([`data::SearchEntryBuilder`]) to the head block's search file. A search
//! scans those files and keeps traces whose entries contain every requested
//! tag.

use crate::encoding::id::id_to_hex;
use crate::encoding::EncodingError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use thiserror::Error;

pub mod data;
pub mod streaming;

pub use data::{binary_search, SearchData, SearchEntryBuilder};
pub use streaming::StreamingSearchBlock;

/// Default number of traces returned by a search
pub const DEFAULT_SEARCH_LIMIT: usize = 20;

/// Search errors
#[derive(Error, Debug)]
pub enum SearchError {
    #[error("Malformed search data: {0}")]
    Malformed(String),

    #[error("Invalid search entry: {0}")]
    InvalidEntry(String),

    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Tag search request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchRequest {
    pub tags: BTreeMap<String, String>,
    /// Unix seconds; traces ending before this are skipped
    pub start: Option<u32>,
    /// Unix seconds; traces starting after this are skipped
    pub end: Option<u32>,
    pub limit: usize,
}

impl SearchRequest {
    pub fn new() -> Self {
        Self {
            limit: DEFAULT_SEARCH_LIMIT,
            ..Default::default()
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn matches(&self, data: &SearchData<'_>) -> bool {
        if let Some(start) = self.start {
            if data.end() < start {
                return false;
            }
        }
        if let Some(end) = self.end {
            if data.start() > end {
                return false;
            }
        }
        self.tags
            .iter()
            .all(|(key, value)| data.contains_tag(key, value))
    }
}

/// One matching trace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceSearchMetadata {
    #[serde(rename = "traceID")]
    pub trace_id: String,
    pub start_time_unix_seconds: u32,
    pub end_time_unix_seconds: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_service_name: Option<String>,
}

impl TraceSearchMetadata {
    pub fn from_data(data: &SearchData<'_>) -> Self {
        Self {
            trace_id: id_to_hex(data.trace_id()),
            start_time_unix_seconds: data.start(),
            end_time_unix_seconds: data.end(),
            root_service_name: data.find_tag("service.name").map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchMetrics {
    pub inspected_traces: u64,
    pub inspected_blocks: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResponse {
    pub traces: Vec<TraceSearchMetadata>,
    pub metrics: SearchMetrics,
}

/// Accumulates matches up to a limit, one result per trace id
pub struct SearchResults {
    limit: usize,
    seen: HashSet<Vec<u8>>,
    response: SearchResponse,
}

impl SearchResults {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: if limit == 0 { DEFAULT_SEARCH_LIMIT } else { limit },
            seen: HashSet::new(),
            response: SearchResponse::default(),
        }
    }

    /// Offer one entry. Returns false once the limit is reached.
    pub fn offer(&mut self, request: &SearchRequest, data: &SearchData<'_>) -> bool {
        if self.is_full() {
            return false;
        }
        self.response.metrics.inspected_traces += 1;

        if request.matches(data) && self.seen.insert(data.trace_id().to_vec()) {
            self.response
                .traces
                .push(TraceSearchMetadata::from_data(data));
        }
        !self.is_full()
    }

    pub fn block_inspected(&mut self) {
        self.response.metrics.inspected_blocks += 1;
    }

    pub fn is_full(&self) -> bool {
        self.response.traces.len() >= self.limit
    }

    pub fn into_response(self) -> SearchResponse {
        self.response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: u8, start: u32, end: u32, service: &str) -> Vec<u8> {
        SearchEntryBuilder::new(&[id])
            .time_range(start, end)
            .tag("service.name", service)
            .build()
            .unwrap()
    }

    #[test]
    fn test_request_matches_tags_and_time() {
        let buf = entry(1, 100, 200, "frontend");
        let data = SearchData::open(&buf).unwrap();

        assert!(SearchRequest::new().matches(&data));
        assert!(SearchRequest::new().with_tag("service.name", "front").matches(&data));
        assert!(!SearchRequest::new().with_tag("service.name", "backend").matches(&data));

        let mut late = SearchRequest::new();
        late.start = Some(250);
        assert!(!late.matches(&data));

        let mut early = SearchRequest::new();
        early.end = Some(50);
        assert!(!early.matches(&data));
    }

    #[test]
    fn test_results_dedupe_and_limit() {
        let request = SearchRequest::new();
        let mut results = SearchResults::new(2);

        let a = entry(1, 0, 1, "a");
        let b = entry(2, 0, 1, "b");
        let c = entry(3, 0, 1, "c");

        assert!(results.offer(&request, &SearchData::open(&a).unwrap()));
        assert!(results.offer(&request, &SearchData::open(&a).unwrap()));
        assert!(!results.offer(&request, &SearchData::open(&b).unwrap()));
        assert!(!results.offer(&request, &SearchData::open(&c).unwrap()));

        let response = results.into_response();
        assert_eq!(response.traces.len(), 2);
        assert_eq!(response.traces[0].trace_id, "01");
        assert_eq!(response.traces[0].root_service_name.as_deref(), Some("a"));
        assert_eq!(response.metrics.inspected_traces, 3);
    }
}
