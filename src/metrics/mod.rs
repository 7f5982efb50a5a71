//! Metrics module
//!
//! Prometheus collectors for the storage pipeline, registered once in the
//! default registry and exposed by the HTTP server at `/metrics`.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_histogram, register_histogram_vec, register_int_counter,
    register_int_counter_vec, register_int_gauge_vec, CounterVec, Encoder, Histogram,
    HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, TextEncoder,
};

lazy_static! {
    // Blocklist metrics
    pub static ref BLOCKLIST_POLLS: IntCounter = register_int_counter!(
        "kura_blocklist_poll_total",
        "Total number of blocklist polls"
    ).unwrap();

    pub static ref BLOCKLIST_POLL_ERRORS: IntCounterVec = register_int_counter_vec!(
        "kura_blocklist_poll_errors_total",
        "Blocklist poll errors",
        &["tenant"]
    ).unwrap();

    pub static ref BLOCKLIST_LENGTH: IntGaugeVec = register_int_gauge_vec!(
        "kura_blocklist_length",
        "Number of live blocks per tenant",
        &["tenant"]
    ).unwrap();

    pub static ref BLOCKLIST_POLL_DURATION: Histogram = register_histogram!(
        "kura_blocklist_poll_duration_seconds",
        "Blocklist poll duration in seconds",
        vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0]
    ).unwrap();

    // Query metrics
    pub static ref FIND_READS: IntCounterVec = register_int_counter_vec!(
        "kura_find_reads_total",
        "Backend reads issued while finding traces",
        &["stage"]  // "bloom", "index" or "data"
    ).unwrap();

    pub static ref FIND_DURATION: HistogramVec = register_histogram_vec!(
        "kura_find_duration_seconds",
        "Trace lookup duration in seconds",
        &["source"],  // "ingester", "store" or "federation"
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]
    ).unwrap();

    // Ingester metrics
    pub static ref TRACES_PUSHED: IntCounterVec = register_int_counter_vec!(
        "kura_ingester_traces_pushed_total",
        "Trace objects appended to head blocks",
        &["tenant"]
    ).unwrap();

    pub static ref BYTES_RECEIVED: CounterVec = register_counter_vec!(
        "kura_ingester_bytes_received_total",
        "Trace bytes received",
        &["tenant"]
    ).unwrap();

    pub static ref TRACES_REJECTED: IntCounterVec = register_int_counter_vec!(
        "kura_ingester_traces_rejected_total",
        "Trace objects rejected",
        &["tenant", "reason"]
    ).unwrap();

    pub static ref BLOCKS_FLUSHED: IntCounter = register_int_counter!(
        "kura_ingester_blocks_flushed_total",
        "Blocks written to the backend"
    ).unwrap();

    pub static ref FLUSH_FAILURES: IntCounter = register_int_counter!(
        "kura_ingester_flush_failures_total",
        "Failed block flushes"
    ).unwrap();

    pub static ref FLUSH_DURATION: Histogram = register_histogram!(
        "kura_ingester_flush_duration_seconds",
        "Block flush duration in seconds",
        vec![0.01, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0]
    ).unwrap();

    // Compaction metrics
    pub static ref COMPACTION_RUNS: IntCounter = register_int_counter!(
        "kura_compaction_runs_total",
        "Compactions started"
    ).unwrap();

    pub static ref COMPACTION_ERRORS: IntCounter = register_int_counter!(
        "kura_compaction_errors_total",
        "Compactions that failed"
    ).unwrap();

    pub static ref COMPACTION_OBJECTS_WRITTEN: IntCounterVec = register_int_counter_vec!(
        "kura_compaction_objects_written_total",
        "Objects written by compaction",
        &["level"]
    ).unwrap();

    pub static ref COMPACTION_OBJECTS_COMBINED: IntCounterVec = register_int_counter_vec!(
        "kura_compaction_objects_combined_total",
        "Duplicate objects combined by compaction",
        &["level"]
    ).unwrap();

    pub static ref COMPACTION_DURATION: Histogram = register_histogram!(
        "kura_compaction_duration_seconds",
        "Compaction duration in seconds",
        vec![0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0, 900.0]
    ).unwrap();

    // Retention metrics
    pub static ref RETENTION_MARKED: IntCounter = register_int_counter!(
        "kura_retention_marked_for_deletion_total",
        "Blocks marked compacted by retention"
    ).unwrap();

    pub static ref RETENTION_CLEARED: IntCounter = register_int_counter!(
        "kura_retention_deleted_total",
        "Compacted blocks cleared by retention"
    ).unwrap();

    pub static ref RETENTION_ERRORS: IntCounter = register_int_counter!(
        "kura_retention_errors_total",
        "Retention failures"
    ).unwrap();

    // HTTP metrics
    pub static ref HTTP_REQUESTS: IntCounterVec = register_int_counter_vec!(
        "kura_http_requests_total",
        "HTTP requests",
        &["route", "status"]
    ).unwrap();

    pub static ref FEDERATION_REQUESTS: IntCounterVec = register_int_counter_vec!(
        "kura_federation_requests_total",
        "Requests to federated peers",
        &["status"]  // "found", "not_found" or "error"
    ).unwrap();
}

/// Record a blocklist poll
pub fn record_blocklist_poll(duration_secs: f64) {
    BLOCKLIST_POLLS.inc();
    BLOCKLIST_POLL_DURATION.observe(duration_secs);
}

/// Record a failed poll of one tenant
pub fn record_blocklist_poll_error(tenant: &str) {
    BLOCKLIST_POLL_ERRORS.with_label_values(&[tenant]).inc();
}

/// Record the live block count of a tenant
pub fn record_blocklist_length(tenant: &str, length: usize) {
    BLOCKLIST_LENGTH
        .with_label_values(&[tenant])
        .set(length as i64);
}

/// Record a backend read made by a trace lookup
pub fn record_find_read(stage: &str) {
    FIND_READS.with_label_values(&[stage]).inc();
}

/// Record lookup duration
pub fn record_find_duration(source: &str, duration_secs: f64) {
    FIND_DURATION
        .with_label_values(&[source])
        .observe(duration_secs);
}

/// Record an accepted push
pub fn record_push(tenant: &str, bytes: usize) {
    TRACES_PUSHED.with_label_values(&[tenant]).inc();
    BYTES_RECEIVED
        .with_label_values(&[tenant])
        .inc_by(bytes as f64);
}

/// Record a rejected push
pub fn record_push_rejected(tenant: &str, reason: &str) {
    TRACES_REJECTED.with_label_values(&[tenant, reason]).inc();
}

/// Record a block flush outcome
pub fn record_flush(success: bool, duration_secs: f64) {
    if success {
        BLOCKS_FLUSHED.inc();
    } else {
        FLUSH_FAILURES.inc();
    }
    FLUSH_DURATION.observe(duration_secs);
}

/// Record a finished compaction
pub fn record_compaction(level: u8, written: u64, combined: u64, duration_secs: f64) {
    let level = level.to_string();
    COMPACTION_OBJECTS_WRITTEN
        .with_label_values(&[&level])
        .inc_by(written);
    COMPACTION_OBJECTS_COMBINED
        .with_label_values(&[&level])
        .inc_by(combined);
    COMPACTION_DURATION.observe(duration_secs);
}

/// Record an HTTP response
pub fn record_http_request(route: &str, status: u16) {
    HTTP_REQUESTS
        .with_label_values(&[route, &status.to_string()])
        .inc();
}

/// Record a federated peer response
pub fn record_federation_request(status: &str) {
    FEDERATION_REQUESTS.with_label_values(&[status]).inc();
}

/// Encode every registered metric in the Prometheus text format.
pub fn gather_text() -> Result<(String, Vec<u8>), prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&prometheus::gather(), &mut buffer)?;
    Ok((encoder.format_type().to_string(), buffer))
}
