//! Metric names and recording helpers
//!
//! The library only records through the `metrics` facade; installing an
//! exporter is left to the embedding process.

pub const CORRUPTION_TOTAL: &str = "photonkv_corruption_total";
pub const RECLAIM_SWEEPS_TOTAL: &str = "photonkv_reclaim_sweeps_total";
pub const RECLAIM_DELETED_TOTAL: &str = "photonkv_reclaim_deleted_records_total";
pub const RECLAIM_FAILURES_TOTAL: &str = "photonkv_reclaim_failures_total";
pub const RECLAIM_QUEUE_DEPTH: &str = "photonkv_reclaim_queue_depth";
pub const COMMITS_TOTAL: &str = "photonkv_commits_total";
pub const SEQUENCE_REGRESSIONS_TOTAL: &str = "photonkv_sequence_regressions_total";

/// Undecodable on-disk data; `kind` names the record type.
pub fn record_corruption(kind: &'static str) {
    metrics::counter!(CORRUPTION_TOTAL, "kind" => kind).increment(1);
}

pub fn record_sweep(deleted_records: u64) {
    metrics::counter!(RECLAIM_SWEEPS_TOTAL).increment(1);
    metrics::counter!(RECLAIM_DELETED_TOTAL).increment(deleted_records);
}

pub fn record_reclaim_failure() {
    metrics::counter!(RECLAIM_FAILURES_TOTAL).increment(1);
}

pub fn record_queue_depth(depth: usize) {
    metrics::gauge!(RECLAIM_QUEUE_DEPTH).set(depth as f64);
}

pub fn record_commit(replicated: bool) {
    metrics::counter!(COMMITS_TOTAL, "replicated" => replicated.to_string()).increment(1);
}

pub fn record_sequence_regression() {
    metrics::counter!(SEQUENCE_REGRESSIONS_TOTAL).increment(1);
}
