//! Production metrics using native Prometheus client.
//!
//! Metrics are domain-specific rather than generic event counters.
//! Use traces for event-level granularity during investigations.

use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_histogram, Counter,
    CounterVec, Gauge, Histogram,
};
use std::sync::OnceLock;

static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Domain-specific metrics for production monitoring.
pub struct Metrics {
    // === Chain ===
    pub blocks_applied: Counter,
    pub blocks_rejected: Counter,
    pub blocks_produced: Counter,
    pub head_block_num: Gauge,
    pub lib_block_num: Gauge,
    pub reversible_blocks: Gauge,
    pub fork_switches: Counter,

    // === Finality ===
    pub votes_cast: Counter,
    pub votes_aggregated: CounterVec,
    pub qcs_formed: Counter,
    pub lib_stall_seconds: Gauge,

    // === Production ===
    pub production_paused: Gauge,
    pub pause_transitions: CounterVec,

    // === Vote verification ===
    pub vote_verification_latency: Histogram,
    pub vote_pool_queue_depth: Gauge,

    // === Storage ===
    pub safety_writes: Counter,
    pub safety_write_failures: Counter,
    pub safety_write_latency: Histogram,
    pub rocksdb_write_latency: Histogram,
    pub storage_retries: Counter,

    // === Network ===
    pub network_messages_sent: Counter,
    pub network_messages_received: Counter,
    pub sync_requests_served: Counter,
}

impl Metrics {
    // Registration fails only on duplicate names, which is a programming error.
    #[allow(clippy::unwrap_used)]
    fn new() -> Self {
        let io_buckets = vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0];

        Self {
            blocks_applied: register_counter!(
                "keel_blocks_applied_total",
                "Blocks validated and added to the fork database"
            )
            .unwrap(),
            blocks_rejected: register_counter!(
                "keel_blocks_rejected_total",
                "Blocks failing validation"
            )
            .unwrap(),
            blocks_produced: register_counter!(
                "keel_blocks_produced_total",
                "Blocks produced by this node"
            )
            .unwrap(),
            head_block_num: register_gauge!("keel_head_block_num", "Current head block number")
                .unwrap(),
            lib_block_num: register_gauge!(
                "keel_lib_block_num",
                "Last irreversible block number"
            )
            .unwrap(),
            reversible_blocks: register_gauge!(
                "keel_reversible_blocks",
                "Blocks between LIB and head"
            )
            .unwrap(),
            fork_switches: register_counter!("keel_fork_switches_total", "Head fork switches")
                .unwrap(),

            votes_cast: register_counter!("keel_votes_cast_total", "Votes cast by local finalizers")
                .unwrap(),
            votes_aggregated: register_counter_vec!(
                "keel_votes_aggregated_total",
                "Votes processed by the aggregator, by status",
                &["status"]
            )
            .unwrap(),
            qcs_formed: register_counter!(
                "keel_qcs_formed_total",
                "Quorum certificates formed or upgraded locally"
            )
            .unwrap(),
            lib_stall_seconds: register_gauge!(
                "keel_lib_stall_seconds",
                "Seconds since LIB last advanced"
            )
            .unwrap(),

            production_paused: register_gauge!(
                "keel_production_paused",
                "1 while block production is paused"
            )
            .unwrap(),
            pause_transitions: register_counter_vec!(
                "keel_production_pause_total",
                "Production pauses, by reason",
                &["reason"]
            )
            .unwrap(),

            vote_verification_latency: register_histogram!(
                "keel_vote_verification_latency_seconds",
                "Vote signature verification latency",
                vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1]
            )
            .unwrap(),
            vote_pool_queue_depth: register_gauge!(
                "keel_vote_pool_queue_depth",
                "Pending vote verification tasks"
            )
            .unwrap(),

            safety_writes: register_counter!(
                "keel_safety_writes_total",
                "Durable safety file writes"
            )
            .unwrap(),
            safety_write_failures: register_counter!(
                "keel_safety_write_failures_total",
                "Failed safety file writes"
            )
            .unwrap(),
            safety_write_latency: register_histogram!(
                "keel_safety_write_latency_seconds",
                "Safety file write latency including fsync",
                io_buckets.clone()
            )
            .unwrap(),
            rocksdb_write_latency: register_histogram!(
                "keel_rocksdb_write_latency_seconds",
                "RocksDB batch write latency",
                io_buckets
            )
            .unwrap(),
            storage_retries: register_counter!(
                "keel_storage_retries_total",
                "Retried block storage writes"
            )
            .unwrap(),

            network_messages_sent: register_counter!(
                "keel_network_messages_sent_total",
                "Total network messages sent"
            )
            .unwrap(),
            network_messages_received: register_counter!(
                "keel_network_messages_received_total",
                "Total network messages received"
            )
            .unwrap(),
            sync_requests_served: register_counter!(
                "keel_sync_requests_served_total",
                "Block range requests answered from storage"
            )
            .unwrap(),
        }
    }
}

/// Get the global metrics instance.
pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}

pub fn record_block_applied() {
    metrics().blocks_applied.inc();
}

pub fn record_blocks_rejected(count: u64) {
    metrics().blocks_rejected.inc_by(count as f64);
}

pub fn record_block_produced() {
    metrics().blocks_produced.inc();
}

pub fn set_chain_heights(head: u32, lib: u32) {
    let m = metrics();
    m.head_block_num.set(head as f64);
    m.lib_block_num.set(lib as f64);
    m.reversible_blocks.set(head.saturating_sub(lib) as f64);
}

pub fn record_fork_switch() {
    metrics().fork_switches.inc();
}

pub fn record_vote_cast() {
    metrics().votes_cast.inc();
}

pub fn record_vote_aggregated(status: &str) {
    metrics()
        .votes_aggregated
        .with_label_values(&[status])
        .inc();
}

pub fn record_qcs_formed(count: u64) {
    metrics().qcs_formed.inc_by(count as f64);
}

pub fn set_lib_stall(seconds: f64) {
    metrics().lib_stall_seconds.set(seconds);
}

pub fn record_production_paused(reason: &str) {
    let m = metrics();
    m.production_paused.set(1.0);
    m.pause_transitions.with_label_values(&[reason]).inc();
}

pub fn record_production_resumed() {
    metrics().production_paused.set(0.0);
}

pub fn record_vote_verification_latency(latency_secs: f64) {
    metrics().vote_verification_latency.observe(latency_secs);
}

pub fn set_vote_pool_queue_depth(depth: usize) {
    metrics().vote_pool_queue_depth.set(depth as f64);
}

pub fn record_safety_write(latency_secs: f64) {
    let m = metrics();
    m.safety_writes.inc();
    m.safety_write_latency.observe(latency_secs);
}

pub fn record_safety_write_failure() {
    metrics().safety_write_failures.inc();
}

pub fn record_rocksdb_write(latency_secs: f64) {
    metrics().rocksdb_write_latency.observe(latency_secs);
}

pub fn record_storage_retry() {
    metrics().storage_retries.inc();
}

pub fn record_network_message_sent() {
    metrics().network_messages_sent.inc();
}

pub fn record_network_message_received() {
    metrics().network_messages_received.inc();
}

pub fn record_sync_request_served() {
    metrics().sync_requests_served.inc();
}
