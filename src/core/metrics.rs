// src/core/metrics.rs

//! Defines and registers Prometheus metrics for server monitoring.
//!
//! Metrics are registered once globally via `once_cell::sync::Lazy`, mirroring
//! the stat families named across the bucket lifecycle and proxy design:
//! front-cache hit/miss/expire/evict, multiget dedupe, retry, and bucket
//! lifecycle counters.

use once_cell::sync::Lazy;
use prometheus::{
    Counter, CounterVec, Gauge, GaugeVec, Histogram, TextEncoder, register_counter,
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram,
};

// --- Server-wide gauges ---

pub static CONNECTED_CLIENTS: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "hivecache_connected_clients",
        "Number of currently connected upstream clients."
    )
    .unwrap()
});

pub static BUCKETS_RUNNING: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "hivecache_buckets_running",
        "Number of buckets currently in the RUNNING state."
    )
    .unwrap()
});

pub static POOLS_ACTIVE: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!("hivecache_pools_active", "Number of active proxy pools.").unwrap()
});

// --- Server-wide counters ---

pub static CONNECTIONS_RECEIVED_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "hivecache_connections_received_total",
        "Total number of upstream connections accepted."
    )
    .unwrap()
});

// --- Bucket lifecycle ---

pub static BUCKET_CREATED_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "hivecache_bucket_created_total",
        "Total number of buckets created."
    )
    .unwrap()
});

pub static BUCKET_DELETED_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "hivecache_bucket_deleted_total",
        "Total number of buckets torn down to STOPPED."
    )
    .unwrap()
});

pub static BUCKET_CREATE_ERRORS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "hivecache_bucket_create_errors_total",
        "Total number of failed bucket creation attempts, labeled by reason.",
        &["reason"]
    )
    .unwrap()
});

pub static BUCKET_STATE_TRANSITIONS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "hivecache_bucket_state_transitions_total",
        "Total number of bucket lifecycle state transitions, labeled by target state.",
        &["state"]
    )
    .unwrap()
});

// --- Front cache (B) ---

pub static FRONT_CACHE_HITS_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "hivecache_front_cache_hits_total",
        "Total number of front-cache hits."
    )
    .unwrap()
});

pub static FRONT_CACHE_MISSES_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "hivecache_front_cache_misses_total",
        "Total number of front-cache misses."
    )
    .unwrap()
});

pub static FRONT_CACHE_EXPIRES_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "hivecache_front_cache_expires_total",
        "Total number of front-cache entries found expired on lookup."
    )
    .unwrap()
});

pub static FRONT_CACHE_EVICTIONS_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "hivecache_front_cache_evictions_total",
        "Total number of front-cache entries evicted to stay under the size cap."
    )
    .unwrap()
});

pub static FRONT_CACHE_ADDS_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "hivecache_front_cache_adds_total",
        "Total number of items admitted into the front cache."
    )
    .unwrap()
});

pub static FRONT_CACHE_ADD_SKIPS_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "hivecache_front_cache_add_skips_total",
        "Total number of add-only stores skipped because the key already existed."
    )
    .unwrap()
});

pub static FRONT_CACHE_ADD_FAILS_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "hivecache_front_cache_add_fails_total",
        "Total number of front-cache admissions rejected by a matcher."
    )
    .unwrap()
});

pub static FRONT_CACHE_DELETES_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "hivecache_front_cache_deletes_total",
        "Total number of explicit front-cache deletes."
    )
    .unwrap()
});

pub static FRONT_CACHE_FLUSHES_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "hivecache_front_cache_flushes_total",
        "Total number of front-cache flush_all operations."
    )
    .unwrap()
});

// --- Multiget de-duplicator (C) ---

pub static MULTIGET_KEYS_DEDUPE_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "hivecache_multiget_keys_dedupe_total",
        "Total number of duplicate keys within a multiget that were not resent downstream."
    )
    .unwrap()
});

pub static MULTIGET_KEYS_UNIQUE_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "hivecache_multiget_keys_unique_total",
        "Total number of unique keys fanned downstream across all multigets."
    )
    .unwrap()
});

// --- Downstream / reservation (D, E) ---

pub static DOWNSTREAM_RETRIES_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "hivecache_downstream_retries_total",
        "Total number of reservation retries triggered by not-my-vbucket."
    )
    .unwrap()
});

pub static DOWNSTREAM_CONNECT_ERRORS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "hivecache_downstream_connect_errors_total",
        "Total number of downstream connect failures, labeled by server.",
        &["server"]
    )
    .unwrap()
});

pub static DOWNSTREAM_AUTH_FAILURES_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "hivecache_downstream_auth_failures_total",
        "Total number of downstream SASL or bucket-select failures."
    )
    .unwrap()
});

pub static WAIT_QUEUE_DEPTH: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "hivecache_wait_queue_depth",
        "Current depth of the per-worker downstream wait queue, labeled by pool.",
        &["pool"]
    )
    .unwrap()
});

pub static RESERVATION_TIMEOUTS_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "hivecache_reservation_timeouts_total",
        "Total number of reservations that hit their wait-queue or operation timeout."
    )
    .unwrap()
});

pub static OPTIMIZE_SET_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "hivecache_optimize_set_total",
        "Total number of SET commands that replied STORED immediately under optimize_set."
    )
    .unwrap()
});

pub static ERR_OOM_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "hivecache_err_oom_total",
        "Total number of downstream write failures on a fire-and-forget optimized SET."
    )
    .unwrap()
});

// --- Reconfiguration (K) ---

pub static RECONFIG_APPLIED_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "hivecache_reconfig_applied_total",
        "Total number of pool reconfigurations applied."
    )
    .unwrap()
});

pub static RECONFIG_NOOP_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "hivecache_reconfig_noop_total",
        "Total number of reconfiguration documents that produced no observable state change."
    )
    .unwrap()
});

pub static RECONFIG_REJECTED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "hivecache_reconfig_rejected_total",
        "Total number of reconfiguration documents rejected, labeled by reason.",
        &["reason"]
    )
    .unwrap()
});

// --- Histograms ---

pub static COMMAND_LATENCY_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "hivecache_command_latency_seconds",
        "Latency of upstream command processing in seconds."
    )
    .unwrap()
});

pub static DOWNSTREAM_LATENCY_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "hivecache_downstream_latency_seconds",
        "Latency of a downstream round-trip as observed by a reservation."
    )
    .unwrap()
});

/// Forces registration of every metric above; call once at startup so the
/// first `/metrics` scrape isn't missing series that haven't been touched
/// yet.
pub fn init() {
    Lazy::force(&CONNECTED_CLIENTS);
    Lazy::force(&BUCKETS_RUNNING);
    Lazy::force(&POOLS_ACTIVE);
    Lazy::force(&CONNECTIONS_RECEIVED_TOTAL);
    Lazy::force(&BUCKET_CREATED_TOTAL);
    Lazy::force(&BUCKET_DELETED_TOTAL);
    Lazy::force(&BUCKET_CREATE_ERRORS_TOTAL);
    Lazy::force(&BUCKET_STATE_TRANSITIONS_TOTAL);
    Lazy::force(&FRONT_CACHE_HITS_TOTAL);
    Lazy::force(&FRONT_CACHE_MISSES_TOTAL);
    Lazy::force(&FRONT_CACHE_EXPIRES_TOTAL);
    Lazy::force(&FRONT_CACHE_EVICTIONS_TOTAL);
    Lazy::force(&FRONT_CACHE_ADDS_TOTAL);
    Lazy::force(&FRONT_CACHE_ADD_SKIPS_TOTAL);
    Lazy::force(&FRONT_CACHE_ADD_FAILS_TOTAL);
    Lazy::force(&FRONT_CACHE_DELETES_TOTAL);
    Lazy::force(&FRONT_CACHE_FLUSHES_TOTAL);
    Lazy::force(&MULTIGET_KEYS_DEDUPE_TOTAL);
    Lazy::force(&MULTIGET_KEYS_UNIQUE_TOTAL);
    Lazy::force(&DOWNSTREAM_RETRIES_TOTAL);
    Lazy::force(&DOWNSTREAM_CONNECT_ERRORS_TOTAL);
    Lazy::force(&DOWNSTREAM_AUTH_FAILURES_TOTAL);
    Lazy::force(&WAIT_QUEUE_DEPTH);
    Lazy::force(&RESERVATION_TIMEOUTS_TOTAL);
    Lazy::force(&RECONFIG_APPLIED_TOTAL);
    Lazy::force(&RECONFIG_NOOP_TOTAL);
    Lazy::force(&RECONFIG_REJECTED_TOTAL);
    Lazy::force(&COMMAND_LATENCY_SECONDS);
    Lazy::force(&DOWNSTREAM_LATENCY_SECONDS);
}

/// Gathers all registered metrics and encodes them in the Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode_to_string(&metric_families).unwrap()
}
