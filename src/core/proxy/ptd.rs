// src/core/proxy/ptd.rs

//! Per-Worker Proxy Data (§4.F): the slice of a pool's state that is
//! private to one worker thread/task — a config snapshot and version stamp,
//! a concurrency cap enforced as a wait queue, and the key-stats cache
//! supplement from SPEC_FULL.md.
//!
//! Generalizes the teacher's per-worker `WorkerContext`
//! (`server/spawner.rs`) from "owns a listener backlog slice" to "owns a
//! config snapshot plus an admission-controlled downstream concurrency cap."

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use lru::LruCache;
use parking_lot::Mutex;
use tokio::sync::{Semaphore, SemaphorePermit};

use crate::core::errors::HiveError;
use crate::core::metrics;

/// Rolling counters for a single key, evicted LRU-style once the cache fills
/// (the "key-stats cache" supplement in SPEC_FULL.md).
#[derive(Clone, Default)]
pub struct KeyStats {
    pub get_count: u64,
    pub set_count: u64,
    pub last_op_unix_ms: i64,
}

/// A bounded, mutex-guarded view into recent per-key activity, read by the
/// admin `stats keystats`-style surface without touching the engine itself.
pub struct KeyStatsCache {
    cache: Mutex<LruCache<bytes::Bytes, KeyStats>>,
}

impl KeyStatsCache {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).expect("capacity clamped to at least 1");
        Self {
            cache: Mutex::new(LruCache::new(cap)),
        }
    }

    pub fn record_get(&self, key: &bytes::Bytes, now_ms: i64) {
        let mut guard = self.cache.lock();
        let mut entry = guard.get(key).cloned().unwrap_or_default();
        entry.get_count += 1;
        entry.last_op_unix_ms = now_ms;
        guard.put(key.clone(), entry);
    }

    pub fn record_set(&self, key: &bytes::Bytes, now_ms: i64) {
        let mut guard = self.cache.lock();
        let mut entry = guard.get(key).cloned().unwrap_or_default();
        entry.set_count += 1;
        entry.last_op_unix_ms = now_ms;
        guard.put(key.clone(), entry);
    }

    pub fn get(&self, key: &bytes::Bytes) -> Option<KeyStats> {
        self.cache.lock().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One worker's private slice of a pool: a config-version stamp it compares
/// against the pool's current version to know when to pick up a
/// reconfiguration (§4.K step 5 "scatter reload-config work items"), and a
/// semaphore bounding how many downstream reservations this worker holds
/// concurrently.
pub struct ProxyThreadData {
    pub pool_name: String,
    config_version: AtomicU64,
    concurrency: Arc<Semaphore>,
    pub key_stats: KeyStatsCache,
}

impl ProxyThreadData {
    pub fn new(pool_name: String, max_concurrent_downstream: usize, key_stats_capacity: usize) -> Self {
        Self {
            pool_name,
            config_version: AtomicU64::new(0),
            concurrency: Arc::new(Semaphore::new(max_concurrent_downstream.max(1))),
            key_stats: KeyStatsCache::new(key_stats_capacity),
        }
    }

    pub fn config_version(&self) -> u64 {
        self.config_version.load(Ordering::SeqCst)
    }

    /// Called by the reconfig pipeline's scatter step; idempotent if this
    /// worker has already observed `version` or something newer.
    pub fn adopt_config_version(&self, version: u64) -> bool {
        let current = self.config_version.load(Ordering::SeqCst);
        if version <= current {
            return false;
        }
        self.config_version.store(version, Ordering::SeqCst);
        true
    }

    /// Blocks until a downstream slot is available or the wait-queue timer
    /// (owned by the caller, typically the reservation's own
    /// `wait_queue_timeout`) expires, returning a permit that releases the
    /// slot on drop. Updates `hivecache_wait_queue_depth` while waiting.
    pub async fn acquire_slot(&self) -> Result<SemaphorePermit<'_>, HiveError> {
        let waiting = self.concurrency.available_permits() == 0;
        if waiting {
            metrics::WAIT_QUEUE_DEPTH.with_label_values(&[&self.pool_name]).inc();
        }
        let permit = self
            .concurrency
            .acquire()
            .await
            .map_err(|_| HiveError::Internal("proxy thread data semaphore closed".into()))?;
        if waiting {
            metrics::WAIT_QUEUE_DEPTH.with_label_values(&[&self.pool_name]).dec();
        }
        Ok(permit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adopt_config_version_rejects_stale_versions() {
        let ptd = ProxyThreadData::new("pool-a".into(), 4, 16);
        assert!(ptd.adopt_config_version(2));
        assert!(!ptd.adopt_config_version(1));
        assert!(ptd.adopt_config_version(3));
        assert_eq!(ptd.config_version(), 3);
    }

    #[test]
    fn key_stats_cache_tracks_get_and_set_counts() {
        let cache = KeyStatsCache::new(4);
        let key = bytes::Bytes::from_static(b"user:1");
        cache.record_get(&key, 1000);
        cache.record_get(&key, 1001);
        cache.record_set(&key, 1002);
        let stats = cache.get(&key).unwrap();
        assert_eq!(stats.get_count, 2);
        assert_eq!(stats.set_count, 1);
    }
}
