// src/core/proxy/proxy_main.rs

//! Proxy Main (§4.H): the process-wide list of pools, each bound to its own
//! listening port, plus the administrative entry points the management
//! channel and admin opcodes call into (create/list/remove a pool).
//!
//! Generalizes the teacher's top-level `ServerContext` listener-set
//! (`server/context.rs`) from "one listener" to "one listener per pool,"
//! guarded by a single lock over the pool list exactly as the original
//! proxy_main guards its pool array.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use crate::core::errors::HiveError;
use crate::core::metrics;
use crate::core::proxy::pool::{Pool, PoolConfig};

/// The process-wide set of proxy pools, each identified by name and bound to
/// a distinct port.
pub struct ProxyMain {
    pools: RwLock<HashMap<String, Arc<Pool>>>,
    worker_count: usize,
}

impl ProxyMain {
    pub fn new(worker_count: usize) -> Arc<Self> {
        Arc::new(Self {
            pools: RwLock::new(HashMap::new()),
            worker_count: worker_count.max(1),
        })
    }

    pub fn pool(&self, name: &str) -> Option<Arc<Pool>> {
        self.pools.read().get(name).cloned()
    }

    pub fn pool_by_port(&self, port: u16) -> Option<Arc<Pool>> {
        self.pools.read().values().find(|p| p.port == port).cloned()
    }

    pub fn pool_names(&self) -> Vec<String> {
        self.pools.read().keys().cloned().collect()
    }

    /// Creates a new pool, or applies `config` to an existing pool of the
    /// same name in place (so its version bumps rather than its identity
    /// changing, preserving in-flight reservations against the old state
    /// until they complete).
    pub fn upsert_pool(&self, name: &str, port: u16, config: PoolConfig) -> Arc<Pool> {
        let existing = self.pools.read().get(name).cloned();
        if let Some(pool) = existing {
            pool.apply_config(config);
            info!(pool = %name, version = pool.version(), "pool config replaced");
            return pool;
        }
        let pool = Pool::new(name.to_string(), port, config, self.worker_count);
        self.pools.write().insert(name.to_string(), Arc::clone(&pool));
        metrics::POOLS_ACTIVE.inc();
        info!(pool = %name, port, "pool created");
        pool
    }

    /// Removes a pool entirely, e.g. when a reconfiguration document no
    /// longer lists it (§4.K step 6 "retire stale pools"). In-flight
    /// reservations against the removed `Arc<Pool>` still complete normally;
    /// only new connections fail to find it by name.
    pub fn remove_pool(&self, name: &str) -> Result<(), HiveError> {
        let removed = self.pools.write().remove(name);
        if removed.is_some() {
            metrics::POOLS_ACTIVE.dec();
            info!(pool = %name, "pool retired");
            Ok(())
        } else {
            Err(HiveError::PoolNotFound(name.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::proxy::downstream::conn_set::{Protocol, ServerBehavior};
    use crate::core::proxy::selector::NodeLocator;
    use std::time::Duration;

    fn test_config() -> PoolConfig {
        PoolConfig {
            node_locator: NodeLocator::Ketama,
            behaviors: vec![ServerBehavior {
                host: "127.0.0.1".into(),
                port: 11211,
                protocol: Protocol::Ascii,
                connect_timeout: Duration::from_millis(100),
                downstream_timeout: Duration::from_millis(100),
                connect_max_errors: 3,
                connect_retry_interval: Duration::from_millis(50),
                sasl_credentials: None,
                bucket_select: None,
            }],
            vbucket_map: Vec::new(),
            front_cache_size: 16,
            admission_spec: String::new(),
            admission_unspec: String::new(),
            optimize_set_spec: String::new(),
            optimize_set_unspec: String::new(),
            honor_flush_delay: false,
            max_concurrent_downstream: 4,
            key_stats_capacity: 16,
            wait_queue_timeout: Duration::from_millis(200),
            downstream_timeout: Duration::from_millis(200),
            max_retries: 2,
            front_cache_lifespan: Duration::from_millis(30_000),
            is_null_bucket: false,
        }
    }

    #[test]
    fn upsert_creates_then_reconfigures_in_place() {
        let main = ProxyMain::new(2);
        let pool = main.upsert_pool("pool-a", 11311, test_config());
        assert_eq!(pool.version(), 1);
        let same_pool = main.upsert_pool("pool-a", 11311, test_config());
        assert_eq!(same_pool.version(), 2);
        assert_eq!(main.pool_names(), vec!["pool-a".to_string()]);
    }

    #[test]
    fn removing_an_unknown_pool_is_an_error() {
        let main = ProxyMain::new(1);
        assert!(main.remove_pool("nope").is_err());
    }
}
