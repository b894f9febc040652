// src/core/proxy/pool.rs

//! A Pool (§4.G): one listening port's worth of proxy state — identity
//! (name, port), the mutable config/version/behavior-array triple the
//! reconfiguration pipeline replaces wholesale, a front cache, admission
//! matchers, and one `ProxyThreadData` per worker.
//!
//! Generalizes the teacher's per-listener `ServerContext`
//! (`server/context.rs`) from "one bound socket with one fixed config" to
//! "one bound socket whose downstream topology can be hot-swapped."

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::RwLock;

use crate::core::errors::HiveError;
use crate::core::proxy::downstream::conn_set::{DownstreamConnSet, ServerBehavior};
use crate::core::proxy::downstream::reservation::DownstreamReservation;
use crate::core::proxy::front_cache::{AdmissionMatcher, FrontCache};
use crate::core::proxy::ptd::ProxyThreadData;
use crate::core::proxy::selector::{NodeLocator, RoutingTable, ServerSelector};
use crate::core::protocol::ascii::{Command, Reply};

/// Config fields that change together on every reconfiguration (§4.K):
/// the routing scheme, the downstream behavior array, and the derived
/// routing table are always replaced as one unit so a reader never observes
/// a behavior array and a routing table built from different documents.
pub struct PoolConfig {
    pub node_locator: NodeLocator,
    pub behaviors: Vec<ServerBehavior>,
    pub vbucket_map: Vec<usize>,
    pub front_cache_size: usize,
    pub admission_spec: String,
    pub admission_unspec: String,
    /// SET-optimization admission (§4.E): a SET whose key matches replies
    /// STORED to the upstream immediately while the write proceeds
    /// asynchronously downstream (fire-and-forget).
    pub optimize_set_spec: String,
    pub optimize_set_unspec: String,
    pub honor_flush_delay: bool,
    pub max_concurrent_downstream: usize,
    pub key_stats_capacity: usize,
    pub wait_queue_timeout: Duration,
    pub downstream_timeout: Duration,
    pub max_retries: u32,
    /// Front-cache entry TTL, applied as the exptime on every cache insert
    /// this pool performs (§8 scenario 4).
    pub front_cache_lifespan: Duration,
    /// The NULL bucket carries no SASL/bucket-select dance (the original
    /// moxi convention for "no real bucket behind this pool, pass
    /// everything through as-is").
    pub is_null_bucket: bool,
}

struct PoolState {
    conn_set: Arc<DownstreamConnSet>,
    config: Arc<PoolConfig>,
}

pub struct Pool {
    pub name: String,
    pub port: u16,
    version: AtomicU64,
    selector: ServerSelector,
    state: ArcSwap<PoolState>,
    pub front_cache: Arc<FrontCache>,
    admission: RwLock<AdmissionMatcher>,
    optimize_set: RwLock<AdmissionMatcher>,
    workers: Vec<Arc<ProxyThreadData>>,
}

impl Pool {
    pub fn new(name: String, port: u16, config: PoolConfig, worker_count: usize) -> Arc<Self> {
        let table = build_routing_table(&config);
        let selector = ServerSelector::new(table);
        let matcher = AdmissionMatcher::new(&config.admission_spec, &config.admission_unspec);
        let optimize_set = AdmissionMatcher::new(&config.optimize_set_spec, &config.optimize_set_unspec);
        let front_cache = Arc::new(FrontCache::new(matcher.clone(), config.honor_flush_delay));
        front_cache.start(config.front_cache_size);

        let workers = (0..worker_count.max(1))
            .map(|_| {
                Arc::new(ProxyThreadData::new(
                    name.clone(),
                    config.max_concurrent_downstream,
                    config.key_stats_capacity,
                ))
            })
            .collect();

        let conn_set = Arc::new(DownstreamConnSet::new(config.behaviors.clone()));

        Arc::new(Self {
            name,
            port,
            version: AtomicU64::new(1),
            selector,
            state: ArcSwap::new(Arc::new(PoolState {
                conn_set,
                config: Arc::new(config),
            })),
            front_cache,
            admission: RwLock::new(matcher),
            optimize_set: RwLock::new(optimize_set),
            workers,
        })
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    pub fn worker(&self, index: usize) -> Option<Arc<ProxyThreadData>> {
        self.workers.get(index % self.workers.len().max(1)).cloned()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn is_null_bucket(&self) -> bool {
        self.state.load().config.is_null_bucket
    }

    /// Replaces the routing table, downstream behavior array, and front
    /// cache admission matcher as one atomic unit, bumping the pool's
    /// version. Workers notice the new version the next time they compare
    /// their `ProxyThreadData::config_version` against `Pool::version`
    /// (§4.F, §4.K step 5).
    pub fn apply_config(&self, config: PoolConfig) {
        let table = build_routing_table(&config);
        self.selector.swap(table);
        let matcher = AdmissionMatcher::new(&config.admission_spec, &config.admission_unspec);
        *self.admission.write() = matcher.clone();
        *self.optimize_set.write() =
            AdmissionMatcher::new(&config.optimize_set_spec, &config.optimize_set_unspec);
        self.front_cache.stop();
        self.front_cache.start(config.front_cache_size);

        let conn_set = Arc::new(DownstreamConnSet::new(config.behaviors.clone()));
        self.state.store(Arc::new(PoolState {
            conn_set,
            config: Arc::new(config),
        }));
        self.version.fetch_add(1, Ordering::SeqCst);
    }

    /// Runs one upstream command against this pool's current downstream
    /// topology, dispatching a fresh `DownstreamReservation` bound to
    /// whichever config/conn_set snapshot is live right now.
    ///
    /// `upstream_id` also selects which worker's `ptd` this reservation is
    /// charged against (§4.F): the worker's concurrency-cap semaphore is
    /// acquired, bounded by the wait-queue timeout, before a reservation is
    /// even constructed, matching the Acquire step's "enqueue on
    /// waiting_any_downstream and start a wait-queue timeout" contract.
    pub async fn execute(&self, cmd: Command, upstream_id: u64) -> Result<Vec<Reply>, HiveError> {
        let state = self.state.load_full();
        let worker = self
            .worker(upstream_id as usize)
            .ok_or_else(|| HiveError::Internal("pool has no workers".into()))?;
        worker.adopt_config_version(self.version());

        let _permit = tokio::time::timeout(state.config.wait_queue_timeout, worker.acquire_slot())
            .await
            .map_err(|_| HiveError::WaitQueueTimeout)??;

        let reservation = DownstreamReservation {
            selector: self.selector.clone(),
            conn_set: Arc::clone(&state.conn_set),
            front_cache: Some(Arc::clone(&self.front_cache)),
            wait_queue_timeout: state.config.wait_queue_timeout,
            downstream_timeout: state.config.downstream_timeout,
            max_retries: state.config.max_retries,
            front_cache_lifespan_ms: state.config.front_cache_lifespan.as_millis() as i64,
            optimize_set: self.optimize_set.read().clone(),
        };
        reservation.execute(cmd, upstream_id).await
    }
}

fn build_routing_table(config: &PoolConfig) -> RoutingTable {
    match config.node_locator {
        NodeLocator::Ketama => {
            let weights: Vec<(usize, u32)> = (0..config.behaviors.len()).map(|i| (i, 1)).collect();
            RoutingTable::new_ketama(&weights)
        }
        NodeLocator::Vbucket => RoutingTable::new_vbucket(config.vbucket_map.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::proxy::downstream::conn_set::Protocol;

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
    fn apply_config_bumps_the_version() {
        let pool = Pool::new("pool-a".into(), 11311, test_config(), 2);
        assert_eq!(pool.version(), 1);
        pool.apply_config(test_config());
        assert_eq!(pool.version(), 2);
    }

    #[test]
    fn workers_are_allocated_per_worker_count() {
        let pool = Pool::new("pool-a".into(), 11311, test_config(), 3);
        assert_eq!(pool.worker_count(), 3);
        assert!(pool.worker(0).is_some());
    }
}
