// src/core/state/core.rs

//! `AppState`: the single shared handle every listener and connection task
//! holds an `Arc` of. Generalizes the teacher's `ServerState::initialize`
//! factory pattern — build every subsystem once at startup, hand out `Arc`
//! clones rather than passing a dozen separate handles around — from "the
//! whole keyspace plus replication/cluster/ACL" down to the bucket registry
//! and proxy main this host actually owns.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing_subscriber::{filter::EnvFilter, reload};

use crate::config::Config;
use crate::core::admin::AdminCredentials;
use crate::core::bucket::registry::BucketRegistry;
use crate::core::proxy::proxy_main::ProxyMain;
use crate::core::proxy::reconfig::ReconfigPipeline;
use crate::core::state::client::ClientMap;
use crate::core::state::stats::StatsState;

/// A handle to the reloadable log filter, stashed here so an admin surface
/// could change verbosity at runtime without a restart (matching the
/// teacher's `main.rs` rationale for building the handle in the first
/// place).
pub type LogReloadHandle = Arc<reload::Handle<EnvFilter, tracing_subscriber::Registry>>;

/// Process-wide state built once by [`AppState::new`] and shared behind an
/// `Arc` with every listener and connection task.
pub struct AppState {
    pub config: Config,
    pub bucket_registry: Arc<BucketRegistry>,
    pub proxy_main: Arc<ProxyMain>,
    pub reconfig: Arc<ReconfigPipeline>,
    pub admin_credentials: Option<AdminCredentials>,
    pub clients: ClientMap,
    pub stats: StatsState,
    pub log_reload_handle: LogReloadHandle,
    next_session_id: AtomicU64,
}

impl AppState {
    /// Builds every subsystem from `config`: the bucket registry (rooted at
    /// `engine_module_path`), the proxy's pool registry, and the
    /// reconfiguration pipeline bound to the resolved `pool_defaults`.
    /// Bootstrap pools (`config.bootstrap`, §6's kv-config form) are applied
    /// separately by the caller once the listeners are ready to bind, since
    /// applying a reconfig document may need to bind new ports.
    pub fn new(config: Config, log_reload_handle: LogReloadHandle) -> Arc<Self> {
        let bucket_registry = BucketRegistry::new(config.engine_module_path.clone());
        let proxy_main = ProxyMain::new(config.worker_count);
        let reconfig = Arc::new(ReconfigPipeline::new(
            Arc::clone(&proxy_main),
            config.pool_defaults.resolve(),
        ));
        let admin_credentials = config.admin_credentials();

        Arc::new(Self {
            bucket_registry,
            proxy_main,
            reconfig,
            admin_credentials,
            clients: ClientMap::default(),
            stats: StatsState::default(),
            log_reload_handle,
            next_session_id: AtomicU64::new(1),
            config,
        })
    }

    /// Assigns the next monotonically increasing session id, used as both
    /// the client map key and the `upstream_id` a pool charges a
    /// reservation's worker slot against (§4.F).
    pub fn next_session_id(&self) -> u64 {
        self.next_session_id.fetch_add(1, Ordering::SeqCst)
    }
}
