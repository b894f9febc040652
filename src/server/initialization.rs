// src/server/initialization.rs

//! Handles the complete server initialization process: building `AppState`,
//! applying the bootstrap pool configuration (§6's flat kv-config form), and
//! binding the base listener plus one listener per bootstrap pool.

use std::sync::Arc;

use anyhow::{Result, anyhow};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{info, warn};
use tracing_subscriber::{filter::EnvFilter, reload};

use super::context::ServerContext;
use crate::config::Config;
use crate::core::metrics;
use crate::core::state::AppState;

/// Initializes all server components before starting the main loop: builds
/// `AppState`, applies any bootstrap pools named in `config.bootstrap`
/// (§6, applied once at startup rather than pushed over the management
/// channel), and binds every listener the process needs.
pub async fn setup(
    config: Config,
    log_reload_handle: Arc<reload::Handle<EnvFilter, tracing_subscriber::Registry>>,
) -> Result<ServerContext> {
    log_startup_info(&config);
    metrics::init();

    let (shutdown_tx, _) = broadcast::channel(1);
    let host = config.host.clone();
    let base_port = config.port;
    let bootstrap = config.bootstrap.clone();

    let state = AppState::new(config, log_reload_handle);

    if !bootstrap.is_empty() {
        let report = state
            .reconfig
            .apply_kv_config(&bootstrap)
            .map_err(|e| anyhow!("failed to apply bootstrap pool configuration: {e}"))?;
        info!(pools = ?report.applied, "bootstrap pools applied");
    }

    let base_listener = TcpListener::bind((host.as_str(), base_port))
        .await
        .map_err(|e| anyhow!("failed to bind base listener on {host}:{base_port}: {e}"))?;
    info!("base listener bound on {}:{}", host, base_port);

    let mut pool_listeners = Vec::new();
    for name in state.proxy_main.pool_names() {
        let Some(pool) = state.proxy_main.pool(&name) else {
            continue;
        };
        match TcpListener::bind((host.as_str(), pool.port)).await {
            Ok(listener) => {
                info!(pool = %pool.name, port = pool.port, "pool listener bound");
                pool_listeners.push((pool, listener));
            }
            Err(e) => {
                warn!(pool = %pool.name, port = pool.port, error = %e, "failed to bind pool listener; pool will not accept connections");
            }
        }
    }

    Ok(ServerContext {
        state,
        base_listener,
        pool_listeners,
        shutdown_tx,
        background_tasks: JoinSet::new(),
    })
}

/// Logs key configuration parameters at startup.
fn log_startup_info(config: &Config) {
    info!(
        host = %config.host,
        port = config.port,
        workers = config.worker_count,
        "starting hivecache"
    );
    if config.admin.is_none() && !crate::core::admin::admin_auth_disabled() {
        warn!("no [admin] user configured; CREATE_BUCKET/DELETE_BUCKET/LIST_BUCKETS/SELECT_BUCKET will always be refused");
    }
}
