// src/server/spawner.rs

//! Spawns the server's long-running background tasks. The only one the
//! transformed core owns outright is the optional Prometheus metrics server;
//! the bucket teardown and engine-shutdown followup tasks of §5 are spawned
//! on demand by the bucket registry itself rather than up front here.

use anyhow::Result;
use tracing::info;

use super::context::ServerContext;
use super::metrics_server;

/// Spawns all background tasks into the provided JoinSet.
pub async fn spawn_all(ctx: &mut ServerContext) -> Result<()> {
    let state = ctx.state.clone();
    let background_tasks = &mut ctx.background_tasks;

    if state.config.metrics.enabled {
        let metrics_state = state.clone();
        let shutdown_rx = ctx.shutdown_tx.subscribe();
        let port = state.config.metrics.port;
        background_tasks.spawn(async move {
            metrics_server::run_metrics_server(metrics_state, port, shutdown_rx).await;
            Ok(())
        });
    } else {
        info!("Prometheus metrics server is disabled in the configuration.");
    }

    info!("All background tasks have been spawned.");
    Ok(())
}
