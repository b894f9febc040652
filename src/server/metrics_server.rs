// src/server/metrics_server.rs

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{Router, http::StatusCode, response::IntoResponse, routing::get};
use tokio::sync::broadcast;
use tracing::{error, info};

use crate::core::metrics::gather_metrics;
use crate::core::state::AppState;

/// Handles HTTP requests to the /metrics endpoint, encoding every registered
/// counter/gauge/histogram in the Prometheus text format. The gauges
/// themselves (`BUCKETS_RUNNING`, `POOLS_ACTIVE`, `CONNECTED_CLIENTS`, ...)
/// are kept current in place by the bucket registry, proxy main, and
/// connection guard as state changes, so nothing needs updating here before
/// gathering.
async fn metrics_handler() -> impl IntoResponse {
    let body = gather_metrics();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        body,
    )
}

/// Runs a simple HTTP server exposing Prometheus metrics on /metrics.
pub async fn run_metrics_server(_state: Arc<AppState>, port: u16, mut shutdown_rx: broadcast::Receiver<()>) {
    let app = Router::new().route("/metrics", get(metrics_handler));

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Prometheus metrics server listening on http://{}/metrics", addr);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind metrics server on port {}: {}", port, e);
            return;
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_rx.recv().await.ok();
            info!("Metrics server shutting down.");
        })
        .await
        .unwrap();
}
