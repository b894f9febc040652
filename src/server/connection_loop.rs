// src/server/connection_loop.rs

//! The main server loop: one accept loop per bound listener (the base
//! listener plus one per bootstrap pool, §2's "two parallel listener
//! modes"), each spawning a `ConnectionHandler` per accepted socket, with
//! graceful shutdown on SIGINT/SIGTERM.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use super::context::ServerContext;
use crate::connection::{ConnectionHandler, ListenerRole};
use crate::core::proxy::pool::Pool;
use crate::core::state::AppState;

#[cfg(windows)]
use tokio::signal;
#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

/// Waits for a shutdown signal based on the operating system. On Unix,
/// listens for SIGINT and SIGTERM; on Windows, Ctrl+C.
async fn await_shutdown_signal() {
    #[cfg(unix)]
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    #[cfg(unix)]
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

    #[cfg(windows)]
    let mut ctrl_c = signal::ctrl_c().expect("failed to install Ctrl+C handler");

    tokio::select! {
        _ = async { #[cfg(unix)] { sigint.recv().await; info!("SIGINT received, shutting down."); } } => {},
        _ = async { #[cfg(unix)] { sigterm.recv().await; info!("SIGTERM received, shutting down."); } } => {},
        _ = async { #[cfg(windows)] { ctrl_c.await; info!("Ctrl-C received, shutting down."); } } => {},
    }
}

/// Accepts connections on `listener` forever, spawning a detached
/// `ConnectionHandler` per socket. Each handler tears itself down via
/// `ConnectionGuard` however it exits, so this loop never needs to track
/// per-connection task handles.
async fn accept_loop(listener: TcpListener, state: Arc<AppState>, role_for: impl Fn() -> ListenerRole + Send + 'static) {
    loop {
        match listener.accept().await {
            Ok((socket, addr)) => {
                let state = state.clone();
                let role = role_for();
                tokio::spawn(async move {
                    ConnectionHandler::new(socket, addr, state, role).run().await;
                });
            }
            Err(e) => {
                error!(error = %e, "failed to accept connection");
            }
        }
    }
}

/// The main server loop that accepts connections and handles graceful
/// shutdown.
pub async fn run(mut ctx: ServerContext) {
    let mut listener_tasks: JoinSet<()> = JoinSet::new();

    let base_state = ctx.state.clone();
    listener_tasks.spawn(accept_loop(ctx.base_listener, base_state, || ListenerRole::Base));
    info!("base listener accepting connections");

    for (pool, listener) in ctx.pool_listeners {
        let pool_state = ctx.state.clone();
        let pool_for_role: Arc<Pool> = pool.clone();
        listener_tasks.spawn(accept_loop(listener, pool_state, move || {
            ListenerRole::Pool(pool_for_role.clone())
        }));
        info!(pool = %pool.name, port = pool.port, "pool listener accepting connections");
    }

    loop {
        tokio::select! {
            biased;

            _ = await_shutdown_signal() => {
                break;
            },

            Some(res) = ctx.background_tasks.join_next() => {
                match res {
                    Ok(Ok(())) => info!("a background task completed"),
                    Ok(Err(e)) => { error!("background task failed: {e}; shutting down"); break; }
                    Err(e) => { error!("background task panicked: {e:?}; shutting down"); break; }
                }
            },

            Some(res) = listener_tasks.join_next() => {
                if let Err(e) = res {
                    if e.is_panic() {
                        error!("a listener accept loop panicked: {e:?}");
                    }
                }
            },
        }
    }

    info!("shutting down; signaling background tasks");
    if ctx.shutdown_tx.send(()).is_err() {
        warn!("no background task was listening for the shutdown signal");
    }

    listener_tasks.shutdown().await;
    info!("all listeners closed");

    if tokio::time::timeout(Duration::from_secs(10), async {
        while ctx.background_tasks.join_next().await.is_some() {}
    })
    .await
    .is_err()
    {
        warn!("timed out waiting for background tasks to finish cleanly");
    }
    info!("server shutdown complete");
}
