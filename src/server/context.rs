// src/server/context.rs

//! Holds all the initialized state required to run the server's main loop.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinSet;

use crate::core::proxy::pool::Pool;
use crate::core::state::AppState;

/// Everything `initialization::setup` builds and `spawner::spawn_all` /
/// `connection_loop::run` consume: the shared process state, the bound base
/// listener, one bound listener per bootstrap pool (§4.G/§4.K "attach a new
/// listener"), the shutdown broadcast, and the set of long-running
/// background tasks (currently just the metrics server).
pub struct ServerContext {
    pub state: Arc<AppState>,
    pub base_listener: TcpListener,
    pub pool_listeners: Vec<(Arc<Pool>, TcpListener)>,
    pub shutdown_tx: broadcast::Sender<()>,
    pub background_tasks: JoinSet<Result<(), anyhow::Error>>,
}
