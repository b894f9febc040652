// src/connection/guard.rs

//! Defines `ConnectionGuard`, an RAII guard for connection resource management.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::debug;

use crate::core::bucket::cookie::ConnectionCookie;
use crate::core::metrics;
use crate::core::state::AppState;

/// An RAII guard ensuring a connection's resources are always released when
/// its handler task exits, however it exits: removes the session from the
/// shared client map, decrements the connected-clients gauge, and releases
/// any bucket handle the connection had SELECT_BUCKET-attached (§3, §4.I's
/// `release` contract applies here exactly as it does to an explicit
/// DELETE_BUCKET caller).
pub struct ConnectionGuard {
    state: Arc<AppState>,
    session_id: u64,
    addr: SocketAddr,
    cookie: Arc<ConnectionCookie>,
}

impl ConnectionGuard {
    pub fn new(state: Arc<AppState>, session_id: u64, addr: SocketAddr, cookie: Arc<ConnectionCookie>) -> Self {
        Self {
            state,
            session_id,
            addr,
            cookie,
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        metrics::CONNECTED_CLIENTS.dec();
        debug!(addr = %self.addr, session = self.session_id, "connection closed, releasing resources");

        self.state.clients.remove(&self.session_id);

        if let Some(handle) = self.cookie.detach_bucket() {
            handle.release();
        }
    }
}
