// src/connection/session.rs

//! Defines the state associated with a single upstream connection.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::core::admin::AdminAuthState;
use crate::core::bucket::cookie::ConnectionCookie;
use crate::core::protocol::WireProtocol;

/// Per-connection state: which wire protocol this connection was sniffed
/// as speaking, its admin-SASL authentication state, and its bucket cookie
/// (§3) — the bucket handle it has SELECT_BUCKET-attached, if any.
pub struct SessionState {
    pub session_id: u64,
    pub addr: SocketAddr,
    pub protocol: WireProtocol,
    pub admin_auth: AdminAuthState,
    pub cookie: Arc<ConnectionCookie>,
}

impl SessionState {
    pub fn new(session_id: u64, addr: SocketAddr, protocol: WireProtocol) -> Self {
        Self {
            session_id,
            addr,
            protocol,
            admin_auth: AdminAuthState::default(),
            cookie: Arc::new(ConnectionCookie::new()),
        }
    }
}
