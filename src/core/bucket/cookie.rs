// src/core/bucket/cookie.rs

//! The Per-Connection Context (§3): a small structure the host stores
//! behind a cookie holding the connection's current bucket handle, the
//! engine's own opaque state, a reservation counter for reservations held
//! across async work, and a disconnect-while-reserved flag.
//!
//! Generalized from the teacher's `ClientInfo`/`ClientMap` shape
//! (`core/state/client.rs`).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::RwLock;

use crate::core::bucket::handle::BucketHandle;

/// Per-connection context attached to every upstream connection.
pub struct ConnectionCookie {
    current_bucket: RwLock<Option<Arc<BucketHandle>>>,
    reservations_held: AtomicU32,
    disconnect_while_reserved: AtomicBool,
}

impl Default for ConnectionCookie {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionCookie {
    pub fn new() -> Self {
        Self {
            current_bucket: RwLock::new(None),
            reservations_held: AtomicU32::new(0),
            disconnect_while_reserved: AtomicBool::new(false),
        }
    }

    pub fn current_bucket(&self) -> Option<Arc<BucketHandle>> {
        self.current_bucket.read().clone()
    }

    pub fn select_bucket(&self, handle: Option<Arc<BucketHandle>>) {
        *self.current_bucket.write() = handle;
    }

    /// Detaches the connection's own reference to its bucket before the
    /// registry releases its reference, avoiding the self-reference cycle
    /// called out in §4.J when the caller deleting a bucket is the
    /// connection currently attached to it.
    pub fn detach_bucket(&self) -> Option<Arc<BucketHandle>> {
        self.current_bucket.write().take()
    }

    pub fn enter_reservation(&self) {
        self.reservations_held.fetch_add(1, Ordering::SeqCst);
    }

    pub fn leave_reservation(&self) {
        self.reservations_held.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn reservations_held(&self) -> u32 {
        self.reservations_held.load(Ordering::SeqCst)
    }

    pub fn mark_disconnect_while_reserved(&self) {
        self.disconnect_while_reserved.store(true, Ordering::SeqCst);
    }

    pub fn disconnected_while_reserved(&self) -> bool {
        self.disconnect_while_reserved.load(Ordering::SeqCst)
    }
}
