// src/core/proxy/downstream/mod.rs

//! The downstream side of the proxy core: a per-pool connection set (D)
//! and the reservation lifecycle drawn against it (E).

pub mod conn_set;
pub mod reservation;

pub use conn_set::{ConnState, DownstreamConnSet, ServerBehavior};
pub use reservation::{DownstreamReservation, OpKind};
