// src/core/state/mod.rs

//! Process-wide shared state (§4.H): the bucket registry, the proxy's set
//! of pools, the reconfiguration pipeline, and the bookkeeping the
//! connection layer needs (client map, stats), generalized from the
//! teacher's `ServerState` (`core/state/core.rs`) from "one shared keyspace
//! plus one cluster/replication/ACL stack" down to "one bucket registry
//! plus one proxy main," which is all spec.md's host process actually owns.

mod client;
mod core;
mod stats;

pub use client::*;
pub use core::{AppState, LogReloadHandle};
pub use stats::StatsState;
