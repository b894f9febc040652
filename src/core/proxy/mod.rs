// src/core/proxy/mod.rs

//! The moxi-style proxy core (§4 A-K minus the bucket engine subsystem,
//! which lives in `core::bucket`): server selection, front caching, multiget
//! de-duplication, the downstream connection set and reservation lifecycle,
//! per-worker proxy data, pools, the proxy's top-level listener management,
//! the management-channel document model, and the reconfiguration pipeline
//! that ties them together.

pub mod config_doc;
pub mod downstream;
pub mod front_cache;
pub mod multiget;
pub mod pool;
pub mod proxy_main;
pub mod ptd;
pub mod reconfig;
pub mod selector;

pub use downstream::{ConnState, DownstreamConnSet, DownstreamReservation, OpKind, ServerBehavior};
pub use front_cache::{AdmissionMatcher, FrontCache};
pub use multiget::MultigetMap;
pub use pool::Pool;
pub use proxy_main::ProxyMain;
pub use ptd::ProxyThreadData;
pub use selector::{NodeLocator, RoutingTable, ServerSelector};
