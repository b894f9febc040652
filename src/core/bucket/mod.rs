// src/core/bucket/mod.rs

//! The bucket engine: a process-wide registry of isolated cache engine
//! instances, each reference-counted and carrying its own four-state
//! lifecycle.

pub mod cookie;
pub mod engine;
pub mod handle;
pub mod registry;

pub use cookie::ConnectionCookie;
pub use engine::{EngineOps, EngineStats};
pub use handle::{BucketHandle, BucketState, CallGuard};
pub use registry::BucketRegistry;
