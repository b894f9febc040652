// src/connection/mod.rs

//! Manages the lifecycle of a single upstream TCP connection, including
//! protocol framing, command dispatch, and session state management.

// Declare the private sub-modules of the `connection` module.
mod guard;
mod handler;
mod session;

// Publicly re-export the primary types from the sub-modules.
// This creates a clean public API for the `connection` module, hiding the
// internal file structure from the rest of the crate.
pub use guard::ConnectionGuard;
pub use handler::{ConnectionHandler, ListenerRole};
pub use session::SessionState;
