//! relaytree runtime - Coordination service for bounded-fanout relay trees
//!
//! This crate provides:
//! - [`Coordinator`]: join, negotiation relay, finalize, leave and link
//!   destruction for many concurrent peers
//! - [`TransportSession`]: per-client handle with ownership checks and a
//!   notification queue
//! - [`TeardownReconciler`]: subtree cleanup before a peer is removed
//! - Configuration and logging setup

pub mod config;
pub mod coordinator;
pub mod logging;
pub mod reconcile;
pub mod session;

pub use config::*;
pub use coordinator::*;
pub use logging::*;
pub use reconcile::*;
pub use session::*;
