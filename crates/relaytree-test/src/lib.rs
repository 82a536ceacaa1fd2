//! relaytree test harness - Simulated clients and end-to-end scenarios
//!
//! This crate provides:
//! - Simulated clients that negotiate like real ones
//! - Channel scenarios with invariant checking
//! - Seeded join/leave churn

pub mod harness;
pub mod scenarios;

pub use harness::*;
pub use scenarios::*;
