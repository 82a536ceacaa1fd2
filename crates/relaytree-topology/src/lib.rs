//! relaytree topology - Broadcast tree construction and relay selection
//!
//! This crate provides:
//! - On-demand tree views over a channel's peers ([`build_tree`])
//! - Capacity-bounded upstream selection ([`choose_upstream`])
//! - Subtree link collection for teardown ([`collect_subtree_links`])
//! - Population snapshots read from a [`relaytree_registry::Registry`]
//!
//! Everything here is a pure function over a snapshot except
//! [`Population::load`].

pub mod config;
pub mod snapshot;
pub mod subtree;
pub mod tree;
pub mod upstream;

pub use config::*;
pub use snapshot::*;
pub use subtree::*;
pub use tree::*;
pub use upstream::*;
