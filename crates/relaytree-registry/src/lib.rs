//! relaytree registry - Peer/link storage contract and session pub/sub
//!
//! This crate provides:
//! - The [`Registry`] contract the coordination core consumes
//! - [`MemoryRegistry`], a single-process implementation with per-entity
//!   atomic updates
//! - [`SignalHub`], fire-and-forget notification delivery to transport
//!   sessions

pub mod hub;
pub mod memory;
pub mod store;

pub use hub::*;
pub use memory::*;
pub use store::*;
