//! relaytree core - Fundamental records and primitives
//!
//! This crate defines the types shared by every relay-tree component:
//! - Identifiers (PeerId, LinkId, ChannelId, SessionId)
//! - Peer and relay-link records, link states and filters
//! - Notifications published to transport sessions
//! - The error taxonomy

pub mod error;
pub mod event;
pub mod id;
pub mod link;
pub mod peer;

pub use error::*;
pub use event::*;
pub use id::*;
pub use link::*;
pub use peer::*;

/// Maximum number of simultaneous child links per peer
pub const DEFAULT_FANOUT: usize = 2;
