//! relaytree signal - Relay link lifecycle and negotiation plumbing
//!
//! This crate provides:
//! - [`ConnectionStateMachine`]: reservation, monotonic transitions with
//!   compare-and-swap, and link removal
//! - [`SignalingRelay`]: opaque offer/answer/candidate forwarding
//! - [`LinkTask`]: a supervising task per link that abandons stalled
//!   negotiations

pub mod machine;
pub mod negotiation;
pub mod relay;

pub use machine::*;
pub use negotiation::*;
pub use relay::*;
