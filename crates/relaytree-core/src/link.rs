//! Relay link records
//!
//! A relay link (peer connection) is a directed bookkeeping record between a
//! downstream `initiator` (the child that asked for the link) and an upstream
//! `endpoint` (the parent chosen for it). Media flows both ways once the link
//! is established; the direction only matters for tree construction.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{ChannelId, LinkId, PeerId, RelayError};

/// Lifecycle state of a relay link
///
/// States are ordered; a link only ever moves forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    /// Slot reserved, no negotiation message seen yet
    Reserved,
    /// Negotiation messages are flowing
    Connecting,
    /// Endpoint (parent) side finalized first
    InitEstablished,
    /// Initiator (child) side finalized first
    RecvEstablished,
    /// Both sides finalized
    Established,
}

impl LinkState {
    pub const ALL: [LinkState; 5] = [
        LinkState::Reserved,
        LinkState::Connecting,
        LinkState::InitEstablished,
        LinkState::RecvEstablished,
        LinkState::Established,
    ];

    /// Position in the forward order
    ///
    /// The two half-established states share a rank: neither follows the other.
    #[inline]
    pub fn rank(self) -> u8 {
        match self {
            LinkState::Reserved => 0,
            LinkState::Connecting => 1,
            LinkState::InitEstablished | LinkState::RecvEstablished => 2,
            LinkState::Established => 3,
        }
    }

    /// Check whether moving to `next` is a forward step the state machine allows
    pub fn can_advance_to(self, next: LinkState) -> bool {
        matches!(
            (self, next),
            (LinkState::Reserved, LinkState::Connecting)
                | (LinkState::Connecting, LinkState::InitEstablished)
                | (LinkState::Connecting, LinkState::RecvEstablished)
                | (LinkState::InitEstablished, LinkState::Established)
                | (LinkState::RecvEstablished, LinkState::Established)
        )
    }

    #[inline]
    pub fn is_established(self) -> bool {
        self == LinkState::Established
    }

    /// Reserved, connecting, or half-established
    #[inline]
    pub fn is_in_progress(self) -> bool {
        !self.is_established()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LinkState::Reserved => "reserved",
            LinkState::Connecting => "connecting",
            LinkState::InitEstablished => "init_established",
            LinkState::RecvEstablished => "recv_established",
            LinkState::Established => "established",
        }
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LinkState {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LinkState::ALL
            .iter()
            .copied()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| RelayError::UnknownState(s.to_string()))
    }
}

/// Which end of a link a peer sits on
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkSide {
    /// Downstream child that requested the link
    Initiator,
    /// Upstream parent the link was assigned to
    Endpoint,
}

/// Predicate over link state used when walking the tree
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkFilter {
    /// Every link regardless of state
    Any,
    /// Links in exactly this state
    Only(LinkState),
    /// Links that have not reached `established`
    InProgress,
}

impl LinkFilter {
    #[inline]
    pub fn matches(&self, state: LinkState) -> bool {
        match self {
            LinkFilter::Any => true,
            LinkFilter::Only(wanted) => *wanted == state,
            LinkFilter::InProgress => state.is_in_progress(),
        }
    }
}

impl Default for LinkFilter {
    fn default() -> Self {
        LinkFilter::Only(LinkState::Established)
    }
}

/// Relay link record
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConnection {
    pub id: LinkId,
    /// Channel whose tree this link belongs to
    pub channel: ChannelId,
    pub state: LinkState,
    /// Child / downstream peer
    pub initiator: PeerId,
    /// Parent / upstream peer
    pub endpoint: PeerId,
    /// Bumped on every stored update, used for compare-and-swap
    pub version: u64,
}

impl PeerConnection {
    /// Which side `peer` is on, if any
    pub fn side_of(&self, peer: PeerId) -> Option<LinkSide> {
        if peer == self.initiator {
            Some(LinkSide::Initiator)
        } else if peer == self.endpoint {
            Some(LinkSide::Endpoint)
        } else {
            None
        }
    }

    #[inline]
    pub fn involves(&self, peer: PeerId) -> bool {
        self.side_of(peer).is_some()
    }

    /// The peer on the other end from `local`
    pub fn opposite(&self, local: PeerId) -> Option<PeerId> {
        match self.side_of(local)? {
            LinkSide::Initiator => Some(self.endpoint),
            LinkSide::Endpoint => Some(self.initiator),
        }
    }

    /// Is `peer` the parent on this link?
    #[inline]
    pub fn is_child_link_of(&self, peer: PeerId) -> bool {
        self.endpoint == peer
    }

    /// Is `peer` the child on this link?
    #[inline]
    pub fn is_parent_link_of(&self, peer: PeerId) -> bool {
        self.initiator == peer
    }
}

/// Negotiation message kind; content is never interpreted here
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Offer,
    Answer,
    Candidate,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Offer => "offer",
            MessageKind::Answer => "answer",
            MessageKind::Candidate => "candidate",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "offer" => Ok(MessageKind::Offer),
            "answer" => Ok(MessageKind::Answer),
            "candidate" | "ice" => Ok(MessageKind::Candidate),
            other => Err(RelayError::InvalidLink(format!("unknown message kind `{}`", other))),
        }
    }
}
