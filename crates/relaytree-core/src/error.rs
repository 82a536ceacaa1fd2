//! Error types for relay-tree coordination

use thiserror::Error;

use crate::{ChannelId, LinkId, LinkState, PeerId, SessionId};

/// Core relay-tree errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    // Lookup errors
    #[error("Peer not found: {0}")]
    PeerNotFound(PeerId),

    #[error("Link not found: {0}")]
    LinkNotFound(LinkId),

    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),

    // Authorization errors
    #[error("Peer {peer} is not a party to link {link}")]
    NotLinkParty { peer: PeerId, link: LinkId },

    #[error("Peer {peer} is not owned by session {session}")]
    NotSessionOwner { peer: PeerId, session: SessionId },

    #[error("Channel {channel} already has broadcaster {broadcaster}")]
    BroadcasterTaken { channel: ChannelId, broadcaster: PeerId },

    // Topology errors
    #[error("No upstream slot available in channel {0}")]
    NoCapacity(ChannelId),

    #[error("Channel {0} has no broadcaster")]
    NoRoot(ChannelId),

    // Concurrency errors
    #[error("Concurrent update conflict: {0}")]
    Conflict(String),

    // State machine errors
    #[error("Invalid transition on link {link} from {from}: {reason}")]
    InvalidTransition {
        link: LinkId,
        from: LinkState,
        reason: &'static str,
    },

    #[error("Unknown link state: {0}")]
    UnknownState(String),

    #[error("Invalid link: {0}")]
    InvalidLink(String),

    // Registry / storage errors
    #[error("Internal failure: {0}")]
    Internal(String),
}

/// Classification of a [`RelayError`] for the application layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    Forbidden,
    NoCapacity,
    NoRoot,
    Conflict,
    InvalidTransition,
    InternalFailure,
}

impl RelayError {
    /// Get the error classification
    pub fn kind(&self) -> ErrorKind {
        match self {
            RelayError::PeerNotFound(_)
            | RelayError::LinkNotFound(_)
            | RelayError::SessionNotFound(_) => ErrorKind::NotFound,
            RelayError::NotLinkParty { .. }
            | RelayError::NotSessionOwner { .. }
            | RelayError::BroadcasterTaken { .. } => ErrorKind::Forbidden,
            RelayError::NoCapacity(_) => ErrorKind::NoCapacity,
            RelayError::NoRoot(_) => ErrorKind::NoRoot,
            RelayError::Conflict(_) => ErrorKind::Conflict,
            RelayError::InvalidTransition { .. }
            | RelayError::UnknownState(_)
            | RelayError::InvalidLink(_) => ErrorKind::InvalidTransition,
            RelayError::Internal(_) => ErrorKind::InternalFailure,
        }
    }

    /// Whether the caller may retry the whole operation later
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Conflict | ErrorKind::NoCapacity)
    }

    /// Whether this is a conflict from an optimistic update
    pub fn is_conflict(&self) -> bool {
        self.kind() == ErrorKind::Conflict
    }
}

/// Result type for relay-tree operations
pub type RelayResult<T> = Result<T, RelayError>;
