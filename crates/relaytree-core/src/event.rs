//! Notification definitions
//!
//! Notifications are fire-and-forget messages delivered to subscribed
//! transport sessions. They describe link lifecycle changes and carry relayed
//! negotiation payloads.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{LinkId, LinkState, MessageKind, PeerConnection, PeerId};

/// Notification delivered to a transport session
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verb", rename_all = "snake_case")]
pub enum Notification {
    /// A link was reserved
    LinkCreated { link: PeerConnection },
    /// A link moved to a new state
    LinkUpdated {
        link: LinkId,
        state: LinkState,
        previous: LinkState,
    },
    /// A link was removed; carries its last known record
    LinkDestroyed { link: LinkId, previous: PeerConnection },
    /// A negotiation payload relayed from the other party
    LinkMessage {
        link: LinkId,
        from: PeerId,
        kind: MessageKind,
        payload: Bytes,
    },
    /// A link reference was added to a peer's link set
    PeerLinkAdded { peer: PeerId, link: LinkId },
    /// A link reference was removed from a peer's link set
    PeerLinkRemoved { peer: PeerId, link: LinkId },
    /// A peer left its channel
    PeerDestroyed { peer: PeerId },
}

impl Notification {
    /// Link this notification concerns, if any
    pub fn link(&self) -> Option<LinkId> {
        match self {
            Notification::LinkCreated { link } => Some(link.id),
            Notification::LinkUpdated { link, .. }
            | Notification::LinkDestroyed { link, .. }
            | Notification::LinkMessage { link, .. }
            | Notification::PeerLinkAdded { link, .. }
            | Notification::PeerLinkRemoved { link, .. } => Some(*link),
            Notification::PeerDestroyed { .. } => None,
        }
    }

    pub fn verb(&self) -> &'static str {
        match self {
            Notification::LinkCreated { .. } => "link_created",
            Notification::LinkUpdated { .. } => "link_updated",
            Notification::LinkDestroyed { .. } => "link_destroyed",
            Notification::LinkMessage { .. } => "link_message",
            Notification::PeerLinkAdded { .. } => "peer_link_added",
            Notification::PeerLinkRemoved { .. } => "peer_link_removed",
            Notification::PeerDestroyed { .. } => "peer_destroyed",
        }
    }
}
