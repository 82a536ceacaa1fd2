//! Peer records
//!
//! A peer is a channel member. It becomes part of the tree only once a link
//! references it; the channel's broadcaster is the implicit root.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::{ChannelId, LinkFilter, LinkId, LinkState, PeerConnection, PeerId, SessionId};

/// Peer record as stored by the registry
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub id: PeerId,
    pub channel: ChannelId,
    /// Transport session that owns this peer
    pub session: SessionId,
    /// Originates media for the channel (tree root)
    pub broadcaster: bool,
    /// References to every link this peer is a party to
    pub links: BTreeSet<LinkId>,
    /// Bumped on every stored update
    pub version: u64,
}

impl Peer {
    #[inline]
    pub fn has_link(&self, link: LinkId) -> bool {
        self.links.contains(&link)
    }
}

/// A peer together with its resolved link records
///
/// This is the unit the topology functions operate on; it is a snapshot and
/// may be stale relative to the registry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerNode {
    pub peer: Peer,
    pub links: Vec<PeerConnection>,
}

impl PeerNode {
    pub fn new(peer: Peer, links: Vec<PeerConnection>) -> Self {
        Self { peer, links }
    }

    #[inline]
    pub fn id(&self) -> PeerId {
        self.peer.id
    }

    #[inline]
    pub fn channel(&self) -> ChannelId {
        self.peer.channel
    }

    /// Links on which this peer is the parent
    pub fn child_links(&self, filter: LinkFilter) -> impl Iterator<Item = &PeerConnection> {
        let id = self.peer.id;
        self.links
            .iter()
            .filter(move |l| l.is_child_link_of(id) && filter.matches(l.state))
    }

    /// Links on which this peer is the child
    pub fn parent_links(&self, filter: LinkFilter) -> impl Iterator<Item = &PeerConnection> {
        let id = self.peer.id;
        self.links
            .iter()
            .filter(move |l| l.is_parent_link_of(id) && filter.matches(l.state))
    }

    /// Does this peer hold a link matching `filter` whose parent is `parent`?
    pub fn has_parent_link_to(&self, parent: PeerId, filter: LinkFilter) -> bool {
        self.parent_links(filter).any(|l| l.endpoint == parent)
    }

    /// A peer can relay media if it is the broadcaster or is fed by an
    /// established upstream link.
    pub fn can_rebroadcast(&self) -> bool {
        self.peer.broadcaster
            || self
                .parent_links(LinkFilter::Only(LinkState::Established))
                .next()
                .is_some()
    }
}
