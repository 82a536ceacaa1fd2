//! Registry contract
//!
//! The registry is the durable store of peers and relay links. It is owned by
//! the surrounding application; the coordination core only relies on the
//! operations below. Every call is a suspension point.
//!
//! Updates are atomic per entity:
//! - link updates are compare-and-swap on `version`
//! - peer link-set updates are applied as deltas under the store's own
//!   serialization, so concurrent additions never overwrite each other

use std::collections::BTreeSet;

use async_trait::async_trait;

use relaytree_core::{
    ChannelId, LinkFilter, LinkId, LinkState, Peer, PeerConnection, PeerId, RelayResult,
    SessionId,
};

/// Criteria for peer lookups; unset fields match anything
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PeerCriteria {
    pub id: Option<PeerId>,
    pub channel: Option<ChannelId>,
    pub session: Option<SessionId>,
    pub broadcaster: Option<bool>,
}

impl PeerCriteria {
    pub fn by_id(id: PeerId) -> Self {
        Self {
            id: Some(id),
            ..Default::default()
        }
    }

    pub fn in_channel(channel: ChannelId) -> Self {
        Self {
            channel: Some(channel),
            ..Default::default()
        }
    }

    pub fn broadcaster_of(channel: ChannelId) -> Self {
        Self {
            channel: Some(channel),
            broadcaster: Some(true),
            ..Default::default()
        }
    }

    pub fn owned_by(session: SessionId) -> Self {
        Self {
            session: Some(session),
            ..Default::default()
        }
    }

    pub fn with_session(mut self, session: SessionId) -> Self {
        self.session = Some(session);
        self
    }

    pub fn matches(&self, peer: &Peer) -> bool {
        self.id.map_or(true, |id| peer.id == id)
            && self.channel.map_or(true, |c| peer.channel == c)
            && self.session.map_or(true, |s| peer.session == s)
            && self.broadcaster.map_or(true, |b| peer.broadcaster == b)
    }
}

/// Attributes for a new peer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewPeer {
    pub channel: ChannelId,
    pub session: SessionId,
    pub broadcaster: bool,
}

/// Atomic update applied to one peer
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PeerUpdate {
    pub broadcaster: Option<bool>,
    /// Link references to add to the peer's link set
    pub add_links: Vec<LinkId>,
    /// Link references to remove from the peer's link set
    pub remove_links: Vec<LinkId>,
    /// Reject with `Conflict` unless the stored version matches
    pub expected_version: Option<u64>,
    /// Reject with `Conflict` if, after the update, the peer would be the
    /// endpoint of more than this many links
    pub child_limit: Option<usize>,
}

impl PeerUpdate {
    pub fn add_link(link: LinkId) -> Self {
        Self {
            add_links: vec![link],
            ..Default::default()
        }
    }

    pub fn remove_link(link: LinkId) -> Self {
        Self {
            remove_links: vec![link],
            ..Default::default()
        }
    }

    pub fn set_broadcaster(broadcaster: bool) -> Self {
        Self {
            broadcaster: Some(broadcaster),
            ..Default::default()
        }
    }

    pub fn with_child_limit(mut self, limit: usize) -> Self {
        self.child_limit = Some(limit);
        self
    }

    pub fn expecting(mut self, version: u64) -> Self {
        self.expected_version = Some(version);
        self
    }
}

/// Criteria for link lookups; unset fields match anything
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectionCriteria {
    pub id: Option<LinkId>,
    pub channel: Option<ChannelId>,
    /// Either side of the link
    pub peer: Option<PeerId>,
    pub initiator: Option<PeerId>,
    pub endpoint: Option<PeerId>,
    pub state: Option<LinkFilter>,
}

impl ConnectionCriteria {
    pub fn by_id(id: LinkId) -> Self {
        Self {
            id: Some(id),
            ..Default::default()
        }
    }

    pub fn involving(peer: PeerId) -> Self {
        Self {
            peer: Some(peer),
            ..Default::default()
        }
    }

    pub fn children_of(peer: PeerId) -> Self {
        Self {
            endpoint: Some(peer),
            ..Default::default()
        }
    }

    pub fn parents_of(peer: PeerId) -> Self {
        Self {
            initiator: Some(peer),
            ..Default::default()
        }
    }

    pub fn in_state(mut self, filter: LinkFilter) -> Self {
        self.state = Some(filter);
        self
    }

    pub fn matches(&self, link: &PeerConnection) -> bool {
        self.id.map_or(true, |id| link.id == id)
            && self.channel.map_or(true, |c| link.channel == c)
            && self.peer.map_or(true, |p| link.involves(p))
            && self.initiator.map_or(true, |p| link.initiator == p)
            && self.endpoint.map_or(true, |p| link.endpoint == p)
            && self.state.map_or(true, |f| f.matches(link.state))
    }
}

/// Attributes for a new link
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewConnection {
    pub channel: ChannelId,
    pub initiator: PeerId,
    pub endpoint: PeerId,
    pub state: LinkState,
}

/// Compare-and-swap state update for one link
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnectionUpdate {
    pub state: LinkState,
    /// Reject with `Conflict` unless the stored version matches
    pub expected_version: u64,
}

/// Durable peer / link store consumed by the coordination core
#[async_trait]
pub trait Registry: Send + Sync {
    async fn find_peer(&self, criteria: &PeerCriteria) -> RelayResult<Option<Peer>>;

    async fn find_peers(&self, criteria: &PeerCriteria) -> RelayResult<Vec<Peer>>;

    async fn create_peer(&self, attrs: NewPeer) -> RelayResult<Peer>;

    /// Apply an atomic update; fails with `PeerNotFound` or `Conflict`
    async fn update_peer(&self, id: PeerId, update: PeerUpdate) -> RelayResult<Peer>;

    /// Delete a peer record. Fails with `Conflict` while the peer still holds
    /// link references.
    async fn delete_peer(&self, id: PeerId) -> RelayResult<Peer>;

    async fn find_connection(
        &self,
        criteria: &ConnectionCriteria,
    ) -> RelayResult<Option<PeerConnection>>;

    async fn find_connections(
        &self,
        criteria: &ConnectionCriteria,
    ) -> RelayResult<Vec<PeerConnection>>;

    async fn create_connection(&self, attrs: NewConnection) -> RelayResult<PeerConnection>;

    /// Compare-and-swap a link's state; fails with `Conflict` on a version
    /// mismatch and `InvalidTransition` on a backward move
    async fn update_connection(
        &self,
        id: LinkId,
        update: ConnectionUpdate,
    ) -> RelayResult<PeerConnection>;

    /// Delete every listed link as one batch and strip their references from
    /// all peers. An empty set is a no-op. Returns the deleted records; ids
    /// that no longer exist are skipped.
    async fn delete_connections(&self, ids: &BTreeSet<LinkId>) -> RelayResult<Vec<PeerConnection>>;

    /// Delete one link only while it is still at `expected_version`. Returns
    /// `None` if the link is gone; fails with `Conflict` on a version
    /// mismatch.
    async fn delete_connection_at(
        &self,
        id: LinkId,
        expected_version: u64,
    ) -> RelayResult<Option<PeerConnection>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(id: u64, channel: u64, broadcaster: bool) -> Peer {
        Peer {
            id: PeerId::new(id),
            channel: ChannelId::new(channel),
            session: SessionId::new(id * 100),
            broadcaster,
            links: BTreeSet::new(),
            version: 0,
        }
    }

    #[test]
    fn test_peer_criteria() {
        let b = peer(1, 7, true);
        let v = peer(2, 7, false);

        let crit = PeerCriteria::broadcaster_of(ChannelId::new(7));
        assert!(crit.matches(&b));
        assert!(!crit.matches(&v));

        assert!(PeerCriteria::default().matches(&v));
        assert!(PeerCriteria::owned_by(SessionId::new(200)).matches(&v));
        assert!(!PeerCriteria::in_channel(ChannelId::new(8)).matches(&v));
    }

    #[test]
    fn test_connection_criteria() {
        let link = PeerConnection {
            id: LinkId::new(1),
            channel: ChannelId::new(7),
            state: LinkState::Connecting,
            initiator: PeerId::new(2),
            endpoint: PeerId::new(1),
            version: 3,
        };

        assert!(ConnectionCriteria::involving(PeerId::new(1)).matches(&link));
        assert!(ConnectionCriteria::involving(PeerId::new(2)).matches(&link));
        assert!(ConnectionCriteria::children_of(PeerId::new(1)).matches(&link));
        assert!(!ConnectionCriteria::children_of(PeerId::new(2)).matches(&link));
        assert!(!ConnectionCriteria::parents_of(PeerId::new(1))
            .in_state(LinkFilter::default())
            .matches(&link));
        assert!(ConnectionCriteria::parents_of(PeerId::new(2))
            .in_state(LinkFilter::InProgress)
            .matches(&link));
    }
}
