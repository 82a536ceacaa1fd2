//! Simulated clients and channel scenarios
//!
//! A [`SimulatedClient`] plays one connected client: it owns a transport
//! session and answers negotiation the way a real client would. A
//! [`ChannelScenario`] runs one channel with a broadcaster and any number of
//! viewers against an in-memory registry that yields at every call, so
//! concurrent operations interleave.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use bytes::Bytes;

use relaytree_core::{
    ChannelId, LinkFilter, LinkId, LinkState, MessageKind, Notification, Peer, PeerConnection,
    PeerId, RelayError, RelayResult,
};
use relaytree_registry::{ConnectionCriteria, MemoryRegistry, PeerCriteria, Registry};
use relaytree_runtime::{Coordinator, CoordinatorConfig, Joined, TransportSession};
use relaytree_topology::TreeView;

// ============================================================================
// SIMULATED CLIENT
// ============================================================================

/// One simulated client
pub struct SimulatedClient {
    session: TransportSession,
    peer: Option<Peer>,
    upstream: Option<PeerConnection>,
}

impl SimulatedClient {
    pub fn new(session: TransportSession) -> Self {
        Self {
            session,
            peer: None,
            upstream: None,
        }
    }

    pub fn session(&self) -> &TransportSession {
        &self.session
    }

    pub fn peer_id(&self) -> Option<PeerId> {
        self.peer.as_ref().map(|p| p.id)
    }

    /// Upstream link from the last join
    pub fn upstream(&self) -> Option<&PeerConnection> {
        self.upstream.as_ref()
    }

    pub async fn join(&mut self, channel: ChannelId, broadcaster: bool) -> RelayResult<Joined> {
        let joined = self.session.join(channel, broadcaster).await?;
        self.peer = Some(joined.peer.clone());
        self.upstream = joined.link.clone();
        Ok(joined)
    }

    fn me(&self) -> RelayResult<PeerId> {
        self.peer_id().ok_or(RelayError::SessionNotFound(self.session.id()))
    }

    pub async fn send(&self, link: LinkId, kind: MessageKind, payload: &'static [u8]) -> RelayResult<()> {
        self.session
            .send_negotiation_message(link, self.me()?, kind, Bytes::from_static(payload))
            .await
    }

    pub async fn finalize(&self, link: LinkId) -> RelayResult<LinkState> {
        self.session.finalize(link, self.me()?).await
    }

    pub async fn destroy(&self, link: LinkId) -> RelayResult<()> {
        self.session.destroy_link(link, self.me()?).await
    }

    pub fn drain(&mut self) -> Vec<Notification> {
        self.session.drain()
    }

    pub async fn close(self) -> RelayResult<BTreeSet<LinkId>> {
        self.session.close().await
    }
}

// ============================================================================
// CHANNEL SCENARIO
// ============================================================================

/// One channel driven end to end
pub struct ChannelScenario {
    coordinator: Coordinator,
    registry: Arc<MemoryRegistry>,
    channel: ChannelId,
    broadcaster: PeerId,
    clients: BTreeMap<PeerId, SimulatedClient>,
}

impl ChannelScenario {
    /// Start a channel with its broadcaster already joined
    pub async fn start(config: CoordinatorConfig) -> RelayResult<Self> {
        let registry = Arc::new(MemoryRegistry::with_yield_points());
        let coordinator = Coordinator::new(registry.clone(), config);
        let channel = ChannelId::new(1);

        let mut client = SimulatedClient::new(coordinator.open_session());
        let broadcaster = client.join(channel, true).await?.peer.id;

        Ok(Self {
            coordinator,
            registry,
            channel,
            broadcaster,
            clients: BTreeMap::from([(broadcaster, client)]),
        })
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    pub fn registry(&self) -> &Arc<MemoryRegistry> {
        &self.registry
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    pub fn broadcaster(&self) -> PeerId {
        self.broadcaster
    }

    pub fn client(&self, peer: PeerId) -> Option<&SimulatedClient> {
        self.clients.get(&peer)
    }

    pub fn client_mut(&mut self, peer: PeerId) -> Option<&mut SimulatedClient> {
        self.clients.get_mut(&peer)
    }

    /// Every peer with a live client, broadcaster included
    pub fn peers(&self) -> Vec<PeerId> {
        self.clients.keys().copied().collect()
    }

    /// Join a new viewer; its link is left `reserved`
    pub async fn join(&mut self) -> RelayResult<Joined> {
        let mut client = SimulatedClient::new(self.coordinator.open_session());
        let joined = client.join(self.channel, false).await?;
        self.clients.insert(joined.peer.id, client);
        Ok(joined)
    }

    /// Re-run join for an existing viewer, e.g. after its upstream vanished
    pub async fn rejoin(&mut self, peer: PeerId) -> RelayResult<Joined> {
        let channel = self.channel;
        let client = self
            .clients
            .get_mut(&peer)
            .ok_or(RelayError::PeerNotFound(peer))?;
        client.join(channel, false).await
    }

    /// Offer from the child, answer and candidate back, then both finalize
    pub async fn negotiate(&self, link: &PeerConnection) -> RelayResult<LinkState> {
        let (child, parent) = self.parties(link)?;

        child.send(link.id, MessageKind::Offer, b"offer").await?;
        parent.send(link.id, MessageKind::Answer, b"answer").await?;
        child.send(link.id, MessageKind::Candidate, b"candidate").await?;
        parent.finalize(link.id).await?;
        child.finalize(link.id).await
    }

    /// Only the offer: the link stays `connecting`
    pub async fn start_negotiation(&self, link: &PeerConnection) -> RelayResult<()> {
        let (child, _) = self.parties(link)?;
        child.send(link.id, MessageKind::Offer, b"offer").await
    }

    fn parties(&self, link: &PeerConnection) -> RelayResult<(&SimulatedClient, &SimulatedClient)> {
        let child = self
            .clients
            .get(&link.initiator)
            .ok_or(RelayError::PeerNotFound(link.initiator))?;
        let parent = self
            .clients
            .get(&link.endpoint)
            .ok_or(RelayError::PeerNotFound(link.endpoint))?;
        Ok((child, parent))
    }

    /// Join a viewer and fully establish its upstream link
    pub async fn join_established(&mut self) -> RelayResult<PeerConnection> {
        let joined = self.join().await?;
        let link = joined
            .link
            .ok_or(RelayError::NoCapacity(self.channel))?;
        self.negotiate(&link).await?;
        Ok(link)
    }

    /// Close a client's session, making its peer leave
    pub async fn leave(&mut self, peer: PeerId) -> RelayResult<BTreeSet<LinkId>> {
        let client = self
            .clients
            .remove(&peer)
            .ok_or(RelayError::PeerNotFound(peer))?;
        client.close().await
    }

    pub async fn tree(&self) -> RelayResult<TreeView> {
        self.coordinator.channel_tree(self.channel).await
    }

    /// Links currently stored for the channel
    pub async fn links(&self) -> RelayResult<Vec<PeerConnection>> {
        self.registry
            .find_connections(&ConnectionCriteria {
                channel: Some(self.channel),
                ..Default::default()
            })
            .await
    }

    /// Check the structural invariants of the stored channel
    ///
    /// Returns every violation found.
    pub async fn check_invariants(&self) -> RelayResult<Vec<String>> {
        let fanout = self.coordinator.config().topology.fanout;
        let peers: BTreeMap<PeerId, Peer> = self
            .registry
            .find_peers(&PeerCriteria::in_channel(self.channel))
            .await?
            .into_iter()
            .map(|p| (p.id, p))
            .collect();
        let links = self.links().await?;
        let link_ids: BTreeSet<LinkId> = links.iter().map(|l| l.id).collect();
        let mut violations = Vec::new();

        for link in &links {
            if link.initiator == link.endpoint {
                violations.push(format!("link {} is a self-link", link.id));
            }
            for party in [link.initiator, link.endpoint] {
                match peers.get(&party) {
                    Some(peer) if peer.has_link(link.id) => {}
                    Some(_) => violations.push(format!("peer {} does not reference link {}", party, link.id)),
                    None => violations.push(format!("link {} references missing peer {}", link.id, party)),
                }
            }
            if peers.get(&link.initiator).map_or(false, |p| p.broadcaster) {
                violations.push(format!("broadcaster initiates link {}", link.id));
            }
        }

        for peer in peers.values() {
            for link in &peer.links {
                if !link_ids.contains(link) {
                    violations.push(format!("peer {} references missing link {}", peer.id, link));
                }
            }

            let children = self
                .coordinator
                .child_links(peer.id, LinkFilter::Any)
                .await?
                .len();
            if children > fanout {
                violations.push(format!("peer {} has {} child links", peer.id, children));
            }
        }

        Ok(violations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scenario_starts_with_broadcaster() {
        let scenario = ChannelScenario::start(CoordinatorConfig::default()).await.unwrap();
        let tree = scenario.tree().await.unwrap();

        assert_eq!(tree.peer_ids(), vec![scenario.broadcaster()]);
        assert!(scenario.check_invariants().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_join_established() {
        let mut scenario = ChannelScenario::start(CoordinatorConfig::default()).await.unwrap();
        let link = scenario.join_established().await.unwrap();

        assert_eq!(link.endpoint, scenario.broadcaster());
        let tree = scenario.tree().await.unwrap();
        assert_eq!(tree.len(), 2);
        assert!(scenario.coordinator().can_rebroadcast(link.initiator).await.unwrap());
    }
}
