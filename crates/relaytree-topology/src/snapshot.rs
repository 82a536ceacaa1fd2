//! Population snapshots
//!
//! A [`Population`] is every peer of a channel with its link set resolved to
//! link records. Snapshots are read from the registry in two queries and are
//! not transactional; a concurrent change may show up in one and not the
//! other. Callers tolerate that and re-validate on write.

use std::collections::{BTreeSet, HashMap};

use relaytree_core::{
    ChannelId, LinkFilter, LinkId, LinkState, Peer, PeerConnection, PeerId, PeerNode,
    RelayResult, SessionId,
};
use relaytree_registry::{ConnectionCriteria, PeerCriteria, Registry};

use crate::tree::{build_tree, TreeView};

/// Snapshot of peers with resolved links, ordered by peer id
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Population {
    nodes: Vec<PeerNode>,
}

impl Population {
    pub fn new(mut nodes: Vec<PeerNode>) -> Self {
        nodes.sort_by_key(|n| n.id());
        Self { nodes }
    }

    /// Read every peer of `channel` and resolve their link references
    ///
    /// References to links that no longer exist are skipped.
    pub async fn load(registry: &dyn Registry, channel: ChannelId) -> RelayResult<Self> {
        let peers = registry.find_peers(&PeerCriteria::in_channel(channel)).await?;
        let links: HashMap<LinkId, PeerConnection> = registry
            .find_connections(&ConnectionCriteria {
                channel: Some(channel),
                ..Default::default()
            })
            .await?
            .into_iter()
            .map(|l| (l.id, l))
            .collect();

        let mut dangling = 0usize;
        let nodes = peers
            .into_iter()
            .map(|peer| {
                let resolved: Vec<PeerConnection> = peer
                    .links
                    .iter()
                    .filter_map(|id| {
                        let link = links.get(id).cloned();
                        if link.is_none() {
                            dangling += 1;
                        }
                        link
                    })
                    .collect();
                PeerNode::new(peer, resolved)
            })
            .collect();

        if dangling > 0 {
            tracing::debug!(channel = %channel, dangling, "skipped missing link references");
        }

        Ok(Self::new(nodes))
    }

    pub fn nodes(&self) -> &[PeerNode] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, peer: PeerId) -> Option<&PeerNode> {
        self.nodes
            .binary_search_by_key(&peer, |n| n.id())
            .ok()
            .map(|idx| &self.nodes[idx])
    }

    /// The broadcaster of `channel`, lowest id first if several are recorded
    pub fn broadcaster(&self, channel: ChannelId) -> Option<&PeerNode> {
        self.nodes
            .iter()
            .find(|n| n.peer.broadcaster && n.channel() == channel)
    }

    /// Tree rooted at `root`, or `None` if the root is not in the snapshot
    pub fn build_tree(&self, root: PeerId, filter: LinkFilter) -> Option<TreeView> {
        let root = self.get(root)?;
        Some(build_tree(root, &self.nodes, filter))
    }

    /// Fold another snapshot in; nodes already present are replaced
    pub fn merge(&mut self, other: Population) {
        for node in other.nodes {
            match self.nodes.binary_search_by_key(&node.id(), |n| n.id()) {
                Ok(idx) => self.nodes[idx] = node,
                Err(idx) => self.nodes.insert(idx, node),
            }
        }
    }
}

/// Build a population by hand
///
/// Ids are given as plain integers; every peer's session id equals its peer
/// id. Links are attached to whichever of their parties the builder knows.
#[derive(Clone, Debug)]
pub struct PopulationBuilder {
    channel: ChannelId,
    peers: Vec<Peer>,
    links: Vec<PeerConnection>,
}

impl PopulationBuilder {
    pub fn new(channel: ChannelId) -> Self {
        Self {
            channel,
            peers: Vec::new(),
            links: Vec::new(),
        }
    }

    pub fn broadcaster(self, id: u64) -> Self {
        self.peer(id, true)
    }

    pub fn viewer(self, id: u64) -> Self {
        self.peer(id, false)
    }

    fn peer(mut self, id: u64, broadcaster: bool) -> Self {
        self.peers.push(Peer {
            id: PeerId::new(id),
            channel: self.channel,
            session: SessionId::new(id),
            broadcaster,
            links: BTreeSet::new(),
            version: 0,
        });
        self
    }

    pub fn link(mut self, id: u64, initiator: u64, endpoint: u64, state: LinkState) -> Self {
        self.links.push(PeerConnection {
            id: LinkId::new(id),
            channel: self.channel,
            state,
            initiator: PeerId::new(initiator),
            endpoint: PeerId::new(endpoint),
            version: 0,
        });
        self
    }

    pub fn build(self) -> Population {
        let nodes = self
            .peers
            .into_iter()
            .map(|mut peer| {
                let links: Vec<PeerConnection> = self
                    .links
                    .iter()
                    .filter(|l| l.involves(peer.id))
                    .cloned()
                    .collect();
                peer.links = links.iter().map(|l| l.id).collect();
                PeerNode::new(peer, links)
            })
            .collect();
        Population::new(nodes)
    }
}
