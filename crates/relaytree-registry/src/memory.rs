//! In-memory registry
//!
//! A single-process implementation of [`Registry`]. All tables sit behind one
//! `parking_lot` lock, so every operation is atomic with respect to every
//! other. The lock is never held across an `.await`.

use std::collections::{BTreeSet, HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use relaytree_core::{LinkId, Peer, PeerConnection, PeerId, RelayError, RelayResult};

use crate::{ConnectionCriteria, ConnectionUpdate, NewConnection, NewPeer, PeerCriteria, PeerUpdate, Registry};

/// Registry operation, used for call accounting and fault injection
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RegistryOp {
    FindPeer,
    FindPeers,
    CreatePeer,
    UpdatePeer,
    DeletePeer,
    FindConnection,
    FindConnections,
    CreateConnection,
    UpdateConnection,
    DeleteConnections,
    DeleteConnectionAt,
}

#[derive(Debug, Default)]
struct Tables {
    peers: HashMap<PeerId, Peer>,
    links: HashMap<LinkId, PeerConnection>,
    next_peer: u64,
    next_link: u64,
}

/// In-memory registry
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    tables: RwLock<Tables>,
    /// One-shot failures armed by tests
    faults: Mutex<HashSet<RegistryOp>>,
    calls: Mutex<HashMap<RegistryOp, u64>>,
    /// Yield to the scheduler at the start of every call
    yield_points: bool,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry that yields before every operation, so concurrent callers
    /// interleave the way they would against a remote store
    pub fn with_yield_points() -> Self {
        Self {
            yield_points: true,
            ..Self::default()
        }
    }

    /// Make the next call of `op` fail with `Internal`
    pub fn fail_next(&self, op: RegistryOp) {
        self.faults.lock().insert(op);
    }

    /// Number of calls made to `op` so far
    pub fn calls(&self, op: RegistryOp) -> u64 {
        self.calls.lock().get(&op).copied().unwrap_or(0)
    }

    pub fn peer_count(&self) -> usize {
        self.tables.read().peers.len()
    }

    pub fn link_count(&self) -> usize {
        self.tables.read().links.len()
    }

    async fn enter(&self, op: RegistryOp) -> RelayResult<()> {
        if self.yield_points {
            tokio::task::yield_now().await;
        }

        *self.calls.lock().entry(op).or_insert(0) += 1;

        if self.faults.lock().remove(&op) {
            return Err(RelayError::Internal(format!("injected {:?} failure", op)));
        }
        Ok(())
    }
}

/// Remove `link` from both parties' link sets
fn detach(peers: &mut HashMap<PeerId, Peer>, link: &PeerConnection) {
    for party in [link.initiator, link.endpoint] {
        if let Some(peer) = peers.get_mut(&party) {
            if peer.links.remove(&link.id) {
                peer.version += 1;
            }
        }
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn find_peer(&self, criteria: &PeerCriteria) -> RelayResult<Option<Peer>> {
        self.enter(RegistryOp::FindPeer).await?;
        let tables = self.tables.read();

        if let Some(id) = criteria.id {
            return Ok(tables.peers.get(&id).filter(|p| criteria.matches(p)).cloned());
        }

        // lowest id first keeps lookups deterministic
        Ok(tables
            .peers
            .values()
            .filter(|p| criteria.matches(p))
            .min_by_key(|p| p.id)
            .cloned())
    }

    async fn find_peers(&self, criteria: &PeerCriteria) -> RelayResult<Vec<Peer>> {
        self.enter(RegistryOp::FindPeers).await?;
        let tables = self.tables.read();

        let mut peers: Vec<Peer> = tables
            .peers
            .values()
            .filter(|p| criteria.matches(p))
            .cloned()
            .collect();
        peers.sort_by_key(|p| p.id);
        Ok(peers)
    }

    async fn create_peer(&self, attrs: NewPeer) -> RelayResult<Peer> {
        self.enter(RegistryOp::CreatePeer).await?;
        let mut tables = self.tables.write();

        tables.next_peer += 1;
        let peer = Peer {
            id: PeerId::new(tables.next_peer),
            channel: attrs.channel,
            session: attrs.session,
            broadcaster: attrs.broadcaster,
            links: BTreeSet::new(),
            version: 0,
        };
        tables.peers.insert(peer.id, peer.clone());
        Ok(peer)
    }

    async fn update_peer(&self, id: PeerId, update: PeerUpdate) -> RelayResult<Peer> {
        self.enter(RegistryOp::UpdatePeer).await?;
        let mut tables = self.tables.write();
        let Tables { peers, links, .. } = &mut *tables;

        let peer = peers.get_mut(&id).ok_or(RelayError::PeerNotFound(id))?;

        if let Some(expected) = update.expected_version {
            if peer.version != expected {
                return Err(RelayError::Conflict(format!(
                    "peer {} is at version {}, expected {}",
                    id, peer.version, expected
                )));
            }
        }

        for link_id in &update.add_links {
            let link = links.get(link_id).ok_or(RelayError::LinkNotFound(*link_id))?;
            if !link.involves(id) {
                return Err(RelayError::InvalidLink(format!(
                    "link {} does not involve peer {}",
                    link_id, id
                )));
            }
        }

        let mut next_links = peer.links.clone();
        next_links.extend(update.add_links.iter().copied());
        for link_id in &update.remove_links {
            next_links.remove(link_id);
        }

        if let Some(limit) = update.child_limit {
            let children = next_links
                .iter()
                .filter_map(|l| links.get(l))
                .filter(|l| l.is_child_link_of(id))
                .count();
            if children > limit {
                return Err(RelayError::Conflict(format!(
                    "peer {} has no free child slot ({} > {})",
                    id, children, limit
                )));
            }
        }

        if let Some(broadcaster) = update.broadcaster {
            peer.broadcaster = broadcaster;
        }
        peer.links = next_links;
        peer.version += 1;
        Ok(peer.clone())
    }

    async fn delete_peer(&self, id: PeerId) -> RelayResult<Peer> {
        self.enter(RegistryOp::DeletePeer).await?;
        let mut tables = self.tables.write();

        let peer = tables.peers.get(&id).ok_or(RelayError::PeerNotFound(id))?;
        if !peer.links.is_empty() {
            return Err(RelayError::Conflict(format!(
                "peer {} still holds {} link(s)",
                id,
                peer.links.len()
            )));
        }

        tables.peers.remove(&id).ok_or(RelayError::PeerNotFound(id))
    }

    async fn find_connection(
        &self,
        criteria: &ConnectionCriteria,
    ) -> RelayResult<Option<PeerConnection>> {
        self.enter(RegistryOp::FindConnection).await?;
        let tables = self.tables.read();

        if let Some(id) = criteria.id {
            return Ok(tables.links.get(&id).filter(|l| criteria.matches(l)).cloned());
        }

        Ok(tables
            .links
            .values()
            .filter(|l| criteria.matches(l))
            .min_by_key(|l| l.id)
            .cloned())
    }

    async fn find_connections(
        &self,
        criteria: &ConnectionCriteria,
    ) -> RelayResult<Vec<PeerConnection>> {
        self.enter(RegistryOp::FindConnections).await?;
        let tables = self.tables.read();

        let mut links: Vec<PeerConnection> = tables
            .links
            .values()
            .filter(|l| criteria.matches(l))
            .cloned()
            .collect();
        links.sort_by_key(|l| l.id);
        Ok(links)
    }

    async fn create_connection(&self, attrs: NewConnection) -> RelayResult<PeerConnection> {
        self.enter(RegistryOp::CreateConnection).await?;
        let mut tables = self.tables.write();

        if attrs.initiator == attrs.endpoint {
            return Err(RelayError::InvalidLink(format!(
                "peer {} cannot link to itself",
                attrs.initiator
            )));
        }

        let initiator = tables
            .peers
            .get(&attrs.initiator)
            .ok_or(RelayError::PeerNotFound(attrs.initiator))?;
        let endpoint = tables
            .peers
            .get(&attrs.endpoint)
            .ok_or(RelayError::PeerNotFound(attrs.endpoint))?;

        if initiator.channel != attrs.channel || endpoint.channel != attrs.channel {
            return Err(RelayError::InvalidLink(format!(
                "peers {} and {} are not both in channel {}",
                attrs.initiator, attrs.endpoint, attrs.channel
            )));
        }
        if initiator.broadcaster {
            return Err(RelayError::InvalidLink(format!(
                "broadcaster {} cannot initiate a link",
                attrs.initiator
            )));
        }

        tables.next_link += 1;
        let link = PeerConnection {
            id: LinkId::new(tables.next_link),
            channel: attrs.channel,
            state: attrs.state,
            initiator: attrs.initiator,
            endpoint: attrs.endpoint,
            version: 0,
        };
        tables.links.insert(link.id, link.clone());
        Ok(link)
    }

    async fn update_connection(
        &self,
        id: LinkId,
        update: ConnectionUpdate,
    ) -> RelayResult<PeerConnection> {
        self.enter(RegistryOp::UpdateConnection).await?;
        let mut tables = self.tables.write();

        let link = tables.links.get_mut(&id).ok_or(RelayError::LinkNotFound(id))?;

        if link.version != update.expected_version {
            return Err(RelayError::Conflict(format!(
                "link {} is at version {}, expected {}",
                id, link.version, update.expected_version
            )));
        }
        if !link.state.can_advance_to(update.state) {
            return Err(RelayError::InvalidTransition {
                link: id,
                from: link.state,
                reason: "not a forward step",
            });
        }

        link.state = update.state;
        link.version += 1;
        Ok(link.clone())
    }

    async fn delete_connections(&self, ids: &BTreeSet<LinkId>) -> RelayResult<Vec<PeerConnection>> {
        self.enter(RegistryOp::DeleteConnections).await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut tables = self.tables.write();
        let Tables { peers, links, .. } = &mut *tables;

        let mut removed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(link) = links.remove(id) {
                detach(peers, &link);
                removed.push(link);
            }
        }
        Ok(removed)
    }

    async fn delete_connection_at(
        &self,
        id: LinkId,
        expected_version: u64,
    ) -> RelayResult<Option<PeerConnection>> {
        self.enter(RegistryOp::DeleteConnectionAt).await?;
        let mut tables = self.tables.write();
        let Tables { peers, links, .. } = &mut *tables;

        match links.get(&id) {
            None => return Ok(None),
            Some(link) if link.version != expected_version => {
                return Err(RelayError::Conflict(format!(
                    "link {} is at version {}, expected {}",
                    id, link.version, expected_version
                )));
            }
            Some(_) => {}
        }

        let link = links.remove(&id);
        if let Some(link) = &link {
            detach(peers, link);
        }
        Ok(link)
    }
}
