//! Coordination service
//!
//! The [`Coordinator`] is the entry point the application layer calls into.
//! Every operation is an independent unit of work and may run concurrently
//! with others touching the same peer or link. Atomicity comes from the
//! registry's per-entity updates; this layer retries whole operations when an
//! update reports `Conflict`.
//!
//! ```text
//!   join ──▶ Population::load ──▶ build_tree ──▶ choose_upstream ──▶ create (reserved)
//!                                                                        │
//!   send_negotiation_message ──▶ relay (reserved → connecting) ◀─────────┘
//!   finalize ──▶ CAS step (half-established → established)
//!   leave ──▶ reconcile subtree ──▶ delete peer
//! ```

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;

use relaytree_core::{
    ChannelId, LinkFilter, LinkId, LinkState, MessageKind, Peer, PeerConnection, PeerId,
    PeerNode, RelayError, RelayResult, SessionId,
};
use relaytree_registry::{
    ConnectionCriteria, NewPeer, PeerCriteria, PeerUpdate, Registry, SignalHub,
};
use relaytree_signal::{ConnectionStateMachine, LinkInput, LinkTask, SignalingRelay};
use relaytree_topology::{choose_upstream, Population, TreeView};

use crate::config::CoordinatorConfig;
use crate::reconcile::TeardownReconciler;
use crate::session::TransportSession;

/// Result of a join
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Joined {
    pub peer: Peer,
    /// Upstream link reserved for a viewer; `None` for the broadcaster
    pub link: Option<PeerConnection>,
}

struct Inner {
    registry: Arc<dyn Registry>,
    hub: Arc<SignalHub>,
    machine: ConnectionStateMachine,
    relay: SignalingRelay,
    reconciler: TeardownReconciler,
    config: CoordinatorConfig,
    tasks: Mutex<HashMap<LinkId, LinkTask>>,
}

/// Relay-tree coordination service
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    pub fn new(registry: Arc<dyn Registry>, config: CoordinatorConfig) -> Self {
        let hub = Arc::new(SignalHub::new(config.notification_capacity));
        let machine = ConnectionStateMachine::new(registry.clone(), hub.clone());

        Self {
            inner: Arc::new(Inner {
                registry,
                hub,
                relay: SignalingRelay::new(machine.clone()),
                reconciler: TeardownReconciler::new(machine.clone()),
                machine,
                config,
                tasks: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Arc<dyn Registry> {
        &self.inner.registry
    }

    pub fn hub(&self) -> &Arc<SignalHub> {
        &self.inner.hub
    }

    /// Open a transport session with its own notification queue
    pub fn open_session(&self) -> TransportSession {
        let hub = &self.inner.hub;
        let mut id = SessionId::new(rand::random());
        while hub.is_registered(id) {
            id = SessionId::new(rand::random());
        }
        let notifications = hub.register_session(id);
        TransportSession::new(id, self.clone(), notifications)
    }

    /// Join `channel` from `session`
    ///
    /// A broadcaster becomes the channel's root. A viewer is placed under
    /// the first peer with a free slot and gets a `reserved` upstream link.
    /// Joining again from the same session returns the existing peer.
    pub async fn join(
        &self,
        session: SessionId,
        channel: ChannelId,
        broadcaster: bool,
    ) -> RelayResult<Joined> {
        let registry = &self.inner.registry;

        if broadcaster {
            self.ensure_broadcaster_free(channel, session).await?;
        }

        let existing = registry
            .find_peer(&PeerCriteria::in_channel(channel).with_session(session))
            .await?;

        let (peer, created) = match existing {
            Some(peer) if peer.broadcaster != broadcaster => {
                // role change: the old subtree cannot survive it
                self.inner.reconciler.reconcile_on_peer_removal(&peer).await?;
                let peer = registry
                    .update_peer(peer.id, PeerUpdate::set_broadcaster(broadcaster))
                    .await?;
                tracing::info!(peer = %peer.id, broadcaster, "peer changed role");
                (peer, false)
            }
            Some(peer) => (peer, false),
            None => {
                let peer = registry
                    .create_peer(NewPeer {
                        channel,
                        session,
                        broadcaster,
                    })
                    .await?;
                self.inner.hub.subscribe_peer(peer.id, session);
                (peer, true)
            }
        };

        if peer.broadcaster {
            self.settle_broadcaster_race(&peer).await?;
            tracing::info!(peer = %peer.id, channel = %channel, "broadcaster joined");
            return Ok(Joined { peer, link: None });
        }

        if !created {
            let upstream = registry
                .find_connection(&ConnectionCriteria::parents_of(peer.id))
                .await?;
            if let Some(link) = upstream {
                self.ensure_link_task(&link);
                return Ok(Joined {
                    peer,
                    link: Some(link),
                });
            }
        }

        let candidate = &peer;
        match self
            .with_retries("join", move || self.attach_upstream(candidate))
            .await
        {
            Ok(link) => {
                let peer = self.peer(link.initiator).await?;
                tracing::info!(
                    peer = %peer.id,
                    channel = %channel,
                    upstream = %link.endpoint,
                    link = %link.id,
                    "viewer joined"
                );
                Ok(Joined {
                    peer,
                    link: Some(link),
                })
            }
            Err(e) => {
                if created {
                    match registry.delete_peer(peer.id).await {
                        Ok(_) => self.inner.hub.unsubscribe_peer(peer.id),
                        Err(rollback) => {
                            tracing::error!(peer = %peer.id, error = %rollback, "join rollback failed")
                        }
                    }
                }
                tracing::info!(peer = %peer.id, channel = %channel, error = %e, "join failed");
                Err(e)
            }
        }
    }

    async fn ensure_broadcaster_free(&self, channel: ChannelId, session: SessionId) -> RelayResult<()> {
        let current = self
            .inner
            .registry
            .find_peer(&PeerCriteria::broadcaster_of(channel))
            .await?;

        match current {
            Some(b) if b.session != session => Err(RelayError::BroadcasterTaken {
                channel,
                broadcaster: b.id,
            }),
            _ => Ok(()),
        }
    }

    /// Two sessions racing to broadcast both pass the initial check; the
    /// lowest peer id keeps the role and the other backs out.
    async fn settle_broadcaster_race(&self, peer: &Peer) -> RelayResult<()> {
        let registry = &self.inner.registry;
        let winner = registry
            .find_peer(&PeerCriteria::broadcaster_of(peer.channel))
            .await?;

        match winner {
            Some(w) if w.id != peer.id => {
                registry.delete_peer(peer.id).await?;
                self.inner.hub.unsubscribe_peer(peer.id);
                Err(RelayError::BroadcasterTaken {
                    channel: peer.channel,
                    broadcaster: w.id,
                })
            }
            _ => Ok(()),
        }
    }

    /// One attempt at selecting a parent and reserving a link to it
    async fn attach_upstream(&self, peer: &Peer) -> RelayResult<PeerConnection> {
        let channel = peer.channel;
        let fanout = self.inner.config.topology.fanout;

        let population = Population::load(self.inner.registry.as_ref(), channel).await?;
        let root = population
            .broadcaster(channel)
            .ok_or(RelayError::NoRoot(channel))?;
        let tree = population
            .build_tree(root.id(), LinkFilter::default())
            .ok_or(RelayError::NoRoot(channel))?;
        let upstream = choose_upstream(peer.id, &tree, fanout)
            .cloned()
            .ok_or(RelayError::NoCapacity(channel))?;

        // Reserve and start supervision in a detached task: an abandoned join
        // must not leave a registered link that nothing times out.
        let this = self.clone();
        let child = peer.clone();
        tokio::spawn(async move {
            let link = this.inner.machine.create(&child, &upstream, fanout).await?;
            this.spawn_link_task(link.id);
            Ok::<_, RelayError>(link)
        })
        .await
        .map_err(|e| RelayError::Internal(format!("reservation task failed: {}", e)))?
    }

    /// Relay a negotiation payload from `from` to the other side of `link`
    pub async fn send_negotiation_message(
        &self,
        link: LinkId,
        from: PeerId,
        kind: MessageKind,
        payload: Bytes,
    ) -> RelayResult<()> {
        self.inner.relay.relay_message(link, from, kind, payload).await?;
        self.notify_task(link, LinkInput::Relayed(kind));
        Ok(())
    }

    /// Confirm `from`'s side of `link`; returns the resulting state
    pub async fn finalize(&self, link: LinkId, from: PeerId) -> RelayResult<LinkState> {
        let machine = &self.inner.machine;
        let state = self
            .with_retries("finalize", move || machine.finalize(link, from))
            .await?;

        self.notify_task(link, LinkInput::Transitioned(state));
        if state.is_established() {
            self.inner.tasks.lock().remove(&link);
        }
        Ok(state)
    }

    /// Remove a peer after tearing down its subtree
    ///
    /// Returns every link removed. If teardown fails the peer stays.
    pub async fn leave(&self, peer: PeerId) -> RelayResult<BTreeSet<LinkId>> {
        let registry = &self.inner.registry;
        let mut removed = BTreeSet::new();
        let mut attempt = 0;

        loop {
            let current = self.peer(peer).await?;
            removed.extend(self.inner.reconciler.reconcile_on_peer_removal(&current).await?);

            match registry.delete_peer(peer).await {
                Ok(_) => break,
                // a link reached the peer after the subtree snapshot
                Err(e) if e.is_conflict() && attempt < self.inner.config.max_conflict_retries => {
                    attempt += 1;
                    tracing::debug!(peer = %peer, attempt, "peer gained links during teardown");
                }
                Err(e) => return Err(e),
            }
        }

        for link in &removed {
            self.forget_task(*link);
        }
        self.inner.hub.publish_peer_destroyed(peer);

        tracing::info!(peer = %peer, removed = removed.len(), "peer left");
        Ok(removed)
    }

    /// Destroy one link on request of one of its parties
    pub async fn destroy_link(&self, link: LinkId, from: PeerId) -> RelayResult<()> {
        let record = self.inner.machine.get(link).await?;
        if !record.involves(from) {
            return Err(RelayError::NotLinkParty { peer: from, link });
        }

        self.inner.machine.destroy_many(&BTreeSet::from([link])).await?;
        self.forget_task(link);
        tracing::info!(link = %link, by = %from, "link destroyed on request");
        Ok(())
    }

    /// Current established tree rooted at the channel's broadcaster
    pub async fn channel_tree(&self, channel: ChannelId) -> RelayResult<TreeView> {
        let population = Population::load(self.inner.registry.as_ref(), channel).await?;
        let root = population
            .broadcaster(channel)
            .ok_or(RelayError::NoRoot(channel))?;
        population
            .build_tree(root.id(), LinkFilter::default())
            .ok_or(RelayError::NoRoot(channel))
    }

    /// Broadcaster, or fed by an established upstream link
    pub async fn can_rebroadcast(&self, peer: PeerId) -> RelayResult<bool> {
        Ok(self.peer_node(peer).await?.can_rebroadcast())
    }

    /// Links on which `peer` is the parent
    pub async fn child_links(&self, peer: PeerId, filter: LinkFilter) -> RelayResult<Vec<PeerConnection>> {
        let node = self.peer_node(peer).await?;
        Ok(node.child_links(filter).cloned().collect())
    }

    /// Links on which `peer` is the child
    pub async fn parent_links(&self, peer: PeerId, filter: LinkFilter) -> RelayResult<Vec<PeerConnection>> {
        let node = self.peer_node(peer).await?;
        Ok(node.parent_links(filter).cloned().collect())
    }

    /// The other party of `link` as seen from `local`
    pub async fn opposite_peer(&self, link: LinkId, local: PeerId) -> RelayResult<PeerId> {
        self.inner
            .machine
            .get(link)
            .await?
            .opposite(local)
            .ok_or(RelayError::NotLinkParty { peer: local, link })
    }

    pub async fn peer(&self, id: PeerId) -> RelayResult<Peer> {
        self.inner
            .registry
            .find_peer(&PeerCriteria::by_id(id))
            .await?
            .ok_or(RelayError::PeerNotFound(id))
    }

    async fn peer_node(&self, id: PeerId) -> RelayResult<PeerNode> {
        let peer = self.peer(id).await?;
        let links = self
            .inner
            .registry
            .find_connections(&ConnectionCriteria::involving(id))
            .await?
            .into_iter()
            .filter(|l| peer.has_link(l.id))
            .collect();
        Ok(PeerNode::new(peer, links))
    }

    /// Number of link tasks still tracked
    pub fn active_link_tasks(&self) -> usize {
        let mut tasks = self.inner.tasks.lock();
        tasks.retain(|_, task| !task.is_finished());
        tasks.len()
    }

    /// Run `op` again while it fails with `Conflict`, up to the configured
    /// retry budget
    async fn with_retries<T, F, Fut>(&self, what: &'static str, mut op: F) -> RelayResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = RelayResult<T>>,
    {
        let max = self.inner.config.max_conflict_retries;
        let mut attempt = 0;

        loop {
            match op().await {
                Err(e) if e.is_conflict() && attempt < max => {
                    attempt += 1;
                    tracing::debug!(operation = what, attempt, error = %e, "retrying after conflict");
                    tokio::task::yield_now().await;
                }
                result => return result,
            }
        }
    }

    fn spawn_link_task(&self, link: LinkId) {
        let task = LinkTask::spawn(
            link,
            self.inner.machine.clone(),
            self.inner.config.negotiation_timeout,
        );
        let mut tasks = self.inner.tasks.lock();
        tasks.retain(|_, t| !t.is_finished());
        tasks.insert(link, task);
    }

    /// Start supervising `link` unless it is established or a live task
    /// already does
    fn ensure_link_task(&self, link: &PeerConnection) {
        if link.state.is_established() {
            return;
        }
        let tracked = self
            .inner
            .tasks
            .lock()
            .get(&link.id)
            .map_or(false, |t| !t.is_finished());
        if !tracked {
            tracing::debug!(link = %link.id, "resuming link supervision");
            self.spawn_link_task(link.id);
        }
    }

    fn notify_task(&self, link: LinkId, input: LinkInput) {
        let mut tasks = self.inner.tasks.lock();
        let delivered = tasks.get(&link).map(|t| t.notify(input));
        if delivered == Some(false) && tasks.get(&link).map_or(false, |t| t.is_finished()) {
            tasks.remove(&link);
        }
    }

    fn forget_task(&self, link: LinkId) {
        if let Some(task) = self.inner.tasks.lock().remove(&link) {
            task.notify(LinkInput::Destroyed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relaytree_registry::{MemoryRegistry, RegistryOp};

    fn coordinator() -> (Coordinator, Arc<MemoryRegistry>) {
        let registry = Arc::new(MemoryRegistry::new());
        let coordinator = Coordinator::new(registry.clone(), CoordinatorConfig::default());
        (coordinator, registry)
    }

    const CHANNEL: ChannelId = ChannelId(1);

    async fn establish(c: &Coordinator, link: &PeerConnection) {
        c.send_negotiation_message(link.id, link.initiator, MessageKind::Offer, Bytes::from_static(b"o"))
            .await
            .unwrap();
        c.send_negotiation_message(link.id, link.endpoint, MessageKind::Answer, Bytes::from_static(b"a"))
            .await
            .unwrap();
        c.finalize(link.id, link.endpoint).await.unwrap();
        assert_eq!(c.finalize(link.id, link.initiator).await.unwrap(), LinkState::Established);
    }

    #[tokio::test]
    async fn test_viewer_without_broadcaster() {
        let (c, registry) = coordinator();

        let err = c.join(SessionId::new(1), CHANNEL, false).await.unwrap_err();
        assert_eq!(err, RelayError::NoRoot(CHANNEL));
        assert_eq!(registry.peer_count(), 0);
        assert_eq!(c.hub().watched_peers(), 0);
    }

    #[tokio::test]
    async fn test_second_broadcaster_forbidden() {
        let (c, _) = coordinator();
        let b = c.join(SessionId::new(1), CHANNEL, true).await.unwrap();
        assert!(b.link.is_none());

        let err = c.join(SessionId::new(2), CHANNEL, true).await.unwrap_err();
        assert!(matches!(err, RelayError::BroadcasterTaken { broadcaster, .. } if broadcaster == b.peer.id));
    }

    #[tokio::test]
    async fn test_join_is_idempotent_per_session() {
        let (c, registry) = coordinator();
        c.join(SessionId::new(1), CHANNEL, true).await.unwrap();

        let first = c.join(SessionId::new(2), CHANNEL, false).await.unwrap();
        let again = c.join(SessionId::new(2), CHANNEL, false).await.unwrap();

        assert_eq!(first.peer.id, again.peer.id);
        assert_eq!(first.link.map(|l| l.id), again.link.map(|l| l.id));
        assert_eq!(registry.peer_count(), 2);
        assert_eq!(registry.link_count(), 1);
    }

    #[tokio::test]
    async fn test_rejoin_resumes_link_supervision() {
        let (c, _) = coordinator();
        c.join(SessionId::new(1), CHANNEL, true).await.unwrap();
        let first = c.join(SessionId::new(2), CHANNEL, false).await.unwrap();
        assert_eq!(c.active_link_tasks(), 1);

        c.inner.tasks.lock().clear();
        assert_eq!(c.active_link_tasks(), 0);

        let again = c.join(SessionId::new(2), CHANNEL, false).await.unwrap();
        assert_eq!(again.link.map(|l| l.id), first.link.map(|l| l.id));
        assert_eq!(c.active_link_tasks(), 1);

        // a live task is not replaced
        c.join(SessionId::new(2), CHANNEL, false).await.unwrap();
        assert_eq!(c.active_link_tasks(), 1);
    }

    #[tokio::test]
    async fn test_saturated_channel_reports_no_capacity() {
        let (c, registry) = coordinator();
        c.join(SessionId::new(1), CHANNEL, true).await.unwrap();
        c.join(SessionId::new(2), CHANNEL, false).await.unwrap();
        c.join(SessionId::new(3), CHANNEL, false).await.unwrap();

        // both root slots are in progress, nothing below the root is established
        let err = c.join(SessionId::new(4), CHANNEL, false).await.unwrap_err();
        assert_eq!(err, RelayError::NoCapacity(CHANNEL));
        assert_eq!(registry.peer_count(), 3);
        assert_eq!(c.hub().watched_peers(), 3);
    }

    #[tokio::test]
    async fn test_negotiation_and_queries() {
        let (c, _) = coordinator();
        let b = c.join(SessionId::new(1), CHANNEL, true).await.unwrap().peer;
        let joined = c.join(SessionId::new(2), CHANNEL, false).await.unwrap();
        let v = joined.peer;
        let link = joined.link.unwrap();

        assert_eq!(link.endpoint, b.id);
        assert!(!c.can_rebroadcast(v.id).await.unwrap());
        assert!(c.can_rebroadcast(b.id).await.unwrap());

        establish(&c, &link).await;

        assert!(c.can_rebroadcast(v.id).await.unwrap());
        assert_eq!(c.opposite_peer(link.id, v.id).await.unwrap(), b.id);
        assert_eq!(c.child_links(b.id, LinkFilter::default()).await.unwrap().len(), 1);
        assert_eq!(c.parent_links(v.id, LinkFilter::default()).await.unwrap().len(), 1);
        assert!(c.child_links(v.id, LinkFilter::Any).await.unwrap().is_empty());

        let tree = c.channel_tree(CHANNEL).await.unwrap();
        assert_eq!(tree.peer_ids(), vec![b.id, v.id]);
        assert_eq!(c.active_link_tasks(), 0);
    }

    #[tokio::test]
    async fn test_destroy_link_requires_party() {
        let (c, registry) = coordinator();
        let b = c.join(SessionId::new(1), CHANNEL, true).await.unwrap().peer;
        let link = c.join(SessionId::new(2), CHANNEL, false).await.unwrap().link.unwrap();
        let stranger = c.join(SessionId::new(3), CHANNEL, false).await.unwrap().peer;

        assert!(matches!(
            c.destroy_link(link.id, stranger.id).await,
            Err(RelayError::NotLinkParty { .. })
        ));
        c.destroy_link(link.id, b.id).await.unwrap();
        assert!(matches!(
            c.opposite_peer(link.id, b.id).await,
            Err(RelayError::LinkNotFound(_))
        ));
        assert_eq!(registry.link_count(), 1);
    }

    #[tokio::test]
    async fn test_leave_keeps_peer_when_teardown_fails() {
        let (c, registry) = coordinator();
        c.join(SessionId::new(1), CHANNEL, true).await.unwrap();
        let v = c.join(SessionId::new(2), CHANNEL, false).await.unwrap().peer;

        registry.fail_next(RegistryOp::DeleteConnections);
        assert!(c.leave(v.id).await.is_err());
        assert!(c.peer(v.id).await.is_ok());

        let removed = c.leave(v.id).await.unwrap();
        assert_eq!(removed.len(), 1);
        assert!(matches!(c.peer(v.id).await, Err(RelayError::PeerNotFound(_))));
    }

    #[tokio::test]
    async fn test_leave_notifies_watchers() {
        let (c, _) = coordinator();
        let mut session = c.open_session();
        let b = session.join(CHANNEL, true).await.unwrap().peer;
        let v = c.join(SessionId::new(2), CHANNEL, false).await.unwrap().peer;
        session.drain();

        c.leave(v.id).await.unwrap();

        let seen: Vec<&'static str> = session.drain().iter().map(|n| n.verb()).collect();
        assert_eq!(seen, vec!["peer_link_removed", "link_destroyed"]);
        assert!(c.child_links(b.id, LinkFilter::Any).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_role_change_reconciles() {
        let (c, registry) = coordinator();
        let b = c.join(SessionId::new(1), CHANNEL, true).await.unwrap().peer;
        let v = c.join(SessionId::new(2), CHANNEL, false).await.unwrap().peer;
        assert_eq!(registry.link_count(), 1);

        c.leave(b.id).await.unwrap();

        let promoted = c.join(SessionId::new(2), CHANNEL, true).await.unwrap();
        assert_eq!(promoted.peer.id, v.id);
        assert!(promoted.peer.broadcaster);
        assert!(promoted.link.is_none());
        assert_eq!(registry.link_count(), 0);
    }
}
