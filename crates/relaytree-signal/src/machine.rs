//! Connection state machine
//!
//! ```text
//!   reserved ──relay──▶ connecting ──endpoint finalizes──▶ init_established ─┐
//!                           │                                               ├─▶ established
//!                           └────initiator finalizes──▶ recv_established ───┘
//! ```
//!
//! Each side finalizes independently and in any order; the link reaches
//! `established` only once both have. Every stored transition is a
//! compare-and-swap on the link's version, so two sides finalizing at the same
//! moment cannot both apply a step computed from the same prior state. The
//! loser sees `Conflict` and is expected to retry the whole call.

use std::collections::BTreeSet;
use std::sync::Arc;

use relaytree_core::{
    LinkId, LinkSide, LinkState, Peer, PeerConnection, PeerId, RelayError, RelayResult,
};
use relaytree_registry::{
    ConnectionCriteria, ConnectionUpdate, NewConnection, PeerUpdate, Registry, SignalHub,
};

/// Next state after `requester` finalizes `link`
///
/// `Ok(None)` means nothing changes: the link is already established, or the
/// requester already finalized its side.
pub fn next_state(link: &PeerConnection, requester: PeerId) -> RelayResult<Option<LinkState>> {
    let side = link.side_of(requester).ok_or(RelayError::NotLinkParty {
        peer: requester,
        link: link.id,
    })?;

    match (side, link.state) {
        (_, LinkState::Established) => Ok(None),
        (_, LinkState::Reserved) => Err(RelayError::InvalidTransition {
            link: link.id,
            from: LinkState::Reserved,
            reason: "negotiation has not started",
        }),
        (LinkSide::Endpoint, LinkState::Connecting) => Ok(Some(LinkState::InitEstablished)),
        (LinkSide::Endpoint, LinkState::RecvEstablished) => Ok(Some(LinkState::Established)),
        (LinkSide::Endpoint, LinkState::InitEstablished) => Ok(None),
        (LinkSide::Initiator, LinkState::Connecting) => Ok(Some(LinkState::RecvEstablished)),
        (LinkSide::Initiator, LinkState::InitEstablished) => Ok(Some(LinkState::Established)),
        (LinkSide::Initiator, LinkState::RecvEstablished) => Ok(None),
    }
}

/// Stored link lifecycle: reservation, transitions and removal
#[derive(Clone)]
pub struct ConnectionStateMachine {
    registry: Arc<dyn Registry>,
    hub: Arc<SignalHub>,
}

impl ConnectionStateMachine {
    pub fn new(registry: Arc<dyn Registry>, hub: Arc<SignalHub>) -> Self {
        Self { registry, hub }
    }

    pub fn registry(&self) -> &Arc<dyn Registry> {
        &self.registry
    }

    pub fn hub(&self) -> &Arc<SignalHub> {
        &self.hub
    }

    /// Reserve a link from `initiator` (child) to `endpoint` (parent)
    ///
    /// The link record is created in `reserved` and added to both peers'
    /// link sets. The endpoint update refuses to give the parent more than
    /// `fanout` child links; if it or any later step fails, the link is
    /// removed again and the error returned.
    pub async fn create(
        &self,
        initiator: &Peer,
        endpoint: &Peer,
        fanout: usize,
    ) -> RelayResult<PeerConnection> {
        let link = self
            .registry
            .create_connection(NewConnection {
                channel: endpoint.channel,
                initiator: initiator.id,
                endpoint: endpoint.id,
                state: LinkState::Reserved,
            })
            .await?;

        if let Err(e) = self.attach(&link, fanout).await {
            self.rollback(&link).await;
            return Err(e);
        }

        self.hub.subscribe_link(link.id, initiator.session);
        self.hub.subscribe_link(link.id, endpoint.session);
        self.hub.publish_link_created(&link);
        self.hub.publish_peer_link_added(link.endpoint, link.id);
        self.hub.publish_peer_link_added(link.initiator, link.id);

        tracing::info!(
            link = %link.id,
            initiator = %link.initiator,
            endpoint = %link.endpoint,
            "link reserved"
        );
        Ok(link)
    }

    async fn attach(&self, link: &PeerConnection, fanout: usize) -> RelayResult<()> {
        self.registry
            .update_peer(
                link.endpoint,
                PeerUpdate::add_link(link.id).with_child_limit(fanout),
            )
            .await?;
        self.registry
            .update_peer(link.initiator, PeerUpdate::add_link(link.id))
            .await?;
        Ok(())
    }

    async fn rollback(&self, link: &PeerConnection) {
        let ids = BTreeSet::from([link.id]);
        match self.registry.delete_connections(&ids).await {
            Ok(_) => tracing::debug!(link = %link.id, "rolled back reservation"),
            Err(e) => tracing::error!(link = %link.id, error = %e, "reservation rollback failed"),
        }
    }

    pub async fn get(&self, id: LinkId) -> RelayResult<PeerConnection> {
        self.registry
            .find_connection(&ConnectionCriteria::by_id(id))
            .await?
            .ok_or(RelayError::LinkNotFound(id))
    }

    /// Move a `reserved` link to `connecting`
    ///
    /// Idempotent: a link already past `reserved` is returned unchanged.
    pub async fn advance_to_connecting(&self, id: LinkId) -> RelayResult<PeerConnection> {
        loop {
            let link = self.get(id).await?;
            if link.state != LinkState::Reserved {
                return Ok(link);
            }

            match self
                .registry
                .update_connection(
                    id,
                    ConnectionUpdate {
                        state: LinkState::Connecting,
                        expected_version: link.version,
                    },
                )
                .await
            {
                Ok(updated) => {
                    tracing::debug!(link = %id, "link connecting");
                    self.hub
                        .publish_link_updated(id, updated.state, LinkState::Reserved);
                    return Ok(updated);
                }
                // someone else moved it first; re-read
                Err(e) if e.is_conflict() => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Apply one finalization from `peer`
    ///
    /// Returns the link's state afterwards. A concurrent update of the same
    /// link surfaces as `Conflict`.
    pub async fn finalize(&self, id: LinkId, peer: PeerId) -> RelayResult<LinkState> {
        let link = self.get(id).await?;

        let Some(next) = next_state(&link, peer)? else {
            tracing::debug!(link = %id, peer = %peer, state = %link.state, "finalize is a no-op");
            return Ok(link.state);
        };

        let updated = self
            .registry
            .update_connection(
                id,
                ConnectionUpdate {
                    state: next,
                    expected_version: link.version,
                },
            )
            .await?;

        tracing::info!(
            link = %id,
            peer = %peer,
            previous = %link.state,
            state = %updated.state,
            "link finalized"
        );
        self.hub.publish_link_updated(id, updated.state, link.state);
        Ok(updated.state)
    }

    /// Delete a batch of links and notify both parties of each
    ///
    /// An empty batch makes no registry call.
    pub async fn destroy_many(&self, ids: &BTreeSet<LinkId>) -> RelayResult<Vec<PeerConnection>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let removed = self.registry.delete_connections(ids).await?;
        for link in &removed {
            self.announce_removed(link);
        }
        Ok(removed)
    }

    /// Delete one link unless it has reached `established`
    ///
    /// The delete only applies to the exact version that was checked, so a
    /// finalize landing in between is never undone.
    pub async fn destroy_unestablished(&self, id: LinkId) -> RelayResult<Option<PeerConnection>> {
        loop {
            let link = match self.get(id).await {
                Ok(link) => link,
                Err(RelayError::LinkNotFound(_)) => return Ok(None),
                Err(e) => return Err(e),
            };
            if link.state.is_established() {
                return Ok(None);
            }

            match self.registry.delete_connection_at(id, link.version).await {
                Ok(removed) => {
                    if let Some(link) = &removed {
                        self.announce_removed(link);
                    }
                    return Ok(removed);
                }
                // the link moved on; check it again
                Err(e) if e.is_conflict() => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn announce_removed(&self, link: &PeerConnection) {
        self.hub.publish_peer_link_removed(link.endpoint, link.id);
        self.hub.publish_peer_link_removed(link.initiator, link.id);
        self.hub.publish_link_destroyed(link);
        tracing::debug!(link = %link.id, state = %link.state, "link destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use relaytree_core::{ChannelId, Notification, SessionId};
    use relaytree_registry::{MemoryRegistry, NewPeer, PeerCriteria};

    fn record(state: LinkState) -> PeerConnection {
        PeerConnection {
            id: LinkId::new(1),
            channel: ChannelId::new(1),
            state,
            initiator: PeerId::new(2),
            endpoint: PeerId::new(1),
            version: 0,
        }
    }

    const CHILD: PeerId = PeerId(2);
    const PARENT: PeerId = PeerId(1);

    #[test]
    fn test_next_state_table() {
        assert_eq!(
            next_state(&record(LinkState::Connecting), PARENT).unwrap(),
            Some(LinkState::InitEstablished)
        );
        assert_eq!(
            next_state(&record(LinkState::Connecting), CHILD).unwrap(),
            Some(LinkState::RecvEstablished)
        );
        assert_eq!(
            next_state(&record(LinkState::InitEstablished), CHILD).unwrap(),
            Some(LinkState::Established)
        );
        assert_eq!(
            next_state(&record(LinkState::RecvEstablished), PARENT).unwrap(),
            Some(LinkState::Established)
        );
        assert_eq!(next_state(&record(LinkState::InitEstablished), PARENT).unwrap(), None);
        assert_eq!(next_state(&record(LinkState::Established), CHILD).unwrap(), None);
    }

    #[test]
    fn test_next_state_rejects() {
        assert!(matches!(
            next_state(&record(LinkState::Connecting), PeerId::new(3)),
            Err(RelayError::NotLinkParty { .. })
        ));
        assert!(matches!(
            next_state(&record(LinkState::Reserved), CHILD),
            Err(RelayError::InvalidTransition { from: LinkState::Reserved, .. })
        ));
    }

    struct Fixture {
        machine: ConnectionStateMachine,
        registry: Arc<MemoryRegistry>,
        parent: Peer,
        child: Peer,
    }

    async fn fixture() -> Fixture {
        fixture_on(MemoryRegistry::new()).await
    }

    async fn fixture_on(registry: MemoryRegistry) -> Fixture {
        let registry = Arc::new(registry);
        let hub = Arc::new(SignalHub::new(64));
        let parent = registry
            .create_peer(NewPeer {
                channel: ChannelId::new(1),
                session: SessionId::new(1),
                broadcaster: true,
            })
            .await
            .unwrap();
        let child = registry
            .create_peer(NewPeer {
                channel: ChannelId::new(1),
                session: SessionId::new(2),
                broadcaster: false,
            })
            .await
            .unwrap();
        let machine = ConnectionStateMachine::new(registry.clone(), hub);
        Fixture {
            machine,
            registry,
            parent,
            child,
        }
    }

    #[tokio::test]
    async fn test_create_registers_on_both_peers() {
        let f = fixture().await;
        let mut rx = f.machine.hub().register_session(f.child.session);

        let link = f.machine.create(&f.child, &f.parent, 2).await.unwrap();
        assert_eq!(link.state, LinkState::Reserved);

        for id in [f.parent.id, f.child.id] {
            let peer = f.registry.find_peer(&PeerCriteria::by_id(id)).await.unwrap().unwrap();
            assert!(peer.has_link(link.id));
        }
        assert!(matches!(rx.recv().await, Some(Notification::LinkCreated { .. })));
    }

    #[tokio::test]
    async fn test_create_rolls_back_on_full_parent() {
        let f = fixture().await;

        let err = f.machine.create(&f.child, &f.parent, 0).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(f.registry.link_count(), 0);
    }

    #[tokio::test]
    async fn test_full_negotiation() {
        let f = fixture().await;
        let mut rx = f.machine.hub().register_session(f.parent.session);
        let link = f.machine.create(&f.child, &f.parent, 2).await.unwrap();

        assert!(matches!(
            f.machine.finalize(link.id, f.child.id).await,
            Err(RelayError::InvalidTransition { .. })
        ));

        f.machine.advance_to_connecting(link.id).await.unwrap();
        let again = f.machine.advance_to_connecting(link.id).await.unwrap();
        assert_eq!(again.state, LinkState::Connecting);

        assert_eq!(
            f.machine.finalize(link.id, f.child.id).await.unwrap(),
            LinkState::RecvEstablished
        );
        assert_eq!(
            f.machine.finalize(link.id, f.child.id).await.unwrap(),
            LinkState::RecvEstablished
        );
        assert_eq!(
            f.machine.finalize(link.id, f.parent.id).await.unwrap(),
            LinkState::Established
        );
        assert_eq!(
            f.machine.finalize(link.id, f.parent.id).await.unwrap(),
            LinkState::Established
        );

        let mut updates = Vec::new();
        while let Ok(n) = rx.try_recv() {
            if let Notification::LinkUpdated { previous, state, .. } = n {
                updates.push((previous, state));
            }
        }
        assert_eq!(
            updates,
            vec![
                (LinkState::Reserved, LinkState::Connecting),
                (LinkState::Connecting, LinkState::RecvEstablished),
                (LinkState::RecvEstablished, LinkState::Established),
            ]
        );
    }

    #[tokio::test]
    async fn test_destroy_unestablished() {
        let f = fixture().await;
        let link = f.machine.create(&f.child, &f.parent, 2).await.unwrap();

        let removed = f.machine.destroy_unestablished(link.id).await.unwrap();
        assert_eq!(removed.map(|l| l.id), Some(link.id));
        assert_eq!(f.registry.link_count(), 0);
        assert_eq!(f.machine.destroy_unestablished(link.id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_destroy_keeps_established() {
        let f = fixture().await;
        let link = f.machine.create(&f.child, &f.parent, 2).await.unwrap();
        f.machine.advance_to_connecting(link.id).await.unwrap();
        f.machine.finalize(link.id, f.parent.id).await.unwrap();
        f.machine.finalize(link.id, f.child.id).await.unwrap();

        assert_eq!(f.machine.destroy_unestablished(link.id).await.unwrap(), None);
        assert_eq!(f.registry.link_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_abandon_never_undoes_finalize() {
        for round in 0..32 {
            let f = fixture_on(MemoryRegistry::with_yield_points()).await;
            let link = f.machine.create(&f.child, &f.parent, 2).await.unwrap();
            f.machine.advance_to_connecting(link.id).await.unwrap();
            f.machine.finalize(link.id, f.parent.id).await.unwrap();

            let (m1, m2) = (f.machine.clone(), f.machine.clone());
            let child = f.child.id;
            let (finalized, abandoned) = tokio::join!(
                tokio::spawn(async move { m1.finalize(link.id, child).await }),
                tokio::spawn(async move { m2.destroy_unestablished(link.id).await }),
            );
            let abandoned = abandoned.unwrap().unwrap();

            match finalized.unwrap() {
                Ok(state) => {
                    assert_eq!(state, LinkState::Established, "round {}", round);
                    assert!(abandoned.is_none(), "round {}: established link destroyed", round);
                    assert_eq!(f.registry.link_count(), 1);
                }
                Err(e) => {
                    assert_eq!(e, RelayError::LinkNotFound(link.id), "round {}", round);
                    assert!(abandoned.is_some());
                    assert_eq!(f.registry.link_count(), 0);
                }
            }
        }
    }

    #[tokio::test]
    async fn test_destroy_many_empty_is_noop() {
        let f = fixture().await;
        let removed = f.machine.destroy_many(&BTreeSet::new()).await.unwrap();
        assert!(removed.is_empty());
        assert_eq!(f.registry.calls(relaytree_registry::RegistryOp::DeleteConnections), 0);
    }

    #[derive(Clone, Copy, Debug)]
    enum Step {
        Relay,
        Finalize(bool),
    }

    fn arb_step() -> impl Strategy<Value = Step> {
        prop_oneof![Just(Step::Relay), any::<bool>().prop_map(Step::Finalize)]
    }

    proptest! {
        #[test]
        fn prop_transitions_are_monotonic(steps in prop::collection::vec(arb_step(), 0..24)) {
            let mut link = record(LinkState::Reserved);
            let mut observed = vec![link.state];

            for step in steps {
                let next = match step {
                    Step::Relay if link.state == LinkState::Reserved => Some(LinkState::Connecting),
                    Step::Relay => None,
                    Step::Finalize(from_child) => {
                        let peer = if from_child { CHILD } else { PARENT };
                        match next_state(&link, peer) {
                            Ok(next) => next,
                            Err(_) => {
                                prop_assert_eq!(link.state, LinkState::Reserved);
                                None
                            }
                        }
                    }
                };

                if let Some(next) = next {
                    prop_assert!(link.state.can_advance_to(next));
                    prop_assert!(next.rank() > link.state.rank());
                    link.state = next;
                    observed.push(next);
                }

                if link.state == LinkState::Established {
                    prop_assert_eq!(next_state(&link, CHILD).unwrap(), None);
                    prop_assert_eq!(next_state(&link, PARENT).unwrap(), None);
                }
            }

            // never both half-established states in one history
            let halves = observed
                .iter()
                .filter(|s| matches!(s, LinkState::InitEstablished | LinkState::RecvEstablished))
                .count();
            prop_assert!(halves <= 1);
        }
    }
}
