//! Teardown reconciliation
//!
//! Before a peer record disappears, every link in the subtree below it is
//! removed. The subtree is built over links in any state, so half-negotiated
//! links go too. Removal is one batch; if it fails, the peer must stay.

use std::collections::BTreeSet;

use relaytree_core::{LinkFilter, LinkId, Peer, RelayError, RelayResult};
use relaytree_signal::ConnectionStateMachine;
use relaytree_topology::{collect_subtree_links, Population};

/// Removes a departing peer's subtree links
#[derive(Clone)]
pub struct TeardownReconciler {
    machine: ConnectionStateMachine,
}

impl TeardownReconciler {
    pub fn new(machine: ConnectionStateMachine) -> Self {
        Self { machine }
    }

    /// Delete every link in the subtree rooted at `departing`
    ///
    /// Returns the ids actually removed. A peer with no links makes no
    /// delete call and returns an empty set.
    pub async fn reconcile_on_peer_removal(&self, departing: &Peer) -> RelayResult<BTreeSet<LinkId>> {
        let population = Population::load(self.machine.registry().as_ref(), departing.channel).await?;
        let tree = population
            .build_tree(departing.id, LinkFilter::Any)
            .ok_or(RelayError::PeerNotFound(departing.id))?;

        let links = collect_subtree_links(&tree);
        if links.is_empty() {
            tracing::debug!(peer = %departing.id, "nothing to reconcile");
            return Ok(BTreeSet::new());
        }

        let removed = self.machine.destroy_many(&links).await.map_err(|e| {
            tracing::error!(peer = %departing.id, links = links.len(), error = %e, "teardown failed");
            e
        })?;

        let removed: BTreeSet<LinkId> = removed.into_iter().map(|l| l.id).collect();
        tracing::info!(
            peer = %departing.id,
            subtree = tree.len(),
            removed = removed.len(),
            "reconciled departing peer"
        );
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use relaytree_core::{ChannelId, LinkState, Notification, SessionId};
    use relaytree_registry::{
        ConnectionCriteria, ConnectionUpdate, MemoryRegistry, NewPeer, PeerCriteria, Registry,
        RegistryOp, SignalHub,
    };

    struct Fixture {
        registry: Arc<MemoryRegistry>,
        hub: Arc<SignalHub>,
        machine: ConnectionStateMachine,
        reconciler: TeardownReconciler,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(MemoryRegistry::new());
        let hub = Arc::new(SignalHub::new(64));
        let machine = ConnectionStateMachine::new(registry.clone(), hub.clone());
        let reconciler = TeardownReconciler::new(machine.clone());
        Fixture {
            registry,
            hub,
            machine,
            reconciler,
        }
    }

    impl Fixture {
        async fn peer(&self, session: u64, broadcaster: bool) -> Peer {
            self.registry
                .create_peer(NewPeer {
                    channel: ChannelId::new(1),
                    session: SessionId::new(session),
                    broadcaster,
                })
                .await
                .unwrap()
        }

        async fn link(&self, child: &Peer, parent: &Peer, state: LinkState) -> LinkId {
            let link = self.machine.create(child, parent, 2).await.unwrap();
            let mut current = link.clone();
            for step in [LinkState::Connecting, LinkState::RecvEstablished, LinkState::Established] {
                if current.state == state {
                    break;
                }
                current = self
                    .registry
                    .update_connection(
                        link.id,
                        ConnectionUpdate {
                            state: step,
                            expected_version: current.version,
                        },
                    )
                    .await
                    .unwrap();
            }
            link.id
        }

        async fn fresh(&self, peer: &Peer) -> Peer {
            self.registry
                .find_peer(&PeerCriteria::by_id(peer.id))
                .await
                .unwrap()
                .unwrap()
        }
    }

    #[tokio::test]
    async fn test_removes_subtree_only() {
        let f = fixture();
        let root = f.peer(1, true).await;
        let p = f.peer(2, false).await;
        let sibling = f.peer(3, false).await;
        let a = f.peer(4, false).await;
        let b = f.peer(5, false).await;
        let c = f.peer(6, false).await;

        let up = f.link(&p, &root, LinkState::Established).await;
        let keep = f.link(&sibling, &root, LinkState::Established).await;
        let pa = f.link(&a, &p, LinkState::Established).await;
        let pb = f.link(&b, &p, LinkState::Connecting).await;
        let ac = f.link(&c, &a, LinkState::Reserved).await;

        let mut rx = f.hub.register_session(SessionId::new(1));

        let removed = f.reconciler.reconcile_on_peer_removal(&f.fresh(&p).await).await.unwrap();
        assert_eq!(removed, BTreeSet::from([up, pa, pb, ac]));

        let left = f.registry.find_connections(&ConnectionCriteria::default()).await.unwrap();
        assert_eq!(left.iter().map(|l| l.id).collect::<Vec<_>>(), vec![keep]);

        for peer in [&p, &a, &b, &c] {
            assert!(f.fresh(peer).await.links.is_empty());
        }
        assert_eq!(f.fresh(&root).await.links, BTreeSet::from([keep]));

        // the root's session saw the destroy of its own link, with last state
        match rx.recv().await {
            Some(Notification::LinkDestroyed { link, previous }) => {
                assert_eq!(link, up);
                assert_eq!(previous.state, LinkState::Established);
            }
            other => panic!("unexpected notification {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_no_links_no_delete_call() {
        let f = fixture();
        let lonely = f.peer(1, false).await;

        let removed = f.reconciler.reconcile_on_peer_removal(&lonely).await.unwrap();
        assert!(removed.is_empty());
        assert_eq!(f.registry.calls(RegistryOp::DeleteConnections), 0);
    }

    #[tokio::test]
    async fn test_batch_failure_is_fatal() {
        let f = fixture();
        let root = f.peer(1, true).await;
        let p = f.peer(2, false).await;
        f.link(&p, &root, LinkState::Connecting).await;

        f.registry.fail_next(RegistryOp::DeleteConnections);
        let result = f.reconciler.reconcile_on_peer_removal(&f.fresh(&p).await).await;

        assert!(matches!(result, Err(RelayError::Internal(_))));
        assert_eq!(f.registry.link_count(), 1);
    }
}
