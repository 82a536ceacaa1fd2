//! Session pub/sub hub
//!
//! Routes [`Notification`]s to subscribed transport sessions. Each session
//! owns one bounded queue; delivery is `try_send`, so a slow or vanished
//! session never blocks the publisher. Delivery is at-most-once.
//!
//! ```text
//!   publish_link_updated(L)          relay_message(L, from = S1)
//!            │                                  │
//!            ▼                                  ▼
//!   link_subs[L] = {S1, S2}          link_subs[L] \ {S1} = {S2}
//!            │                                  │
//!      ┌─────┴─────┐                            │
//!      ▼           ▼                            ▼
//!   queue(S1)   queue(S2)                    queue(S2)
//! ```

use std::collections::{BTreeSet, HashMap};

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use relaytree_core::{
    LinkId, LinkState, MessageKind, Notification, PeerConnection, PeerId, SessionId,
};

/// Receiving half of a session's notification queue
pub type NotificationReceiver = mpsc::Receiver<Notification>;

#[derive(Debug, Default)]
struct HubTables {
    sessions: HashMap<SessionId, mpsc::Sender<Notification>>,
    link_subs: HashMap<LinkId, BTreeSet<SessionId>>,
    peer_subs: HashMap<PeerId, BTreeSet<SessionId>>,
}

/// Delivery counters
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HubStats {
    pub delivered: u64,
    pub dropped_full: u64,
    pub dropped_closed: u64,
}

/// Pub/sub hub for transport sessions
#[derive(Debug)]
pub struct SignalHub {
    tables: RwLock<HubTables>,
    stats: RwLock<HubStats>,
    /// Per-session queue capacity
    capacity: usize,
}

impl SignalHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            tables: RwLock::new(HubTables::default()),
            stats: RwLock::new(HubStats::default()),
            capacity: capacity.max(1),
        }
    }

    /// Register a session and hand back its queue
    ///
    /// Registering an id again replaces the previous queue.
    pub fn register_session(&self, session: SessionId) -> NotificationReceiver {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.tables.write().sessions.insert(session, tx);
        tracing::debug!(session = %session, "session registered");
        rx
    }

    /// Drop a session's queue and every subscription it holds
    pub fn unregister_session(&self, session: SessionId) {
        let mut tables = self.tables.write();
        tables.sessions.remove(&session);
        for subs in tables.link_subs.values_mut() {
            subs.remove(&session);
        }
        for subs in tables.peer_subs.values_mut() {
            subs.remove(&session);
        }
        tables.link_subs.retain(|_, subs| !subs.is_empty());
        tables.peer_subs.retain(|_, subs| !subs.is_empty());
        tracing::debug!(session = %session, "session unregistered");
    }

    pub fn is_registered(&self, session: SessionId) -> bool {
        self.tables.read().sessions.contains_key(&session)
    }

    pub fn subscribe_link(&self, link: LinkId, session: SessionId) {
        self.tables
            .write()
            .link_subs
            .entry(link)
            .or_default()
            .insert(session);
    }

    pub fn subscribe_peer(&self, peer: PeerId, session: SessionId) {
        self.tables
            .write()
            .peer_subs
            .entry(peer)
            .or_default()
            .insert(session);
    }

    /// Forget every subscription to `peer` without publishing anything
    pub fn unsubscribe_peer(&self, peer: PeerId) {
        self.tables.write().peer_subs.remove(&peer);
    }

    /// Number of peers with at least one subscriber
    pub fn watched_peers(&self) -> usize {
        self.tables.read().peer_subs.len()
    }

    pub fn link_subscribers(&self, link: LinkId) -> BTreeSet<SessionId> {
        self.tables
            .read()
            .link_subs
            .get(&link)
            .cloned()
            .unwrap_or_default()
    }

    pub fn stats(&self) -> HubStats {
        self.stats.read().clone()
    }

    pub fn publish_link_created(&self, link: &PeerConnection) -> usize {
        let targets = self.link_subscribers(link.id);
        self.deliver(&targets, Notification::LinkCreated { link: link.clone() })
    }

    pub fn publish_link_updated(&self, link: LinkId, state: LinkState, previous: LinkState) -> usize {
        let targets = self.link_subscribers(link);
        self.deliver(
            &targets,
            Notification::LinkUpdated {
                link,
                state,
                previous,
            },
        )
    }

    /// Publish a destroy and forget the link's subscriptions
    pub fn publish_link_destroyed(&self, previous: &PeerConnection) -> usize {
        let targets = self
            .tables
            .write()
            .link_subs
            .remove(&previous.id)
            .unwrap_or_default();
        self.deliver(
            &targets,
            Notification::LinkDestroyed {
                link: previous.id,
                previous: previous.clone(),
            },
        )
    }

    pub fn publish_peer_link_added(&self, peer: PeerId, link: LinkId) -> usize {
        let targets = self.peer_subscribers(peer);
        self.deliver(&targets, Notification::PeerLinkAdded { peer, link })
    }

    pub fn publish_peer_link_removed(&self, peer: PeerId, link: LinkId) -> usize {
        let targets = self.peer_subscribers(peer);
        self.deliver(&targets, Notification::PeerLinkRemoved { peer, link })
    }

    /// Publish a peer's departure and forget its subscriptions
    pub fn publish_peer_destroyed(&self, peer: PeerId) -> usize {
        let targets = self
            .tables
            .write()
            .peer_subs
            .remove(&peer)
            .unwrap_or_default();
        self.deliver(&targets, Notification::PeerDestroyed { peer })
    }

    /// Forward a negotiation payload to every subscriber of `link` except
    /// the sending session
    pub fn relay_message(
        &self,
        link: LinkId,
        from: PeerId,
        from_session: SessionId,
        kind: MessageKind,
        payload: Bytes,
    ) -> usize {
        let mut targets = self.link_subscribers(link);
        targets.remove(&from_session);
        self.deliver(
            &targets,
            Notification::LinkMessage {
                link,
                from,
                kind,
                payload,
            },
        )
    }

    pub fn peer_subscribers(&self, peer: PeerId) -> BTreeSet<SessionId> {
        self.tables
            .read()
            .peer_subs
            .get(&peer)
            .cloned()
            .unwrap_or_default()
    }

    fn deliver(&self, targets: &BTreeSet<SessionId>, notification: Notification) -> usize {
        if targets.is_empty() {
            return 0;
        }

        let senders: Vec<(SessionId, mpsc::Sender<Notification>)> = {
            let tables = self.tables.read();
            targets
                .iter()
                .filter_map(|s| tables.sessions.get(s).map(|tx| (*s, tx.clone())))
                .collect()
        };

        let mut delivered = 0;
        let mut stats = HubStats::default();
        for (session, tx) in senders {
            match tx.try_send(notification.clone()) {
                Ok(()) => {
                    delivered += 1;
                    stats.delivered += 1;
                }
                Err(TrySendError::Full(_)) => {
                    stats.dropped_full += 1;
                    tracing::warn!(
                        session = %session,
                        verb = notification.verb(),
                        "notification queue full, dropping"
                    );
                }
                Err(TrySendError::Closed(_)) => {
                    stats.dropped_closed += 1;
                    tracing::debug!(session = %session, "session queue closed");
                }
            }
        }

        let mut totals = self.stats.write();
        totals.delivered += stats.delivered;
        totals.dropped_full += stats.dropped_full;
        totals.dropped_closed += stats.dropped_closed;

        tracing::trace!(verb = notification.verb(), delivered, "notification published");
        delivered
    }
}

impl Default for SignalHub {
    fn default() -> Self {
        Self::new(256)
    }
}
