//! Transport sessions
//!
//! A [`TransportSession`] stands for one connected client. It owns the
//! session's notification queue and checks that every peer it acts for
//! belongs to it. Closing the session (or losing the transport) makes every
//! peer it owns leave.

use std::collections::BTreeSet;

use bytes::Bytes;

use relaytree_core::{
    ChannelId, LinkId, LinkState, MessageKind, Notification, Peer, PeerId, RelayError,
    RelayResult, SessionId,
};
use relaytree_registry::{NotificationReceiver, PeerCriteria};

use crate::coordinator::{Coordinator, Joined};

/// One client's handle into the coordinator
pub struct TransportSession {
    id: SessionId,
    coordinator: Coordinator,
    notifications: NotificationReceiver,
}

impl TransportSession {
    pub(crate) fn new(id: SessionId, coordinator: Coordinator, notifications: NotificationReceiver) -> Self {
        Self {
            id,
            coordinator,
            notifications,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    pub async fn join(&self, channel: ChannelId, broadcaster: bool) -> RelayResult<Joined> {
        self.coordinator.join(self.id, channel, broadcaster).await
    }

    pub async fn send_negotiation_message(
        &self,
        link: LinkId,
        from: PeerId,
        kind: MessageKind,
        payload: Bytes,
    ) -> RelayResult<()> {
        self.authorize(from).await?;
        self.coordinator
            .send_negotiation_message(link, from, kind, payload)
            .await
    }

    pub async fn finalize(&self, link: LinkId, from: PeerId) -> RelayResult<LinkState> {
        self.authorize(from).await?;
        self.coordinator.finalize(link, from).await
    }

    pub async fn destroy_link(&self, link: LinkId, from: PeerId) -> RelayResult<()> {
        self.authorize(from).await?;
        self.coordinator.destroy_link(link, from).await
    }

    pub async fn leave(&self, peer: PeerId) -> RelayResult<BTreeSet<LinkId>> {
        self.authorize(peer).await?;
        self.coordinator.leave(peer).await
    }

    /// Peers this session owns, across all channels
    pub async fn peers(&self) -> RelayResult<Vec<Peer>> {
        self.coordinator
            .registry()
            .find_peers(&PeerCriteria::owned_by(self.id))
            .await
    }

    /// Next notification; `None` once the session is unregistered
    pub async fn recv(&mut self) -> Option<Notification> {
        self.notifications.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Notification> {
        self.notifications.try_recv().ok()
    }

    /// Everything queued right now
    pub fn drain(&mut self) -> Vec<Notification> {
        let mut out = Vec::new();
        while let Ok(n) = self.notifications.try_recv() {
            out.push(n);
        }
        out
    }

    /// End the session: every owned peer leaves, then the queue is dropped
    ///
    /// All peers are attempted; the first failure is returned.
    pub async fn close(self) -> RelayResult<BTreeSet<LinkId>> {
        let mut removed = BTreeSet::new();
        let mut first_error = None;

        let peers = match self.peers().await {
            Ok(peers) => peers,
            Err(e) => {
                tracing::error!(session = %self.id, error = %e, "could not list session peers");
                first_error.get_or_insert(e);
                Vec::new()
            }
        };

        for peer in peers {
            match self.coordinator.leave(peer.id).await {
                Ok(links) => removed.extend(links),
                // already gone through another path
                Err(RelayError::PeerNotFound(_)) => {}
                Err(e) => {
                    tracing::error!(session = %self.id, peer = %peer.id, error = %e, "peer teardown failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        self.coordinator.hub().unregister_session(self.id);
        tracing::info!(session = %self.id, removed = removed.len(), "session closed");

        match first_error {
            Some(e) => Err(e),
            None => Ok(removed),
        }
    }

    async fn authorize(&self, peer: PeerId) -> RelayResult<Peer> {
        let record = self.coordinator.peer(peer).await?;
        if record.session != self.id {
            return Err(RelayError::NotSessionOwner {
                peer,
                session: self.id,
            });
        }
        Ok(record)
    }
}
