//! Signaling relay
//!
//! Forwards opaque negotiation payloads between the two parties of a link.
//! Relaying also subscribes both parties' sessions to the link, so a session
//! that shows up late still sees every state change from then on.

use bytes::Bytes;

use relaytree_core::{LinkId, LinkState, MessageKind, PeerConnection, PeerId, RelayError, RelayResult};
use relaytree_registry::PeerCriteria;

use crate::machine::ConnectionStateMachine;

/// Result of one relayed message
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Relayed {
    /// The link after any `reserved` -> `connecting` step
    pub link: PeerConnection,
    /// Sessions the payload was queued for
    pub delivered: usize,
}

/// Routes negotiation messages over a link
#[derive(Clone)]
pub struct SignalingRelay {
    machine: ConnectionStateMachine,
}

impl SignalingRelay {
    pub fn new(machine: ConnectionStateMachine) -> Self {
        Self { machine }
    }

    /// Relay `payload` from `from` to the other side of `link`
    ///
    /// The first message on a `reserved` link moves it to `connecting`.
    /// Delivery is at-most-once; nothing is queued for retry here.
    pub async fn relay_message(
        &self,
        link: LinkId,
        from: PeerId,
        kind: MessageKind,
        payload: Bytes,
    ) -> RelayResult<Relayed> {
        let record = self.machine.get(link).await?;
        let other = record
            .opposite(from)
            .ok_or(RelayError::NotLinkParty { peer: from, link })?;

        let registry = self.machine.registry();
        let hub = self.machine.hub();

        let sender = registry
            .find_peer(&PeerCriteria::by_id(from))
            .await?
            .ok_or(RelayError::PeerNotFound(from))?;
        hub.subscribe_link(link, sender.session);

        match registry.find_peer(&PeerCriteria::by_id(other)).await? {
            Some(receiver) => hub.subscribe_link(link, receiver.session),
            None => tracing::warn!(link = %link, peer = %other, "relay target has no peer record"),
        }

        let record = if record.state == LinkState::Reserved {
            self.machine.advance_to_connecting(link).await?
        } else {
            record
        };

        let delivered = hub.relay_message(link, from, sender.session, kind, payload);
        tracing::debug!(link = %link, from = %from, kind = %kind, delivered, "relayed message");

        Ok(Relayed {
            link: record,
            delivered,
        })
    }
}
