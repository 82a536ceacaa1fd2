//! Per-link negotiation task
//!
//! Every reserved link gets one supervising task. The task owns the link's
//! negotiation progress and waits, step by step, for the next expected input:
//!
//! ```text
//!   AwaitingOffer ──offer──▶ AwaitingAnswer ──answer──▶ AwaitingFinalize ──established──▶ done
//! ```
//!
//! Each step is bounded by the negotiation timeout. On timeout or explicit
//! cancellation the link is destroyed unless it already reached
//! `established`. The task never blocks the caller: inputs are queued with
//! `try_send` on a small inbox.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use relaytree_core::{LinkId, LinkState, MessageKind};

use crate::machine::ConnectionStateMachine;

const INBOX_CAPACITY: usize = 32;

/// What the task is waiting for
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NegotiationPhase {
    AwaitingOffer,
    AwaitingAnswer,
    AwaitingFinalize,
}

impl NegotiationPhase {
    /// Phase after a relayed message of `kind`; candidates never move it
    fn after(self, kind: MessageKind) -> Self {
        match (self, kind) {
            (NegotiationPhase::AwaitingOffer, MessageKind::Offer) => NegotiationPhase::AwaitingAnswer,
            (_, MessageKind::Answer) => NegotiationPhase::AwaitingFinalize,
            (phase, _) => phase,
        }
    }
}

/// Input fed to a link task
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkInput {
    /// A negotiation message was relayed over the link
    Relayed(MessageKind),
    /// The link's stored state changed
    Transitioned(LinkState),
    /// Abandon the negotiation
    Cancel,
    /// The link was removed elsewhere
    Destroyed,
}

/// How a link task ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkOutcome {
    Established,
    TimedOut(NegotiationPhase),
    Cancelled,
    Destroyed,
    /// Every input handle was dropped
    Detached,
}

/// Handle to a running link task
#[derive(Debug)]
pub struct LinkTask {
    link: LinkId,
    inbox: mpsc::Sender<LinkInput>,
    handle: JoinHandle<LinkOutcome>,
}

impl LinkTask {
    /// Spawn the task supervising `link`
    ///
    /// `timeout` bounds each phase; `None` waits indefinitely.
    pub fn spawn(
        link: LinkId,
        machine: ConnectionStateMachine,
        timeout: Option<Duration>,
    ) -> Self {
        let (inbox, rx) = mpsc::channel(INBOX_CAPACITY);
        let handle = tokio::spawn(run(link, rx, machine, timeout));
        Self { link, inbox, handle }
    }

    pub fn link(&self) -> LinkId {
        self.link
    }

    /// Queue an input; returns false if the task is gone or its inbox is full
    pub fn notify(&self, input: LinkInput) -> bool {
        match self.inbox.try_send(input) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(link = %self.link, input = ?input, "link task inbox full");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the task to end
    pub async fn join(self) -> Option<LinkOutcome> {
        drop(self.inbox);
        self.handle.await.ok()
    }
}

async fn run(
    link: LinkId,
    mut rx: mpsc::Receiver<LinkInput>,
    machine: ConnectionStateMachine,
    timeout: Option<Duration>,
) -> LinkOutcome {
    let mut phase = NegotiationPhase::AwaitingOffer;
    let mut deadline = timeout.map(|t| Instant::now() + t);

    let outcome = loop {
        let input = match deadline {
            Some(at) => match tokio::time::timeout_at(at, rx.recv()).await {
                Ok(input) => input,
                Err(_) => break LinkOutcome::TimedOut(phase),
            },
            None => rx.recv().await,
        };

        match input {
            Some(LinkInput::Relayed(kind)) => {
                let next = phase.after(kind);
                if next != phase {
                    tracing::trace!(link = %link, from = ?phase, to = ?next, "negotiation step");
                    phase = next;
                    deadline = timeout.map(|t| Instant::now() + t);
                }
            }
            Some(LinkInput::Transitioned(LinkState::Established)) => break LinkOutcome::Established,
            Some(LinkInput::Transitioned(state)) => {
                if state.rank() >= LinkState::InitEstablished.rank()
                    && phase != NegotiationPhase::AwaitingFinalize
                {
                    phase = NegotiationPhase::AwaitingFinalize;
                    deadline = timeout.map(|t| Instant::now() + t);
                }
            }
            Some(LinkInput::Cancel) => break LinkOutcome::Cancelled,
            Some(LinkInput::Destroyed) => break LinkOutcome::Destroyed,
            None => break LinkOutcome::Detached,
        }
    };

    if matches!(outcome, LinkOutcome::TimedOut(_) | LinkOutcome::Cancelled) {
        match machine.destroy_unestablished(link).await {
            Ok(Some(_)) => tracing::info!(link = %link, outcome = ?outcome, "abandoned link destroyed"),
            Ok(None) => {}
            Err(e) => tracing::error!(link = %link, error = %e, "failed to destroy abandoned link"),
        }
    } else {
        tracing::debug!(link = %link, outcome = ?outcome, "link task finished");
    }

    outcome
}
