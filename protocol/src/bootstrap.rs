//! Presence bootstrap: negotiate mutual subscriptions before any round runs.
//!
//! The machine itself is pure (events in, actions out) so the negotiation
//! logic is testable without a transport; [`negotiate_presence`] is the
//! async driver that applies its actions and re-polls until ready.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::watch;

use crate::address::AgentAddress;
use crate::presence::{PresenceEvent, Subscription};
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapState {
    /// Sending subscription requests to every required peer.
    Negotiating,
    /// Requests sent; re-polling until every required peer is mutual.
    WaitingForCompletion,
    /// All required peers mutual. Terminal: the machine never runs again.
    Ready,
}

impl BootstrapState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BootstrapState::Negotiating => "negotiating",
            BootstrapState::WaitingForCompletion => "waiting_for_completion",
            BootstrapState::Ready => "ready",
        }
    }
}

/// Side effects the driver must perform on behalf of the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapAction {
    SendSubscription(AgentAddress),
    Approve(AgentAddress),
}

/// Subscription negotiation as a transition function. Unreachable peers are
/// "not yet", never fatal: the machine re-emits requests until every
/// required peer reports mutual status.
#[derive(Debug)]
pub struct BootstrapMachine {
    required: Vec<AgentAddress>,
    state: BootstrapState,
}

impl BootstrapMachine {
    pub fn new(required: Vec<AgentAddress>) -> Self {
        Self {
            required: required.into_iter().map(|p| p.bare()).collect(),
            state: BootstrapState::Negotiating,
        }
    }

    pub fn state(&self) -> BootstrapState {
        self.state
    }

    pub fn required(&self) -> &[AgentAddress] {
        &self.required
    }

    /// First tick: request a subscription from every required peer, then
    /// move to the waiting state.
    pub fn start(&mut self) -> Vec<BootstrapAction> {
        let actions = self
            .required
            .iter()
            .map(|peer| BootstrapAction::SendSubscription(peer.clone()))
            .collect();
        if self.state == BootstrapState::Negotiating {
            self.state = BootstrapState::WaitingForCompletion;
        }
        actions
    }

    /// Inbound requests are approved unconditionally, and answered with a
    /// counter-request so the relationship can become mutual even when the
    /// requester is not in our own required list.
    pub fn on_event(&self, event: &PresenceEvent) -> Vec<BootstrapAction> {
        match event {
            PresenceEvent::Subscribe { from } => vec![
                BootstrapAction::Approve(from.clone()),
                BootstrapAction::SendSubscription(from.clone()),
            ],
            _ => Vec::new(),
        }
    }

    /// Requests worth repeating this tick: one per required peer still
    /// below mutual status.
    pub fn retry_actions(
        &self,
        statuses: &HashMap<AgentAddress, Subscription>,
    ) -> Vec<BootstrapAction> {
        self.required
            .iter()
            .filter(|peer| statuses.get(peer) != Some(&Subscription::Both))
            .map(|peer| BootstrapAction::SendSubscription(peer.clone()))
            .collect()
    }

    /// Re-checks completion against the latest statuses. Transitions to
    /// `Ready` only when every required peer is mutual; once reached, the
    /// state sticks.
    pub fn evaluate(&mut self, statuses: &HashMap<AgentAddress, Subscription>) -> BootstrapState {
        if self.state == BootstrapState::WaitingForCompletion {
            let complete = self
                .required
                .iter()
                .all(|peer| statuses.get(peer) == Some(&Subscription::Both));
            if complete {
                self.state = BootstrapState::Ready;
            }
        }
        self.state
    }
}

async fn apply_actions(transport: &dyn Transport, actions: Vec<BootstrapAction>) {
    for action in actions {
        let result = match &action {
            BootstrapAction::SendSubscription(peer) => transport.subscribe(peer).await,
            BootstrapAction::Approve(peer) => transport.approve(peer).await,
        };
        if let Err(error) = result {
            // Unreachable now, retried next tick.
            tracing::debug!(?action, %error, "presence action failed");
        }
    }
}

/// Drives the machine against a live transport until every required peer is
/// mutual, or until shutdown. Returns the final state, `Ready` on success.
pub async fn negotiate_presence(
    transport: &dyn Transport,
    required: &[AgentAddress],
    poll_interval: Duration,
    shutdown: &mut watch::Receiver<bool>,
) -> BootstrapState {
    let mut machine = BootstrapMachine::new(required.to_vec());
    tracing::info!(
        peers = machine.required().len(),
        "presence negotiation started"
    );
    apply_actions(transport, machine.start()).await;

    loop {
        while let Some(event) = transport.next_presence_event(Duration::ZERO).await {
            apply_actions(transport, machine.on_event(&event)).await;
        }

        let mut statuses = HashMap::new();
        for peer in machine.required() {
            statuses.insert(peer.clone(), transport.subscription_status(peer).await);
        }
        if machine.evaluate(&statuses) == BootstrapState::Ready {
            tracing::info!("presence negotiation complete, node is ready");
            return BootstrapState::Ready;
        }
        for (peer, status) in &statuses {
            if *status != Subscription::Both {
                tracing::debug!(peer = %peer, status = status.as_str(), "contact not mutual yet");
            }
        }
        apply_actions(transport, machine.retry_actions(&statuses)).await;

        tokio::select! {
            _ = tokio::time::sleep(poll_interval) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    tracing::info!(state = machine.state().as_str(), "presence negotiation interrupted");
                    return machine.state();
                }
            }
        }
    }
}

/// Presence side of a coordinator node: announce availability, approve
/// every subscription request and counter with its own, until shutdown.
/// A coordinator holds no model and drives no rounds; it only anchors the
/// roster so agents can find each other.
pub async fn run_coordinator(
    transport: &dyn Transport,
    poll_interval: Duration,
    shutdown: &mut watch::Receiver<bool>,
) {
    if let Err(error) = transport.set_available(true).await {
        tracing::warn!(%error, "coordinator could not announce availability");
    }
    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            event = transport.next_presence_event(poll_interval) => {
                if let Some(PresenceEvent::Subscribe { from }) = event {
                    if let Err(error) = transport.approve(&from).await {
                        tracing::debug!(peer = %from, %error, "approve failed");
                    }
                    if let Err(error) = transport.subscribe(&from).await {
                        tracing::debug!(peer = %from, %error, "counter-subscription failed");
                    }
                }
            }
        }
    }
    let _ = transport.set_available(false).await;
}
