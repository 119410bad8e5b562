//! Messaging substrate abstraction.
//!
//! Agents only ever talk to a [`Transport`]: fire-and-forget envelope
//! delivery, presence events, and subscription state. [`ChannelNetwork`]
//! is the in-process implementation backing swarm experiments and tests;
//! the HTTP implementation lives in [`crate::net`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, RwLock};

use crate::address::AgentAddress;
use crate::envelope::Envelope;
use crate::error::TransportError;
use crate::presence::{ContactRegistry, PresenceEvent, Subscription};

/// Point-to-point messaging with presence. Delivery is at-most-once; a
/// failed send skips the affected peer and is never fatal to a round.
#[async_trait]
pub trait Transport: Send + Sync {
    fn local_address(&self) -> &AgentAddress;

    /// Delivers one envelope to `envelope.to`. Fire-and-forget.
    async fn send(&self, envelope: Envelope) -> Result<(), TransportError>;

    /// Next inbound envelope, or `None` once `timeout` elapses.
    async fn receive(&self, timeout: Duration) -> Option<Envelope>;

    /// Next subscription/availability notification, or `None` on timeout.
    async fn next_presence_event(&self, timeout: Duration) -> Option<PresenceEvent>;

    /// Contacts currently announcing availability.
    async fn available_peers(&self) -> Vec<AgentAddress>;

    async fn subscription_status(&self, peer: &AgentAddress) -> Subscription;

    /// Asks `peer` for a subscription. Idempotent; repeat while negotiating.
    async fn subscribe(&self, peer: &AgentAddress) -> Result<(), TransportError>;

    /// Approves `peer`'s pending subscription request.
    async fn approve(&self, peer: &AgentAddress) -> Result<(), TransportError>;

    /// Announces this node's availability to the network.
    async fn set_available(&self, available: bool) -> Result<(), TransportError>;
}

struct NodeHandle {
    inbox: mpsc::UnboundedSender<Envelope>,
    presence: mpsc::UnboundedSender<PresenceEvent>,
    registry: Arc<RwLock<ContactRegistry>>,
    available: bool,
}

#[derive(Default)]
struct NetworkInner {
    nodes: HashMap<AgentAddress, NodeHandle>,
}

/// In-process message hub. Every registered node gets its own inbox and
/// roster; envelopes and presence signals are routed through the hub, so
/// agents share no memory beyond this struct.
#[derive(Clone, Default)]
pub struct ChannelNetwork {
    inner: Arc<RwLock<NetworkInner>>,
}

impl ChannelNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node and returns its transport endpoint. Nodes registered
    /// later are seeded with the availability the network already knows.
    pub async fn register(&self, address: AgentAddress) -> ChannelTransport {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (presence_tx, presence_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(RwLock::new(ContactRegistry::new()));

        let mut inner = self.inner.write().await;
        {
            let mut own = registry.write().await;
            for (peer, handle) in &inner.nodes {
                if handle.available {
                    own.set_available(peer, true);
                }
            }
        }
        inner.nodes.insert(
            address.bare(),
            NodeHandle {
                inbox: inbox_tx,
                presence: presence_tx,
                registry: registry.clone(),
                available: false,
            },
        );

        ChannelTransport {
            address: address.bare(),
            network: self.inner.clone(),
            registry,
            inbox: Mutex::new(inbox_rx),
            presence: Mutex::new(presence_rx),
        }
    }

    /// Detaches a node; pending sends to it start failing.
    pub async fn remove(&self, address: &AgentAddress) {
        self.inner.write().await.nodes.remove(&address.bare());
    }
}

/// One node's endpoint on a [`ChannelNetwork`].
pub struct ChannelTransport {
    address: AgentAddress,
    network: Arc<RwLock<NetworkInner>>,
    registry: Arc<RwLock<ContactRegistry>>,
    inbox: Mutex<mpsc::UnboundedReceiver<Envelope>>,
    presence: Mutex<mpsc::UnboundedReceiver<PresenceEvent>>,
}

impl ChannelTransport {
    /// Pushes `event` to `peer`'s presence stream, updating the peer-side
    /// roster the way a server-delivered stanza would.
    async fn deliver_presence(
        inner: &NetworkInner,
        peer: &AgentAddress,
        event: PresenceEvent,
    ) -> Result<(), TransportError> {
        let handle = inner
            .nodes
            .get(&peer.bare())
            .ok_or_else(|| TransportError::UnknownPeer(peer.to_string()))?;
        {
            let mut registry = handle.registry.write().await;
            match &event {
                PresenceEvent::Subscribe { from } => registry.note_inbound_request(from),
                PresenceEvent::Subscribed { peer } => registry.note_outbound_granted(peer),
                PresenceEvent::Available { peer } => registry.set_available(peer, true),
                PresenceEvent::Unavailable { peer } => registry.set_available(peer, false),
            }
        }
        handle
            .presence
            .send(event)
            .map_err(|_| TransportError::Closed)
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    fn local_address(&self) -> &AgentAddress {
        &self.address
    }

    async fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        let inner = self.network.read().await;
        let handle = inner
            .nodes
            .get(&envelope.to.bare())
            .ok_or_else(|| TransportError::UnknownPeer(envelope.to.to_string()))?;
        handle.inbox.send(envelope).map_err(|_| TransportError::Closed)
    }

    async fn receive(&self, timeout: Duration) -> Option<Envelope> {
        let mut inbox = self.inbox.lock().await;
        tokio::time::timeout(timeout, inbox.recv()).await.ok().flatten()
    }

    async fn next_presence_event(&self, timeout: Duration) -> Option<PresenceEvent> {
        let mut presence = self.presence.lock().await;
        tokio::time::timeout(timeout, presence.recv()).await.ok().flatten()
    }

    async fn available_peers(&self) -> Vec<AgentAddress> {
        self.registry.read().await.available_peers()
    }

    async fn subscription_status(&self, peer: &AgentAddress) -> Subscription {
        self.registry.read().await.status(peer)
    }

    async fn subscribe(&self, peer: &AgentAddress) -> Result<(), TransportError> {
        self.registry.write().await.note_outbound_request(peer);
        let inner = self.network.read().await;
        Self::deliver_presence(
            &inner,
            peer,
            PresenceEvent::Subscribe { from: self.address.clone() },
        )
        .await
    }

    async fn approve(&self, peer: &AgentAddress) -> Result<(), TransportError> {
        self.registry.write().await.note_inbound_granted(peer);
        let inner = self.network.read().await;
        Self::deliver_presence(
            &inner,
            peer,
            PresenceEvent::Subscribed { peer: self.address.clone() },
        )
        .await
    }

    async fn set_available(&self, available: bool) -> Result<(), TransportError> {
        let mut inner = self.network.write().await;
        if let Some(handle) = inner.nodes.get_mut(&self.address) {
            handle.available = available;
        }
        let event = if available {
            PresenceEvent::Available { peer: self.address.clone() }
        } else {
            PresenceEvent::Unavailable { peer: self.address.clone() }
        };
        let peers: Vec<AgentAddress> = inner
            .nodes
            .keys()
            .filter(|p| **p != self.address)
            .cloned()
            .collect();
        for peer in peers {
            // A peer shutting down mid-broadcast is not our problem.
            let _ = Self::deliver_presence(&inner, &peer, event.clone()).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Conversation;

    fn addr(s: &str) -> AgentAddress {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_send_and_receive() {
        let network = ChannelNetwork::new();
        let a = network.register(addr("a0@swarm")).await;
        let b = network.register(addr("a1@swarm")).await;

        let env = Envelope::new(addr("a0@swarm"), addr("a1@swarm"), Conversation::Layers, "hi");
        a.send(env).await.unwrap();
        let got = b.receive(Duration::from_millis(100)).await.unwrap();
        assert_eq!(got.body, "hi");
        assert_eq!(got.sender, addr("a0@swarm"));
    }

    #[tokio::test]
    async fn test_send_unknown_peer_fails() {
        let network = ChannelNetwork::new();
        let a = network.register(addr("a0@swarm")).await;
        let env = Envelope::new(addr("a0@swarm"), addr("ghost@swarm"), Conversation::Layers, "x");
        assert!(matches!(a.send(env).await, Err(TransportError::UnknownPeer(_))));
    }

    #[tokio::test]
    async fn test_receive_times_out_empty() {
        let network = ChannelNetwork::new();
        let a = network.register(addr("a0@swarm")).await;
        assert!(a.receive(Duration::from_millis(10)).await.is_none());
    }

    #[tokio::test]
    async fn test_subscription_handshake_reaches_both() {
        let network = ChannelNetwork::new();
        let a = network.register(addr("a0@swarm")).await;
        let b = network.register(addr("a1@swarm")).await;
        let (a_addr, b_addr) = (addr("a0@swarm"), addr("a1@swarm"));

        a.subscribe(&b_addr).await.unwrap();
        assert_eq!(a.subscription_status(&b_addr).await, Subscription::Pending);
        let event = b.next_presence_event(Duration::from_millis(100)).await.unwrap();
        assert_eq!(event, PresenceEvent::Subscribe { from: a_addr.clone() });

        b.approve(&a_addr).await.unwrap();
        b.subscribe(&a_addr).await.unwrap();
        a.approve(&b_addr).await.unwrap();

        assert_eq!(a.subscription_status(&b_addr).await, Subscription::Both);
        assert_eq!(b.subscription_status(&a_addr).await, Subscription::Both);
    }

    #[tokio::test]
    async fn test_availability_broadcast_and_withdrawal() {
        let network = ChannelNetwork::new();
        let a = network.register(addr("a0@swarm")).await;
        let b = network.register(addr("a1@swarm")).await;

        b.set_available(true).await.unwrap();
        assert_eq!(a.available_peers().await, vec![addr("a1@swarm")]);
        assert_eq!(
            a.next_presence_event(Duration::from_millis(100)).await,
            Some(PresenceEvent::Available { peer: addr("a1@swarm") })
        );

        b.set_available(false).await.unwrap();
        assert!(a.available_peers().await.is_empty());
    }

    #[tokio::test]
    async fn test_late_join_sees_existing_availability() {
        let network = ChannelNetwork::new();
        let a = network.register(addr("a0@swarm")).await;
        a.set_available(true).await.unwrap();

        let b = network.register(addr("a1@swarm")).await;
        assert_eq!(b.available_peers().await, vec![addr("a0@swarm")]);
    }

    #[tokio::test]
    async fn test_removed_peer_rejects_sends() {
        let network = ChannelNetwork::new();
        let a = network.register(addr("a0@swarm")).await;
        let _b = network.register(addr("a1@swarm")).await;
        network.remove(&addr("a1@swarm")).await;

        let env = Envelope::new(addr("a0@swarm"), addr("a1@swarm"), Conversation::Layers, "x");
        assert!(a.send(env).await.is_err());
    }
}
