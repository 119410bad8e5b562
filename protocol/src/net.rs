//! HTTP transport for nodes running as separate processes.
//!
//! Outbound traffic is POSTed straight to the peer node's server; inbound
//! traffic arrives through the [`NodeInbox`] that the node's HTTP handlers
//! feed. Both halves share one roster, so presence state stays consistent
//! no matter which side touched it last.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex, RwLock};

use crate::address::AgentAddress;
use crate::envelope::Envelope;
use crate::error::TransportError;
use crate::presence::{ContactRegistry, PresenceEvent, Subscription};
use crate::transport::Transport;

/// Presence verb carried between nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceAction {
    Subscribe,
    Subscribed,
    Available,
    Unavailable,
}

/// Wire form of a presence notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceMessage {
    pub action: PresenceAction,
    pub from: AgentAddress,
    pub sent_at: String,
}

impl PresenceMessage {
    pub fn new(action: PresenceAction, from: AgentAddress) -> Self {
        Self {
            action,
            from,
            sent_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Wire form of an envelope POST. The timestamp is informational only;
/// round timing is governed by the consensus deadline, not the clock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireEnvelope {
    pub envelope: Envelope,
    pub sent_at: String,
}

impl WireEnvelope {
    pub fn new(envelope: Envelope) -> Self {
        Self {
            envelope,
            sent_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Server-side half of the transport. The node's HTTP handlers decode the
/// wire payloads and push them through here.
#[derive(Clone)]
pub struct NodeInbox {
    envelopes: mpsc::UnboundedSender<Envelope>,
    presence: mpsc::UnboundedSender<PresenceEvent>,
    registry: Arc<RwLock<ContactRegistry>>,
}

impl NodeInbox {
    /// Hands a decoded envelope to the agent's receive loop.
    pub fn deliver_envelope(&self, message: WireEnvelope) -> Result<(), TransportError> {
        self.envelopes
            .send(message.envelope)
            .map_err(|_| TransportError::Closed)
    }

    /// Applies a presence notification to the roster, then wakes the
    /// presence listener. Mirrors what an in-process hub does on delivery.
    pub async fn deliver_presence(&self, message: PresenceMessage) -> Result<(), TransportError> {
        let from = message.from.bare();
        let event = {
            let mut registry = self.registry.write().await;
            match message.action {
                PresenceAction::Subscribe => {
                    registry.note_inbound_request(&from);
                    PresenceEvent::Subscribe { from }
                }
                PresenceAction::Subscribed => {
                    registry.note_outbound_granted(&from);
                    PresenceEvent::Subscribed { peer: from }
                }
                PresenceAction::Available => {
                    registry.set_available(&from, true);
                    PresenceEvent::Available { peer: from }
                }
                PresenceAction::Unavailable => {
                    registry.set_available(&from, false);
                    PresenceEvent::Unavailable { peer: from }
                }
            }
        };
        self.presence.send(event).map_err(|_| TransportError::Closed)
    }
}

/// Client half of the HTTP transport. One instance per node process.
pub struct HttpTransport {
    address: AgentAddress,
    http: reqwest::Client,
    token: Option<String>,
    directory: HashMap<AgentAddress, String>,
    registry: Arc<RwLock<ContactRegistry>>,
    inbox: Mutex<mpsc::UnboundedReceiver<Envelope>>,
    presence: Mutex<mpsc::UnboundedReceiver<PresenceEvent>>,
}

impl HttpTransport {
    /// Builds the client half plus the inbox the node's HTTP server feeds.
    /// `directory` maps each peer to its node server's base URL.
    pub fn new(
        address: AgentAddress,
        directory: HashMap<AgentAddress, String>,
        token: Option<String>,
    ) -> (Self, NodeInbox) {
        let (envelope_tx, envelope_rx) = mpsc::unbounded_channel();
        let (presence_tx, presence_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(RwLock::new(ContactRegistry::new()));
        let directory = directory
            .into_iter()
            .map(|(peer, url)| (peer.bare(), url.trim_end_matches('/').to_string()))
            .collect();
        let transport = Self {
            address: address.bare(),
            http: reqwest::Client::new(),
            token,
            directory,
            registry: registry.clone(),
            inbox: Mutex::new(envelope_rx),
            presence: Mutex::new(presence_rx),
        };
        let inbox = NodeInbox {
            envelopes: envelope_tx,
            presence: presence_tx,
            registry,
        };
        (transport, inbox)
    }

    fn auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.header("Authorization", format!("Bearer {token}")),
            None => req,
        }
    }

    fn base_url(&self, peer: &AgentAddress) -> Result<&str, TransportError> {
        self.directory
            .get(&peer.bare())
            .map(String::as_str)
            .ok_or_else(|| TransportError::UnknownPeer(peer.to_string()))
    }

    async fn post<T: Serialize>(
        &self,
        peer: &AgentAddress,
        path: &str,
        body: &T,
    ) -> Result<(), TransportError> {
        let url = format!("{}{}", self.base_url(peer)?, path);
        let response = self
            .auth(self.http.post(&url))
            .json(body)
            .send()
            .await
            .map_err(|source| TransportError::Http {
                peer: peer.to_string(),
                source,
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Rejected {
                peer: peer.to_string(),
                reason: format!("HTTP {status}"),
            });
        }
        Ok(())
    }

    async fn post_presence(
        &self,
        peer: &AgentAddress,
        action: PresenceAction,
    ) -> Result<(), TransportError> {
        let message = PresenceMessage::new(action, self.address.clone());
        self.post(peer, "/presence", &message).await
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn local_address(&self) -> &AgentAddress {
        &self.address
    }

    async fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        let to = envelope.to.clone();
        self.post(&to, "/envelope", &WireEnvelope::new(envelope)).await
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
        self.post_presence(peer, PresenceAction::Subscribe).await
    }

    async fn approve(&self, peer: &AgentAddress) -> Result<(), TransportError> {
        self.registry.write().await.note_inbound_granted(peer);
        self.post_presence(peer, PresenceAction::Subscribed).await
    }

    async fn set_available(&self, available: bool) -> Result<(), TransportError> {
        let action = if available {
            PresenceAction::Available
        } else {
            PresenceAction::Unavailable
        };
        let peers: Vec<AgentAddress> = self
            .directory
            .keys()
            .filter(|peer| **peer != self.address)
            .cloned()
            .collect();
        for peer in peers {
            // An unreachable peer just misses this announcement.
            if let Err(error) = self.post_presence(&peer, action).await {
                tracing::debug!(peer = %peer, %error, "availability announcement failed");
            }
        }
        Ok(())
    }
}
