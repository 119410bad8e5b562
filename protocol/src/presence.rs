//! Presence and subscription bookkeeping.
//!
//! Mirrors a roster: each contact has a two-directional subscription and an
//! availability flag. Transports own a [`ContactRegistry`] and surface
//! changes as [`PresenceEvent`]s.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::address::AgentAddress;

/// Distilled subscription status between this node and a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Subscription {
    /// No relationship in either direction.
    None,
    /// At least one direction requested or granted, but not yet mutual.
    Pending,
    /// Mutual: both sides granted. Required before rounds may start.
    Both,
}

impl Subscription {
    pub fn as_str(&self) -> &'static str {
        match self {
            Subscription::None => "none",
            Subscription::Pending => "pending",
            Subscription::Both => "both",
        }
    }
}

/// Subscription/availability notifications delivered by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceEvent {
    /// A peer asks to subscribe to us and awaits approval.
    Subscribe { from: AgentAddress },
    /// A peer approved our earlier subscription request.
    Subscribed { peer: AgentAddress },
    Available { peer: AgentAddress },
    Unavailable { peer: AgentAddress },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Side {
    #[default]
    None,
    Requested,
    Granted,
}

#[derive(Debug, Clone, Default)]
struct Contact {
    /// Our subscription to the peer: Requested when we asked, Granted when
    /// the peer approved.
    outbound: Side,
    /// The peer's subscription to us: Requested when they asked, Granted
    /// when we approved.
    inbound: Side,
    available: bool,
}

impl Contact {
    fn status(&self) -> Subscription {
        match (self.outbound, self.inbound) {
            (Side::Granted, Side::Granted) => Subscription::Both,
            (Side::None, Side::None) => Subscription::None,
            _ => Subscription::Pending,
        }
    }
}

/// One node's contact list. Keyed by bare address, so a peer reconnecting
/// under a new resource keeps its roster entry. Plain data: callers wrap it
/// in their own lock.
#[derive(Debug, Default)]
pub struct ContactRegistry {
    contacts: HashMap<AgentAddress, Contact>,
}

impl ContactRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&mut self, peer: &AgentAddress) -> &mut Contact {
        self.contacts.entry(peer.bare()).or_default()
    }

    /// We sent a subscription request to `peer`.
    pub fn note_outbound_request(&mut self, peer: &AgentAddress) {
        let contact = self.entry(peer);
        if contact.outbound == Side::None {
            contact.outbound = Side::Requested;
        }
    }

    /// `peer` sent a subscription request to us.
    pub fn note_inbound_request(&mut self, peer: &AgentAddress) {
        let contact = self.entry(peer);
        if contact.inbound == Side::None {
            contact.inbound = Side::Requested;
        }
    }

    /// `peer` approved our request.
    pub fn note_outbound_granted(&mut self, peer: &AgentAddress) {
        self.entry(peer).outbound = Side::Granted;
    }

    /// We approved `peer`'s request.
    pub fn note_inbound_granted(&mut self, peer: &AgentAddress) {
        self.entry(peer).inbound = Side::Granted;
    }

    pub fn set_available(&mut self, peer: &AgentAddress, available: bool) {
        self.entry(peer).available = available;
    }

    pub fn status(&self, peer: &AgentAddress) -> Subscription {
        self.contacts
            .get(&peer.bare())
            .map(Contact::status)
            .unwrap_or(Subscription::None)
    }

    pub fn is_available(&self, peer: &AgentAddress) -> bool {
        self.contacts
            .get(&peer.bare())
            .map(|c| c.available)
            .unwrap_or(false)
    }

    /// Contacts currently marked available, bare form.
    pub fn available_peers(&self) -> Vec<AgentAddress> {
        let mut peers: Vec<AgentAddress> = self
            .contacts
            .iter()
            .filter(|(_, c)| c.available)
            .map(|(peer, _)| peer.clone())
            .collect();
        peers.sort();
        peers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> AgentAddress {
        s.parse().unwrap()
    }

    #[test]
    fn test_unknown_peer_is_none() {
        let registry = ContactRegistry::new();
        assert_eq!(registry.status(&addr("a1@x")), Subscription::None);
        assert!(!registry.is_available(&addr("a1@x")));
    }

    #[test]
    fn test_mutual_requires_both_grants() {
        let mut registry = ContactRegistry::new();
        let peer = addr("a1@x");

        registry.note_outbound_request(&peer);
        assert_eq!(registry.status(&peer), Subscription::Pending);

        registry.note_outbound_granted(&peer);
        assert_eq!(registry.status(&peer), Subscription::Pending);

        registry.note_inbound_request(&peer);
        registry.note_inbound_granted(&peer);
        assert_eq!(registry.status(&peer), Subscription::Both);
    }

    #[test]
    fn test_available_peers_sorted_and_filtered() {
        let mut registry = ContactRegistry::new();
        registry.set_available(&addr("b@x"), true);
        registry.set_available(&addr("a@x"), true);
        registry.set_available(&addr("c@x"), false);
        assert_eq!(registry.available_peers(), vec![addr("a@x"), addr("b@x")]);
    }

    #[test]
    fn test_registry_keys_by_bare_address() {
        let mut registry = ContactRegistry::new();
        registry.set_available(&addr("a1@x/res1"), true);
        assert!(registry.is_available(&addr("a1@x")));
        registry.set_available(&addr("a1@x/res2"), false);
        assert!(!registry.is_available(&addr("a1@x/res1")));
    }

}
