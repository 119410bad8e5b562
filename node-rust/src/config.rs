use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use murmur_protocol::{AgentAddress, AgentConfig};

/// One reachable peer: its swarm address and its node server's base URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerEntry {
    pub address: AgentAddress,
    pub url: String,
}

/// On-disk node configuration. Consensus knobs default to the reference
/// deployment values; only the identity, the listen address and the peer
/// directory are mandatory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub address: AgentAddress,
    /// Bind address of this node's HTTP server, e.g. "0.0.0.0:7500".
    pub listen: String,
    /// Bearer token shared by the swarm. Absent means auth is disabled.
    #[serde(default)]
    pub token: Option<String>,
    /// Consensus neighbours.
    pub peers: Vec<PeerEntry>,
    /// Presence anchor. When set, the node waits for mutual subscriptions
    /// with every peer and the coordinator before its first round.
    #[serde(default)]
    pub coordinator: Option<PeerEntry>,

    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    #[serde(default = "default_max_order")]
    pub max_order: usize,
    #[serde(default = "default_accept_timeout_secs")]
    pub accept_timeout_secs: u64,
    #[serde(default = "default_consensus_iterations")]
    pub consensus_iterations: u32,
    /// `null` keeps the node running until it is signalled.
    #[serde(default = "default_max_rounds")]
    pub max_rounds: Option<u64>,
    #[serde(default = "default_training_epochs")]
    pub training_epochs: u32,
    #[serde(default = "default_similarity_timeout_secs")]
    pub similarity_timeout_secs: u64,

    #[serde(default = "default_strategy")]
    pub strategy: String,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_model_dim")]
    pub model_dim: usize,
    #[serde(default = "default_train_samples")]
    pub train_samples: usize,
    #[serde(default = "default_test_samples")]
    pub test_samples: usize,
}

fn default_max_message_size() -> usize {
    250_000
}

fn default_max_order() -> usize {
    1
}

fn default_accept_timeout_secs() -> u64 {
    24 * 60 * 60
}

fn default_consensus_iterations() -> u32 {
    10
}

fn default_max_rounds() -> Option<u64> {
    Some(70)
}

fn default_training_epochs() -> u32 {
    1
}

fn default_similarity_timeout_secs() -> u64 {
    5 * 60
}

fn default_strategy() -> String {
    "random_full_share".to_string()
}

fn default_seed() -> u64 {
    13
}

fn default_model_dim() -> usize {
    16
}

fn default_train_samples() -> usize {
    256
}

fn default_test_samples() -> usize {
    128
}

impl NodeConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read node config {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("cannot parse node config {}", path.display()))
    }

    /// Peer directory for the HTTP transport, coordinator included.
    pub fn directory(&self) -> HashMap<AgentAddress, String> {
        let mut directory: HashMap<AgentAddress, String> = self
            .peers
            .iter()
            .map(|peer| (peer.address.clone(), peer.url.clone()))
            .collect();
        if let Some(coordinator) = &self.coordinator {
            directory.insert(coordinator.address.clone(), coordinator.url.clone());
        }
        directory
    }

    pub fn agent_config(&self) -> AgentConfig {
        let mut config = AgentConfig::new(self.address.clone());
        config.neighbours = self.peers.iter().map(|peer| peer.address.clone()).collect();
        config.coordinator = self
            .coordinator
            .as_ref()
            .map(|coordinator| coordinator.address.clone());
        config.max_message_size = self.max_message_size;
        config.max_order = self.max_order;
        config.accept_timeout = Duration::from_secs(self.accept_timeout_secs);
        config.consensus_iterations = self.consensus_iterations;
        config.max_rounds = self.max_rounds;
        config.training_epochs = self.training_epochs;
        config.similarity_timeout = Duration::from_secs(self.similarity_timeout_secs);
        config
    }
}
