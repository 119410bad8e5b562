use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use murmur_protocol::AgentAddress;

/// Domain part of every generated swarm address.
const SWARM_DOMAIN: &str = "swarm";

/// Neighbourhood shape of the spawned swarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Topology {
    /// Every agent neighbours every other agent.
    Complete,
    /// Each agent neighbours its predecessor and successor on a ring.
    Ring,
}

/// On-disk experiment description: how many agents, how they are wired, and
/// the round parameters each one runs with. Everything defaults to the
/// reference experiment, so `{}` is a valid file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Experiment {
    /// Run identifier baked into every agent address. Generated when absent.
    #[serde(default)]
    pub run_id: Option<String>,
    /// Selection strategy, resolved by name.
    #[serde(default = "default_algorithm")]
    pub algorithm: String,
    #[serde(default = "default_agents")]
    pub agents: usize,
    #[serde(default = "default_topology")]
    pub topology: Topology,
    /// `null` keeps the swarm running until it is signalled.
    #[serde(default = "default_max_rounds")]
    pub max_rounds: Option<u64>,
    #[serde(default = "default_consensus_iterations")]
    pub consensus_iterations: u32,
    #[serde(default = "default_training_epochs")]
    pub training_epochs: u32,
    /// Contributions that close a round early. Absent means one per
    /// neighbour, so a round can wait for the whole neighbourhood.
    #[serde(default)]
    pub max_order: Option<usize>,
    #[serde(default = "default_accept_timeout_secs")]
    pub accept_timeout_secs: u64,
    #[serde(default = "default_similarity_timeout_secs")]
    pub similarity_timeout_secs: u64,
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_model_dim")]
    pub model_dim: usize,
    #[serde(default = "default_train_samples")]
    pub train_samples: usize,
    #[serde(default = "default_test_samples")]
    pub test_samples: usize,
    /// Per-round metrics are written here after the run when set.
    #[serde(default)]
    pub metrics_csv: Option<PathBuf>,
}

fn default_algorithm() -> String {
    "random_full_share".to_string()
}

fn default_agents() -> usize {
    5
}

fn default_topology() -> Topology {
    Topology::Complete
}

fn default_max_rounds() -> Option<u64> {
    Some(70)
}

fn default_consensus_iterations() -> u32 {
    10
}

fn default_training_epochs() -> u32 {
    1
}

fn default_accept_timeout_secs() -> u64 {
    24 * 60 * 60
}

fn default_similarity_timeout_secs() -> u64 {
    5 * 60
}

fn default_max_message_size() -> usize {
    250_000
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

impl Default for Experiment {
    fn default() -> Self {
        Self {
            run_id: None,
            algorithm: default_algorithm(),
            agents: default_agents(),
            topology: default_topology(),
            max_rounds: default_max_rounds(),
            consensus_iterations: default_consensus_iterations(),
            training_epochs: default_training_epochs(),
            max_order: None,
            accept_timeout_secs: default_accept_timeout_secs(),
            similarity_timeout_secs: default_similarity_timeout_secs(),
            max_message_size: default_max_message_size(),
            seed: default_seed(),
            model_dim: default_model_dim(),
            train_samples: default_train_samples(),
            test_samples: default_test_samples(),
            metrics_csv: None,
        }
    }
}

impl Experiment {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read experiment file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("cannot parse experiment file {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.agents < 2 {
            bail!("experiment needs at least 2 agents, got {}", self.agents);
        }
        if let Some(order) = self.max_order {
            if order == 0 {
                bail!("max_order must be at least 1");
            }
            if order > self.agents - 1 {
                bail!(
                    "max_order {} exceeds the {} reachable peers",
                    order,
                    self.agents - 1
                );
            }
        }
        Ok(())
    }

    /// Addresses `a0__<run>@swarm` .. `a{n-1}__<run>@swarm`, one per agent.
    pub fn agent_addresses(&self, run: &str) -> Vec<AgentAddress> {
        (0..self.agents)
            .map(|i| AgentAddress::new(format!("a{i}__{run}"), SWARM_DOMAIN))
            .collect()
    }

    pub fn coordinator_address(run: &str) -> AgentAddress {
        AgentAddress::new(format!("coordinator__{run}"), SWARM_DOMAIN)
    }

    /// Neighbours of agent `index` under the experiment topology.
    pub fn neighbours_of(&self, index: usize, addresses: &[AgentAddress]) -> Vec<AgentAddress> {
        match self.topology {
            Topology::Complete => addresses
                .iter()
                .enumerate()
                .filter(|(other, _)| *other != index)
                .map(|(_, address)| address.clone())
                .collect(),
            Topology::Ring => {
                let n = addresses.len();
                let mut neighbours = vec![
                    addresses[(index + n - 1) % n].clone(),
                    addresses[(index + 1) % n].clone(),
                ];
                // A two-agent ring folds both sides onto the same peer.
                neighbours.dedup();
                neighbours
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_yields_reference_experiment() {
        let experiment: Experiment = serde_json::from_str("{}").unwrap();
        assert_eq!(experiment.agents, 5);
        assert_eq!(experiment.topology, Topology::Complete);
        assert_eq!(experiment.max_rounds, Some(70));
        assert_eq!(experiment.consensus_iterations, 10);
        assert_eq!(experiment.accept_timeout_secs, 24 * 60 * 60);
        assert_eq!(experiment.similarity_timeout_secs, 5 * 60);
        assert_eq!(experiment.max_message_size, 250_000);
        assert_eq!(experiment.seed, 13);
        assert!(experiment.max_order.is_none());
        assert!(experiment.run_id.is_none());
        experiment.validate().unwrap();
    }

    #[test]
    fn test_complete_topology_wires_everyone_to_everyone() {
        let experiment = Experiment {
            agents: 4,
            ..Experiment::default()
        };
        let addresses = experiment.agent_addresses("t");
        let neighbours = experiment.neighbours_of(1, &addresses);
        assert_eq!(neighbours.len(), 3);
        assert!(!neighbours.contains(&addresses[1]));
    }

    #[test]
    fn test_ring_topology_wires_both_sides() {
        let experiment = Experiment {
            agents: 4,
            topology: Topology::Ring,
            ..Experiment::default()
        };
        let addresses = experiment.agent_addresses("t");
        let neighbours = experiment.neighbours_of(0, &addresses);
        assert_eq!(neighbours, vec![addresses[3].clone(), addresses[1].clone()]);
    }

    #[test]
    fn test_two_agent_ring_has_one_neighbour() {
        let experiment = Experiment {
            agents: 2,
            topology: Topology::Ring,
            ..Experiment::default()
        };
        let addresses = experiment.agent_addresses("t");
        assert_eq!(experiment.neighbours_of(0, &addresses).len(), 1);
    }

    #[test]
    fn test_validation_rejects_degenerate_experiments() {
        let lonely = Experiment {
            agents: 1,
            ..Experiment::default()
        };
        assert!(lonely.validate().is_err());

        let greedy = Experiment {
            agents: 3,
            max_order: Some(3),
            ..Experiment::default()
        };
        assert!(greedy.validate().is_err());

        let zero = Experiment {
            max_order: Some(0),
            ..Experiment::default()
        };
        assert!(zero.validate().is_err());
    }
}
