//! Neighbour/layer selection policies.
//!
//! The round engine delegates two decisions to a strategy: who to contact
//! this round, and which layers each contact gets. Policies are pure with
//! respect to protocol state — everything they need arrives as arguments —
//! so they can be swapped without touching the engine.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, PoisonError};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::address::AgentAddress;
use crate::similarity::SimilarityVector;

/// Layer names assigned to each selected peer for one round.
pub type LayerAssignment = HashMap<AgentAddress, BTreeSet<String>>;

pub trait SelectionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Picks this round's recipients out of the currently-available
    /// neighbours. Empty input, empty output.
    fn select_neighbours(&self, available: &[AgentAddress]) -> Vec<AgentAddress>;

    /// Decides which layer names go to each selected peer. `layer_names`
    /// is the local model's full set; `peer_vectors` holds the latest
    /// similarity vector per peer, where one is known.
    fn assign_layers(
        &self,
        own_vector: Option<&SimilarityVector>,
        peer_vectors: &HashMap<AgentAddress, SimilarityVector>,
        selected: &[AgentAddress],
        layer_names: &BTreeSet<String>,
    ) -> LayerAssignment;
}

/// Reference policy: one uniformly-random available neighbour, full model.
pub struct RandomFullShare {
    rng: Mutex<StdRng>,
}

impl RandomFullShare {
    /// `seed` pins the neighbour choice for reproducible experiments.
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { rng: Mutex::new(rng) }
    }
}

impl SelectionStrategy for RandomFullShare {
    fn name(&self) -> &'static str {
        "random_full_share"
    }

    fn select_neighbours(&self, available: &[AgentAddress]) -> Vec<AgentAddress> {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        available.choose(&mut *rng).cloned().into_iter().collect()
    }

    fn assign_layers(
        &self,
        _own_vector: Option<&SimilarityVector>,
        _peer_vectors: &HashMap<AgentAddress, SimilarityVector>,
        selected: &[AgentAddress],
        layer_names: &BTreeSet<String>,
    ) -> LayerAssignment {
        selected
            .iter()
            .map(|peer| (peer.clone(), layer_names.clone()))
            .collect()
    }
}

/// Similarity-driven policy: contact the peers whose vectors diverge most
/// from ours, and send each one only the layers where the divergence
/// concentrates. Peers that never delivered a vector are skipped for the
/// round.
pub struct SimilarityPartialShare {
    max_neighbours: usize,
}

impl SimilarityPartialShare {
    pub fn new(max_neighbours: usize) -> Self {
        Self { max_neighbours: max_neighbours.max(1) }
    }

    fn divergence(own: &SimilarityVector, peer: &SimilarityVector) -> f32 {
        own.layers
            .iter()
            .filter_map(|(name, mine)| peer.layers.get(name).map(|theirs| (mine - theirs).abs()))
            .sum()
    }
}

impl SelectionStrategy for SimilarityPartialShare {
    fn name(&self) -> &'static str {
        "similarity_partial_share"
    }

    fn select_neighbours(&self, available: &[AgentAddress]) -> Vec<AgentAddress> {
        // Everyone is a candidate; ranking and the max_neighbours cap
        // happen in assign_layers where the vectors are in scope.
        available.to_vec()
    }

    fn assign_layers(
        &self,
        own_vector: Option<&SimilarityVector>,
        peer_vectors: &HashMap<AgentAddress, SimilarityVector>,
        selected: &[AgentAddress],
        layer_names: &BTreeSet<String>,
    ) -> LayerAssignment {
        let own = match own_vector {
            Some(own) => own,
            // No baseline yet (first round): fall back to full share.
            None => {
                return selected
                    .iter()
                    .map(|peer| (peer.clone(), layer_names.clone()))
                    .collect();
            }
        };

        // Rank candidates by total divergence, most divergent first.
        let mut ranked: Vec<(&AgentAddress, &SimilarityVector)> = selected
            .iter()
            .filter_map(|peer| peer_vectors.get(peer).map(|v| (peer, v)))
            .collect();
        ranked.sort_by(|a, b| {
            let da = Self::divergence(own, a.1);
            let db = Self::divergence(own, b.1);
            db.partial_cmp(&da).unwrap_or(std::cmp::Ordering::Equal)
        });
        ranked.truncate(self.max_neighbours);

        let mut assignment = LayerAssignment::new();
        for (peer, vector) in ranked {
            let diffs: Vec<(&String, f32)> = layer_names
                .iter()
                .filter_map(|name| {
                    match (own.layers.get(name), vector.layers.get(name)) {
                        (Some(mine), Some(theirs)) => Some((name, (mine - theirs).abs())),
                        _ => None,
                    }
                })
                .collect();
            if diffs.is_empty() {
                // Nothing comparable: send everything rather than nothing.
                assignment.insert(peer.clone(), layer_names.clone());
                continue;
            }
            let mean = diffs.iter().map(|(_, d)| d).sum::<f32>() / diffs.len() as f32;
            let mut picked: BTreeSet<String> = diffs
                .iter()
                .filter(|(_, d)| *d >= mean)
                .map(|(name, _)| (*name).clone())
                .collect();
            if picked.is_empty() {
                if let Some((name, _)) = diffs
                    .iter()
                    .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
                {
                    picked.insert((*name).clone());
                }
            }
            assignment.insert(peer.clone(), picked);
        }
        assignment
    }
}

/// Resolves a strategy from its configured name.
pub fn by_name(name: &str, seed: Option<u64>) -> Option<Box<dyn SelectionStrategy>> {
    match name {
        "random_full_share" | "acol" => Some(Box::new(RandomFullShare::new(seed))),
        "similarity_partial_share" => Some(Box::new(SimilarityPartialShare::new(1))),
        _ => None,
    }
}
