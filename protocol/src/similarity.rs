//! Similarity exchange: per-layer scalar features agents trade to decide
//! who to talk to and which layers to send.
//!
//! The manager only stores and hands out vectors; all network I/O stays
//! with the round engine.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, RwLock};
use tokio::time::Instant;

use crate::address::AgentAddress;
use crate::error::SimilarityError;
use crate::model::LayerMap;

/// Per-layer scalar summary of a model snapshot. `request_reply` asks the
/// receiver to send its own vector back (bidirectional exchange).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityVector {
    pub layers: BTreeMap<String, f32>,
    #[serde(default)]
    pub request_reply: bool,
}

impl SimilarityVector {
    pub fn new(layers: BTreeMap<String, f32>) -> Self {
        Self { layers, request_reply: false }
    }

    pub fn with_reply_request(mut self, request_reply: bool) -> Self {
        self.request_reply = request_reply;
        self
    }
}

/// Distance between two layer sets, one scalar per layer.
///
/// Every key of `a` must exist in `b`; a hole fails the single comparison
/// with [`SimilarityError::MissingLayer`], never the whole round.
pub trait SimilarityFunction: Send + Sync {
    fn name(&self) -> &'static str;

    fn compute(&self, a: &LayerMap, b: &LayerMap) -> Result<SimilarityVector, SimilarityError>;
}

fn ensure_covers(a: &LayerMap, b: &LayerMap) -> Result<(), SimilarityError> {
    for name in a.keys() {
        if !b.contains_key(name) {
            return Err(SimilarityError::MissingLayer { layer: name.clone() });
        }
    }
    Ok(())
}

/// Per-layer Euclidean norm of the element-wise difference. Tensors of
/// unequal length are compared as if the shorter were zero-padded.
#[derive(Debug, Clone, Copy, Default)]
pub struct EuclideanDistance;

impl SimilarityFunction for EuclideanDistance {
    fn name(&self) -> &'static str {
        "euclidean"
    }

    fn compute(&self, a: &LayerMap, b: &LayerMap) -> Result<SimilarityVector, SimilarityError> {
        ensure_covers(a, b)?;
        let mut layers = BTreeMap::new();
        for (name, ta) in a {
            let tb = &b[name];
            let mut sum = 0.0f64;
            for i in 0..ta.len().max(tb.len()) {
                let x = *ta.get(i).unwrap_or(&0.0) as f64;
                let y = *tb.get(i).unwrap_or(&0.0) as f64;
                sum += (x - y) * (x - y);
            }
            layers.insert(name.clone(), sum.sqrt() as f32);
        }
        Ok(SimilarityVector::new(layers))
    }
}

/// Degenerate baseline: every layer scores 1.0. Useful to neutralize
/// similarity-driven policies in experiments.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ones;

impl SimilarityFunction for Ones {
    fn name(&self) -> &'static str {
        "ones"
    }

    fn compute(&self, a: &LayerMap, b: &LayerMap) -> Result<SimilarityVector, SimilarityError> {
        ensure_covers(a, b)?;
        Ok(SimilarityVector::new(
            a.keys().map(|name| (name.clone(), 1.0)).collect(),
        ))
    }
}

#[derive(Debug, Default)]
struct SimilarityState {
    own: Option<SimilarityVector>,
    peers: HashMap<AgentAddress, SimilarityVector>,
}

/// Holds the node's own vector and the latest vector received from each
/// peer. Written by the receive loop, read by the round engine and the
/// selection strategy; a peer's entry is overwritten on every receipt.
pub struct SimilarityManager {
    function: Arc<dyn SimilarityFunction>,
    wait_timeout: Duration,
    state: RwLock<SimilarityState>,
    changed: Notify,
}

impl SimilarityManager {
    pub fn new(function: Arc<dyn SimilarityFunction>, wait_timeout: Duration) -> Self {
        Self {
            function,
            wait_timeout,
            state: RwLock::new(SimilarityState::default()),
            changed: Notify::new(),
        }
    }

    /// Default wait applied when the round engine asks for peer vectors.
    pub fn wait_timeout(&self) -> Duration {
        self.wait_timeout
    }

    pub fn function(&self) -> &dyn SimilarityFunction {
        self.function.as_ref()
    }

    /// Recomputes the node's own vector from `current` against `baseline`
    /// and stores it. Returns the vector so the caller can put it on the
    /// wire.
    pub async fn publish_own(
        &self,
        current: &LayerMap,
        baseline: &LayerMap,
    ) -> Result<SimilarityVector, SimilarityError> {
        let vector = self.function.compute(current, baseline)?;
        self.state.write().await.own = Some(vector.clone());
        Ok(vector)
    }

    pub async fn own(&self) -> Option<SimilarityVector> {
        self.state.read().await.own.clone()
    }

    /// Stores `vector` as the peer's latest, waking any `await_vector` call.
    /// Keyed by the bare address, so resource changes do not fork a peer.
    pub async fn record_peer(&self, peer: AgentAddress, vector: SimilarityVector) {
        self.state.write().await.peers.insert(peer.bare(), vector);
        self.changed.notify_waiters();
    }

    pub async fn peer_vector(&self, peer: &AgentAddress) -> Option<SimilarityVector> {
        self.state.read().await.peers.get(&peer.bare()).cloned()
    }

    /// Snapshot of all known peer vectors.
    pub async fn peer_vectors(&self) -> HashMap<AgentAddress, SimilarityVector> {
        self.state.read().await.peers.clone()
    }

    /// Waits until a vector for `peer` is known or `timeout` elapses.
    /// `None` means the peer stays out of this round's similarity-driven
    /// decisions; it is not an error.
    pub async fn await_vector(
        &self,
        peer: &AgentAddress,
        timeout: Duration,
    ) -> Option<SimilarityVector> {
        let deadline = Instant::now() + timeout;
        loop {
            // Register before checking so a concurrent record cannot slip
            // between the check and the wait.
            let notified = self.changed.notified();
            if let Some(vector) = self.peer_vector(peer).await {
                return Some(vector);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let _ = tokio::time::timeout(deadline - now, notified).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layers(pairs: &[(&str, &[f32])]) -> LayerMap {
        pairs
            .iter()
            .map(|(name, t)| (name.to_string(), t.to_vec()))
            .collect()
    }

    #[test]
    fn test_euclidean_self_is_zero() {
        let a = layers(&[("l1", &[1.0, 2.0, 3.0]), ("l2", &[-4.0])]);
        let v = EuclideanDistance.compute(&a, &a).unwrap();
        assert!(v.layers.values().all(|&d| d == 0.0), "{:?}", v.layers);
    }

    #[test]
    fn test_euclidean_known_distance() {
        let a = layers(&[("l1", &[0.0, 0.0])]);
        let b = layers(&[("l1", &[3.0, 4.0])]);
        let v = EuclideanDistance.compute(&a, &b).unwrap();
        assert!((v.layers["l1"] - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_missing_layer_fails_comparison() {
        let a = layers(&[("l1", &[1.0]), ("l2", &[2.0])]);
        let b = layers(&[("l1", &[1.0])]);
        let err = EuclideanDistance.compute(&a, &b).unwrap_err();
        match err {
            SimilarityError::MissingLayer { layer } => assert_eq!(layer, "l2"),
        }
    }

    #[test]
    fn test_ones_is_constant() {
        let a = layers(&[("l1", &[9.0]), ("l2", &[0.0, 0.0])]);
        let v = Ones.compute(&a, &a).unwrap();
        assert_eq!(v.layers.len(), 2);
        assert!(v.layers.values().all(|&d| d == 1.0));
    }

    #[tokio::test]
    async fn test_await_vector_returns_recorded() {
        let manager = SimilarityManager::new(Arc::new(Ones), Duration::from_millis(50));
        let peer: AgentAddress = "a1@localhost".parse().unwrap();
        manager
            .record_peer(peer.clone(), SimilarityVector::new(BTreeMap::new()))
            .await;
        let got = manager.await_vector(&peer, Duration::from_millis(50)).await;
        assert!(got.is_some());
    }

    #[tokio::test]
    async fn test_await_vector_times_out() {
        let manager = SimilarityManager::new(Arc::new(Ones), Duration::from_millis(10));
        let peer: AgentAddress = "a1@localhost".parse().unwrap();
        let got = manager.await_vector(&peer, Duration::from_millis(10)).await;
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn test_await_vector_wakes_on_record() {
        let manager = Arc::new(SimilarityManager::new(
            Arc::new(Ones),
            Duration::from_secs(5),
        ));
        let peer: AgentAddress = "a1@localhost".parse().unwrap();

        let waiter = {
            let manager = manager.clone();
            let peer = peer.clone();
            tokio::spawn(async move { manager.await_vector(&peer, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        manager
            .record_peer(peer, SimilarityVector::new(BTreeMap::new()))
            .await;
        let got = waiter.await.unwrap();
        assert!(got.is_some());
    }

    #[tokio::test]
    async fn test_record_peer_keys_by_bare_address() {
        let manager = SimilarityManager::new(Arc::new(Ones), Duration::from_millis(10));
        let full: AgentAddress = "a1@localhost/session42".parse().unwrap();
        let bare: AgentAddress = "a1@localhost".parse().unwrap();
        manager
            .record_peer(full, SimilarityVector::new(BTreeMap::new()))
            .await;
        assert!(manager.peer_vector(&bare).await.is_some());
    }
}
