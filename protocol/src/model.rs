//! Model access layer for consensus agents.
//!
//! Layers are flat f32 vectors keyed by name; the round engine only ever
//! sees this representation, so any model that can export and import named
//! tensors can participate. Ships a small logistic regressor trained on
//! seeded synthetic data so swarms run reproducibly with no dataset on disk.

use std::collections::{BTreeMap, BTreeSet};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Named layer tensors in deterministic (sorted) order.
pub type LayerMap = BTreeMap<String, Vec<f32>>;

/// Scalar metrics from a held-out evaluation pass.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub loss: f32,
    pub accuracy: f32,
}

/// What the round engine needs from a model. Implementations own their
/// parameters and data; the engine moves layer maps in and out.
pub trait ModelManager: Send {
    /// Names of all trainable layers, sorted.
    fn layer_names(&self) -> Vec<String>;

    /// Snapshot of every layer.
    fn export_layers(&self) -> LayerMap;

    /// Snapshot of the named layers this model actually has. Unknown names
    /// are skipped, so the result may cover fewer names than requested.
    fn export_named(&self, names: &BTreeSet<String>) -> LayerMap;

    /// Overwrites known layers with the given tensors. Names the model does
    /// not know are ignored; the caller filters and warns before importing.
    fn import_layers(&mut self, layers: LayerMap);

    /// Runs `epochs` passes over the training data. Returns the final
    /// training loss, or `None` when `epochs` is zero and training is
    /// skipped entirely.
    fn train(&mut self, epochs: u32) -> Option<f32>;

    /// Loss and accuracy on the held-out split.
    fn evaluate(&self) -> Evaluation;
}

/// Box-Muller transform for Gaussian samples.
fn randn(rng: &mut StdRng) -> f32 {
    let u1 = rng.gen::<f64>().max(1e-10); // avoid log(0)
    let u2 = rng.gen::<f64>();
    ((-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()) as f32
}

const WEIGHT_LAYER: &str = "linear.weight";
const BIAS_LAYER: &str = "linear.bias";

/// Logistic regressor on synthetic two-class data.
///
/// Every instance draws its own data from the seed, so two agents with
/// different seeds hold genuinely different local distributions — the same
/// situation federated averaging is meant to reconcile.
pub struct LinearModel {
    dim: usize,
    weight: Vec<f32>,
    bias: Vec<f32>,
    learning_rate: f32,
    train_x: Vec<Vec<f32>>,
    train_y: Vec<f32>,
    test_x: Vec<Vec<f32>>,
    test_y: Vec<f32>,
}

impl LinearModel {
    pub fn new(seed: u64, dim: usize, train_samples: usize, test_samples: usize) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);

        // Ground-truth separating plane for this agent's data.
        let true_w: Vec<f32> = (0..dim).map(|_| randn(&mut rng)).collect();
        let true_b = randn(&mut rng) * 0.1;

        let mut sample = |n: usize, rng: &mut StdRng| {
            let mut xs = Vec::with_capacity(n);
            let mut ys = Vec::with_capacity(n);
            for _ in 0..n {
                let x: Vec<f32> = (0..dim).map(|_| randn(rng)).collect();
                let margin: f32 = x.iter().zip(&true_w).map(|(a, b)| a * b).sum::<f32>()
                    + true_b
                    + randn(rng) * 0.1;
                xs.push(x);
                ys.push(if margin > 0.0 { 1.0 } else { 0.0 });
            }
            (xs, ys)
        };
        let (train_x, train_y) = sample(train_samples, &mut rng);
        let (test_x, test_y) = sample(test_samples, &mut rng);

        LinearModel {
            dim,
            weight: (0..dim).map(|_| randn(&mut rng) * 0.01).collect(),
            bias: vec![0.0],
            learning_rate: 0.1,
            train_x,
            train_y,
            test_x,
            test_y,
        }
    }

    fn predict(&self, x: &[f32]) -> f32 {
        let z: f32 = x.iter().zip(&self.weight).map(|(a, b)| a * b).sum::<f32>() + self.bias[0];
        1.0 / (1.0 + (-z).exp())
    }

    /// One full-batch gradient step. Returns the epoch's mean loss.
    fn step(&mut self) -> f32 {
        let n = self.train_x.len().max(1) as f32;
        let mut grad_w = vec![0.0f32; self.dim];
        let mut grad_b = 0.0f32;
        let mut loss = 0.0f32;

        for (x, &y) in self.train_x.iter().zip(&self.train_y) {
            let p = self.predict(x);
            let err = p - y;
            for (g, &xi) in grad_w.iter_mut().zip(x) {
                *g += err * xi;
            }
            grad_b += err;
            let p = p.clamp(1e-7, 1.0 - 1e-7);
            loss += -(y * p.ln() + (1.0 - y) * (1.0 - p).ln());
        }

        for (w, g) in self.weight.iter_mut().zip(&grad_w) {
            *w -= self.learning_rate * g / n;
        }
        self.bias[0] -= self.learning_rate * grad_b / n;
        loss / n
    }
}

impl ModelManager for LinearModel {
    fn layer_names(&self) -> Vec<String> {
        vec![BIAS_LAYER.to_string(), WEIGHT_LAYER.to_string()]
    }

    fn export_layers(&self) -> LayerMap {
        let mut layers = LayerMap::new();
        layers.insert(WEIGHT_LAYER.to_string(), self.weight.clone());
        layers.insert(BIAS_LAYER.to_string(), self.bias.clone());
        layers
    }

    fn export_named(&self, names: &BTreeSet<String>) -> LayerMap {
        self.export_layers()
            .into_iter()
            .filter(|(name, _)| names.contains(name))
            .collect()
    }

    fn import_layers(&mut self, layers: LayerMap) {
        for (name, tensor) in layers {
            match name.as_str() {
                WEIGHT_LAYER => self.weight = tensor,
                BIAS_LAYER => self.bias = tensor,
                _ => {}
            }
        }
    }

    fn train(&mut self, epochs: u32) -> Option<f32> {
        if epochs == 0 {
            return None;
        }
        let mut last = 0.0;
        for _ in 0..epochs {
            last = self.step();
        }
        Some(last)
    }

    fn evaluate(&self) -> Evaluation {
        let n = self.test_x.len().max(1) as f32;
        let mut loss = 0.0f32;
        let mut correct = 0usize;
        for (x, &y) in self.test_x.iter().zip(&self.test_y) {
            let p = self.predict(x);
            if (p > 0.5) == (y > 0.5) {
                correct += 1;
            }
            let p = p.clamp(1e-7, 1.0 - 1e-7);
            loss += -(y * p.ln() + (1.0 - y) * (1.0 - p).ln());
        }
        Evaluation {
            loss: loss / n,
            accuracy: correct as f32 / n,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_import_round_trip() {
        let mut model = LinearModel::new(7, 4, 16, 8);
        let snapshot = model.export_layers();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[WEIGHT_LAYER].len(), 4);
        assert_eq!(snapshot[BIAS_LAYER].len(), 1);

        model.train(3);
        assert_ne!(model.export_layers(), snapshot, "training should move weights");

        model.import_layers(snapshot.clone());
        assert_eq!(model.export_layers(), snapshot);
    }

    #[test]
    fn test_export_named_skips_unknown() {
        let model = LinearModel::new(1, 4, 8, 4);
        let names: BTreeSet<String> =
            [WEIGHT_LAYER.to_string(), "no_such.layer".to_string()].into();
        let subset = model.export_named(&names);
        assert_eq!(subset.len(), 1);
        assert!(subset.contains_key(WEIGHT_LAYER));
    }

    #[test]
    fn test_import_ignores_unknown_layer() {
        let mut model = LinearModel::new(2, 4, 8, 4);
        let before = model.export_layers();
        let mut foreign = LayerMap::new();
        foreign.insert("conv1.weight".to_string(), vec![1.0, 2.0]);
        model.import_layers(foreign);
        assert_eq!(model.export_layers(), before);
    }

    #[test]
    fn test_training_improves_loss() {
        let mut model = LinearModel::new(42, 8, 256, 128);
        let before = model.evaluate();
        model.train(50);
        let after = model.evaluate();
        assert!(
            after.loss < before.loss,
            "loss should drop: before={:.4} after={:.4}",
            before.loss,
            after.loss
        );
        assert!(after.accuracy > 0.7, "accuracy={:.3}", after.accuracy);
    }

    #[test]
    fn test_zero_epochs_skips_training() {
        let mut model = LinearModel::new(5, 4, 16, 8);
        let before = model.export_layers();
        assert_eq!(model.train(0), None);
        assert_eq!(model.export_layers(), before);
    }

    #[test]
    fn test_same_seed_same_model() {
        let a = LinearModel::new(9, 6, 32, 16);
        let b = LinearModel::new(9, 6, 32, 16);
        assert_eq!(a.export_layers(), b.export_layers());
        assert_eq!(a.evaluate(), b.evaluate());
    }
}
