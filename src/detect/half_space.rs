//! Online half-space trees ensemble (Tan, Ting & Liu) with a running
//! min-max scaling stage in front.
//!
//! Tree structure is drawn once from a seeded RNG when the model is built,
//! so two models constructed with the same seed and feature count behave
//! identically. Each node keeps two mass profiles: the reference profile
//! scored against, and the latest profile being accumulated; they swap every
//! `window_size` learned examples.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Anything that can score a feature vector. Higher means more anomalous.
/// The ablation explainer depends only on this, not on model internals.
pub trait Scorable {
    fn score(&self, x: &[f64]) -> f64;
}

/// Online per-feature min-max normalisation into [0, 1].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MinMaxScaler {
    mins: Vec<f64>,
    maxs: Vec<f64>,
    seen: bool,
}

impl MinMaxScaler {
    fn new(n_features: usize) -> Self {
        Self {
            mins: vec![0.0; n_features],
            maxs: vec![0.0; n_features],
            seen: false,
        }
    }

    fn learn(&mut self, x: &[f64]) {
        if !self.seen {
            self.mins.copy_from_slice(x);
            self.maxs.copy_from_slice(x);
            self.seen = true;
            return;
        }
        for (i, v) in x.iter().enumerate() {
            if *v < self.mins[i] {
                self.mins[i] = *v;
            }
            if *v > self.maxs[i] {
                self.maxs[i] = *v;
            }
        }
    }

    fn transform(&self, x: &[f64]) -> Vec<f64> {
        x.iter()
            .enumerate()
            .map(|(i, v)| {
                let range = self.maxs[i] - self.mins[i];
                if range == 0.0 {
                    0.0
                } else {
                    ((v - self.mins[i]) / range).clamp(0.0, 1.0)
                }
            })
            .collect()
    }
}

/// One perfect binary tree over a randomised workspace. Nodes are stored in
/// heap order: children of `i` are `2i + 1` and `2i + 2`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Tree {
    split_feature: Vec<usize>,
    split_value: Vec<f64>,
    reference_mass: Vec<f64>,
    latest_mass: Vec<f64>,
}

impl Tree {
    fn build(rng: &mut StdRng, n_features: usize, height: usize) -> Self {
        // Randomised per-tree workspace around each feature's unit range.
        let mut lo = vec![0.0; n_features];
        let mut hi = vec![0.0; n_features];
        for f in 0..n_features {
            let sq: f64 = rng.random();
            let span = 2.0 * sq.max(1.0 - sq);
            lo[f] = sq - span;
            hi[f] = sq + span;
        }

        let n_nodes = (1usize << (height + 1)) - 1;
        let mut tree = Tree {
            split_feature: vec![0; n_nodes],
            split_value: vec![0.0; n_nodes],
            reference_mass: vec![0.0; n_nodes],
            latest_mass: vec![0.0; n_nodes],
        };
        tree.split_node(rng, 0, 0, height, &mut lo, &mut hi, n_features);
        tree
    }

    #[allow(clippy::too_many_arguments)]
    fn split_node(
        &mut self,
        rng: &mut StdRng,
        node: usize,
        depth: usize,
        height: usize,
        lo: &mut [f64],
        hi: &mut [f64],
        n_features: usize,
    ) {
        if depth == height {
            return;
        }
        let q = rng.random_range(0..n_features);
        let mid = (lo[q] + hi[q]) / 2.0;
        self.split_feature[node] = q;
        self.split_value[node] = mid;

        let saved_hi = hi[q];
        hi[q] = mid;
        self.split_node(rng, 2 * node + 1, depth + 1, height, lo, hi, n_features);
        hi[q] = saved_hi;

        let saved_lo = lo[q];
        lo[q] = mid;
        self.split_node(rng, 2 * node + 2, depth + 1, height, lo, hi, n_features);
        lo[q] = saved_lo;
    }

    fn learn(&mut self, x: &[f64], height: usize) {
        let mut node = 0;
        for depth in 0..=height {
            self.latest_mass[node] += 1.0;
            if depth == height {
                break;
            }
            node = if x[self.split_feature[node]] < self.split_value[node] {
                2 * node + 1
            } else {
                2 * node + 2
            };
        }
    }

    /// Mass-weighted depth of the traversal, cut short once the reference
    /// mass drops below `size_limit`.
    fn score(&self, x: &[f64], height: usize, size_limit: f64) -> f64 {
        let mut node = 0;
        for depth in 0..=height {
            let mass = self.reference_mass[node];
            if depth == height || mass < size_limit {
                return mass * (1u64 << depth) as f64;
            }
            node = if x[self.split_feature[node]] < self.split_value[node] {
                2 * node + 1
            } else {
                2 * node + 2
            };
        }
        0.0
    }

    fn swap_masses(&mut self) {
        self.reference_mass.copy_from_slice(&self.latest_mass);
        self.latest_mass.fill(0.0);
    }
}

/// The full model: scaler stage plus the tree ensemble.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HalfSpacePipeline {
    scaler: MinMaxScaler,
    trees: Vec<Tree>,
    height: usize,
    window_size: usize,
    size_limit: f64,
    learned_in_window: usize,
}

impl HalfSpacePipeline {
    pub fn new(
        n_features: usize,
        n_trees: usize,
        height: usize,
        window_size: usize,
        size_limit: usize,
        seed: u64,
    ) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let trees = (0..n_trees)
            .map(|_| Tree::build(&mut rng, n_features.max(1), height))
            .collect();
        Self {
            scaler: MinMaxScaler::new(n_features),
            trees,
            height,
            window_size,
            size_limit: size_limit as f64,
            learned_in_window: 0,
        }
    }

    /// Absorbs one example: scaler first, then the tree mass profiles.
    pub fn learn(&mut self, x: &[f64]) {
        self.scaler.learn(x);
        let scaled = self.scaler.transform(x);
        for tree in &mut self.trees {
            tree.learn(&scaled, self.height);
        }
        self.learned_in_window += 1;
        if self.learned_in_window >= self.window_size {
            for tree in &mut self.trees {
                tree.swap_masses();
            }
            self.learned_in_window = 0;
        }
    }
}

impl Scorable for HalfSpacePipeline {
    /// Normalised anomaly score in [0, 1]; higher = more anomalous.
    fn score(&self, x: &[f64]) -> f64 {
        if self.trees.is_empty() {
            return 0.0;
        }
        let scaled = self.scaler.transform(x);
        let total: f64 = self
            .trees
            .iter()
            .map(|t| t.score(&scaled, self.height, self.size_limit))
            .sum();
        let max_total =
            self.trees.len() as f64 * self.window_size as f64 * (1u64 << self.height) as f64;
        (1.0 - total / max_total).clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipeline() -> HalfSpacePipeline {
        HalfSpacePipeline::new(3, 10, 4, 8, 1, 42)
    }

    #[test]
    fn test_same_seed_same_structure() {
        let a = pipeline();
        let b = pipeline();
        let x = [0.5, 0.1, 0.9];
        assert_eq!(a.score(&x), b.score(&x));
    }

    #[test]
    fn test_unseen_model_scores_maximal() {
        // No reference mass yet: everything is maximally anomalous, which is
        // harmless because the detector suppresses flags during warmup.
        assert_eq!(pipeline().score(&[0.2, 0.2, 0.2]), 1.0);
    }

    #[test]
    fn test_frequent_point_scores_lower_than_rare_after_window() {
        let mut p = pipeline();
        // Each learned value is the running max, so after the first example
        // every example scales to 1.0 per feature and the mass piles up on
        // that path. The first example scales to 0.0 and stays rare.
        for i in 0..8 {
            let v = 0.4 + (i as f64) * 0.01;
            p.learn(&[v, v, v]);
        }
        let frequent = p.score(&[0.47, 0.47, 0.47]);
        let rare = p.score(&[0.40, 0.40, 0.40]);
        assert!(frequent < rare, "frequent={frequent} rare={rare}");
    }

    #[test]
    fn test_scaler_handles_constant_feature() {
        let mut s = MinMaxScaler::new(2);
        s.learn(&[5.0, 1.0]);
        s.learn(&[5.0, 3.0]);
        let t = s.transform(&[5.0, 2.0]);
        assert_eq!(t[0], 0.0);
        assert_eq!(t[1], 0.5);
    }

    #[test]
    fn test_serde_roundtrip_preserves_scores() {
        let mut p = pipeline();
        for i in 0..20 {
            p.learn(&[i as f64 * 0.05, 0.3, 0.7]);
        }
        let json = serde_json::to_string(&p).unwrap();
        let q: HalfSpacePipeline = serde_json::from_str(&json).unwrap();
        let x = [0.33, 0.44, 0.55];
        assert_eq!(p.score(&x), q.score(&x));
    }
}
