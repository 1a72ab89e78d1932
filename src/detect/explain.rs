//! Model-agnostic feature attribution by ablation.

use super::half_space::Scorable;

/// Ranks features by how much zeroing each one moves the score, and keeps
/// the top `n`. Needs nothing from the model beyond [`Scorable`].
pub fn top_n_ablation<S: Scorable>(
    model: &S,
    names: &[String],
    x: &[f64],
    n: usize,
) -> Vec<(String, f64)> {
    let base = model.score(x);
    let mut contributions: Vec<(String, f64)> = names
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let mut ablated = x.to_vec();
            ablated[i] = 0.0;
            (name.clone(), base - model.score(&ablated))
        })
        .collect();
    // Stable sort: ties keep column order, so output is deterministic.
    contributions.sort_by(|a, b| {
        b.1.abs()
            .partial_cmp(&a.1.abs())
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    contributions.truncate(n);
    contributions
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Toy model: score is a weighted sum, so the attribution of feature i
    /// is exactly `w[i] * x[i]`.
    struct Linear {
        weights: Vec<f64>,
    }

    impl Scorable for Linear {
        fn score(&self, x: &[f64]) -> f64 {
            self.weights.iter().zip(x).map(|(w, v)| w * v).sum()
        }
    }

    fn names(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("f{i}")).collect()
    }

    #[test]
    fn test_ranks_by_absolute_contribution() {
        let model = Linear {
            weights: vec![1.0, -10.0, 2.0],
        };
        let out = top_n_ablation(&model, &names(3), &[1.0, 1.0, 1.0], 2);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].0, "f1");
        assert!((out[0].1 - (-10.0)).abs() < 1e-12);
        assert_eq!(out[1].0, "f2");
    }

    #[test]
    fn test_zero_feature_contributes_nothing() {
        let model = Linear {
            weights: vec![5.0, 1.0],
        };
        let out = top_n_ablation(&model, &names(2), &[0.0, 1.0], 2);
        assert_eq!(out[0].0, "f1");
        assert_eq!(out[1].1, 0.0);
    }

    #[test]
    fn test_truncates_to_n() {
        let model = Linear {
            weights: vec![1.0; 5],
        };
        let out = top_n_ablation(&model, &names(5), &[1.0; 5], 3);
        assert_eq!(out.len(), 3);
    }
}
