//! Probabilistic margin ranking losses
//!
//! A soft variant of margin ranking loss: the hinge is replaced by a
//! sigmoid so borderline pairs contribute smoothly, and every pair is
//! weighted by the smaller of its two confidences so noisy evidence is
//! discounted:
//!
//! ```text
//! confidences = min(positive_confidences, negative_confidences)
//! pairwise    = positive_ranks - negative_ranks
//! adjusted    = -target * pairwise + margin
//! loss        = mean(1 / (1 + exp(f(adjusted))) * confidences)
//! ```
//!
//! `f` is a scaling: the generic loss uses `f(x) = -x` (a pair that clears
//! the margin decisively contributes a probability near zero); the
//! cosine-aware loss uses `f(x) = -400x + 6`, tuned so cosine differences
//! above ~0.01 are penalized with probability > 0.1.

use embedtune_core::{Error, Result};

use crate::features::FineTuningFeatures;
use crate::graph::RankGradients;

/// A ranking loss over extracted features
pub trait RankingLoss: Send + Sync {
    /// Loss value for a feature set
    fn forward(&self, features: &FineTuningFeatures) -> f32;

    /// Loss value plus its gradient w.r.t. the rank tensors
    fn forward_backward(&self, features: &FineTuningFeatures) -> (f32, RankGradients);

    /// Update the margin between runs
    fn set_margin(&mut self, margin: f32);

    /// Clone into a fresh box (losses are cloned per run)
    fn clone_box(&self) -> Box<dyn RankingLoss>;
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Shared forward/backward over a scaling `f` and its derivative
///
/// `loss_i = 1 / (1 + exp(f(adjusted_i)))`. Returns the loss and
/// `d loss / d positive_ranks` (the negative-rank gradient is its
/// negation).
fn prob_margin(
    features: &FineTuningFeatures,
    margin: f32,
    scale: impl Fn(f32) -> f32,
    scale_derivative: f32,
) -> (f32, RankGradients) {
    let n = features.len();
    if n == 0 || features.positives_pending() {
        return (0.0, RankGradients::default());
    }
    let mut total = 0.0_f32;
    let mut d_positive = vec![0.0_f32; n];
    let mut d_negative = vec![0.0_f32; n];
    for i in 0..n {
        let confidence = features.positive_confidences[i].min(features.negative_confidences[i]);
        let pairwise = features.positive_ranks[i] - features.negative_ranks[i];
        let adjusted = -features.target[i] * pairwise + margin;
        let z = scale(adjusted);
        let s = sigmoid(-z);
        total += s * confidence;

        // d loss_i / d pos = conf * s(1-s) * f'(adjusted) * target / n
        let upstream =
            confidence * s * (1.0 - s) * scale_derivative * features.target[i] / n as f32;
        d_positive[i] = upstream;
        d_negative[i] = -upstream;
    }
    (
        total / n as f32,
        RankGradients {
            positive: d_positive,
            negative: d_negative,
        },
    )
}

/// Generic probabilistic margin ranking loss, `f(x) = -x`
#[derive(Debug, Clone)]
pub struct ProbMarginRankingLoss {
    margin: f32,
}

impl ProbMarginRankingLoss {
    /// Create with the given margin
    pub fn new(margin: f32) -> Result<Self> {
        if margin < 0.0 {
            return Err(Error::validation("margin must be non-negative"));
        }
        Ok(ProbMarginRankingLoss { margin })
    }
}

impl Default for ProbMarginRankingLoss {
    fn default() -> Self {
        ProbMarginRankingLoss { margin: 1.0 }
    }
}

impl RankingLoss for ProbMarginRankingLoss {
    fn forward(&self, features: &FineTuningFeatures) -> f32 {
        self.forward_backward(features).0
    }

    fn forward_backward(&self, features: &FineTuningFeatures) -> (f32, RankGradients) {
        prob_margin(features, self.margin, |x| -x, -1.0)
    }

    fn set_margin(&mut self, margin: f32) {
        self.margin = margin;
    }

    fn clone_box(&self) -> Box<dyn RankingLoss> {
        Box::new(self.clone())
    }
}

/// Cosine-aware probabilistic margin ranking loss, `f(x) = -400x + 6`
#[derive(Debug, Clone)]
pub struct CosineProbMarginRankingLoss {
    margin: f32,
}

impl CosineProbMarginRankingLoss {
    /// Create with the given margin
    pub fn new(margin: f32) -> Result<Self> {
        if margin < 0.0 {
            return Err(Error::validation("margin must be non-negative"));
        }
        Ok(CosineProbMarginRankingLoss { margin })
    }
}

impl Default for CosineProbMarginRankingLoss {
    fn default() -> Self {
        CosineProbMarginRankingLoss { margin: 1.0 }
    }
}

impl RankingLoss for CosineProbMarginRankingLoss {
    fn forward(&self, features: &FineTuningFeatures) -> f32 {
        self.forward_backward(features).0
    }

    fn forward_backward(&self, features: &FineTuningFeatures) -> (f32, RankGradients) {
        prob_margin(features, self.margin, |x| -400.0 * x + 6.0, -400.0)
    }

    fn set_margin(&mut self, margin: f32) {
        self.margin = margin;
    }

    fn clone_box(&self) -> Box<dyn RankingLoss> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn features(pos: &[f32], neg: &[f32], confidences: f32) -> FineTuningFeatures {
        FineTuningFeatures::from_raw(
            pos.to_vec(),
            neg.to_vec(),
            vec![1.0; neg.len()],
            vec![confidences; pos.len()],
            vec![confidences; neg.len()],
        )
        .unwrap()
    }

    #[test]
    fn test_generic_loss_known_value() {
        // pairwise = 0.2, margin = 1.0 -> adjusted = 0.8
        // 1 / (1 + exp(-0.8)) = 0.6899745
        let f = features(&[0.7], &[0.5], 1.0);
        let loss = ProbMarginRankingLoss::new(1.0).unwrap().forward(&f);
        assert!((loss - 0.689_974_5).abs() < 1e-4, "loss = {loss}");
    }

    #[test]
    fn test_loss_scales_with_confidence() {
        let full = features(&[0.7], &[0.5], 1.0);
        let half = features(&[0.7], &[0.5], 0.5);
        let loss_fn = ProbMarginRankingLoss::default();
        assert!((loss_fn.forward(&half) - loss_fn.forward(&full) * 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_min_confidence_is_used() {
        let mut f = features(&[0.7], &[0.5], 1.0);
        f.negative_confidences = vec![0.25];
        let loss_fn = ProbMarginRankingLoss::default();
        let quarter = loss_fn.forward(&f);
        let full = loss_fn.forward(&features(&[0.7], &[0.5], 1.0));
        assert!((quarter - full * 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_wider_separation_means_lower_loss() {
        let loss_fn = ProbMarginRankingLoss::default();
        let tight = loss_fn.forward(&features(&[0.6], &[0.5], 1.0));
        let wide = loss_fn.forward(&features(&[0.95], &[0.1], 1.0));
        assert!(wide < tight);
    }

    #[test]
    fn test_set_margin_changes_loss() {
        let f = features(&[0.7], &[0.5], 1.0);
        let mut loss_fn = ProbMarginRankingLoss::default();
        let before = loss_fn.forward(&f);
        loss_fn.set_margin(0.0);
        let after = loss_fn.forward(&f);
        assert!(after < before);
    }

    #[test]
    fn test_empty_and_pending_features_yield_zero() {
        let loss_fn = ProbMarginRankingLoss::default();
        assert_eq!(loss_fn.forward(&FineTuningFeatures::default()), 0.0);

        let pending = FineTuningFeatures::from_raw(
            vec![],
            vec![0.5],
            vec![1.0],
            vec![],
            vec![1.0],
        )
        .unwrap();
        let (loss, grads) = loss_fn.forward_backward(&pending);
        assert_eq!(loss, 0.0);
        assert!(grads.positive.is_empty());
    }

    #[test]
    fn test_gradient_matches_finite_difference() {
        let loss_fn = ProbMarginRankingLoss::default();
        let base = features(&[0.7, 0.4], &[0.5, 0.6], 0.8);
        let (_, grads) = loss_fn.forward_backward(&base);

        let eps = 1e-3_f32;
        for i in 0..2 {
            let mut plus = base.clone();
            plus.positive_ranks[i] += eps;
            let mut minus = base.clone();
            minus.positive_ranks[i] -= eps;
            let numeric = (loss_fn.forward(&plus) - loss_fn.forward(&minus)) / (2.0 * eps);
            assert!(
                (grads.positive[i] - numeric).abs() < 1e-4,
                "d_pos[{i}]: analytic {} vs numeric {}",
                grads.positive[i],
                numeric
            );
            assert!((grads.negative[i] + grads.positive[i]).abs() < 1e-7);
        }
    }

    #[test]
    fn test_cosine_loss_penalizes_small_differences() {
        // A cosine difference of 0.015 against margin 0 should already be
        // penalized noticeably under the -400x + 6 scaling
        let f = FineTuningFeatures::from_raw(
            vec![0.5],
            vec![0.515],
            vec![1.0],
            vec![1.0],
            vec![1.0],
        )
        .unwrap();
        let mut loss_fn = CosineProbMarginRankingLoss::default();
        loss_fn.set_margin(0.0);
        let loss = loss_fn.forward(&f);
        assert!(loss > 0.1, "loss = {loss}");
    }

    #[test]
    fn test_cosine_gradient_matches_finite_difference() {
        let loss_fn = CosineProbMarginRankingLoss::new(0.01).unwrap();
        let base = features(&[0.502], &[0.5], 1.0);
        let (_, grads) = loss_fn.forward_backward(&base);

        let eps = 1e-4_f32;
        let mut plus = base.clone();
        plus.positive_ranks[0] += eps;
        let mut minus = base.clone();
        minus.positive_ranks[0] -= eps;
        let numeric = (loss_fn.forward(&plus) - loss_fn.forward(&minus)) / (2.0 * eps);
        assert!(
            (grads.positive[0] - numeric).abs() < 0.05 * numeric.abs().max(1.0),
            "analytic {} vs numeric {}",
            grads.positive[0],
            numeric
        );
    }

    #[test]
    fn test_negative_margin_rejected() {
        assert!(ProbMarginRankingLoss::new(-0.1).is_err());
        assert!(CosineProbMarginRankingLoss::new(-0.1).is_err());
    }
}
