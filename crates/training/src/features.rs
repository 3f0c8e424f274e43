//! Extracted fine-tuning features
//!
//! Five parallel tensors over (positive, negative) pairs, plus the graph
//! back-references that let the backward pass find each rank's derivative
//! record. Every operation keeps all seven vectors in lockstep.
//!
//! A features object from a fully irrelevant input temporarily has an empty
//! positive side; `use_positive_from` fills it from a paired relevant
//! input's features before the object reaches the loss.

use embedtune_core::{Error, Result};

use crate::graph::NodeId;

/// Parallel feature tensors of accumulated (positive, negative) pairs
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FineTuningFeatures {
    /// Ranks of positive (clicked) objects, one per pair
    pub positive_ranks: Vec<f32>,
    /// Ranks of negative (unclicked) objects, one per pair
    pub negative_ranks: Vec<f32>,
    /// +1.0 when ranks are similarities, -1.0 for distances
    pub target: Vec<f32>,
    /// Confidence of each positive entry
    pub positive_confidences: Vec<f32>,
    /// Confidence of each negative entry
    pub negative_confidences: Vec<f32>,
    /// Graph back-reference per positive rank
    pub positive_nodes: Vec<Option<NodeId>>,
    /// Graph back-reference per negative rank
    pub negative_nodes: Vec<Option<NodeId>>,
}

impl FineTuningFeatures {
    /// Build features from raw tensors, checking lengths
    ///
    /// Graph back-references are absent; such features carry no gradients.
    pub fn from_raw(
        positive_ranks: Vec<f32>,
        negative_ranks: Vec<f32>,
        target: Vec<f32>,
        positive_confidences: Vec<f32>,
        negative_confidences: Vec<f32>,
    ) -> Result<Self> {
        let features = FineTuningFeatures {
            positive_nodes: vec![None; positive_ranks.len()],
            negative_nodes: vec![None; negative_ranks.len()],
            positive_ranks,
            negative_ranks,
            target,
            positive_confidences,
            negative_confidences,
        };
        features.check_lengths()?;
        Ok(features)
    }

    /// Number of pairs
    pub fn len(&self) -> usize {
        self.negative_ranks.len()
    }

    /// Whether there are no pairs
    pub fn is_empty(&self) -> bool {
        self.negative_ranks.is_empty()
    }

    /// Whether the positive side is unfilled (fully irrelevant input whose
    /// pair partner has not been applied yet)
    pub fn positives_pending(&self) -> bool {
        self.positive_ranks.is_empty() && !self.negative_ranks.is_empty()
    }

    /// Verify the lockstep invariant
    ///
    /// The positive side may be empty while a pair partner is pending;
    /// otherwise all tensors share one length.
    pub fn check_lengths(&self) -> Result<()> {
        let n = self.negative_ranks.len();
        let negative_ok =
            self.negative_confidences.len() == n && self.target.len() == n && self.negative_nodes.len() == n;
        let p = self.positive_ranks.len();
        let positive_ok = self.positive_confidences.len() == p && self.positive_nodes.len() == p;
        if !negative_ok || !positive_ok || (p != 0 && p != n) {
            return Err(Error::validation(
                "feature tensors must all have the same length",
            ));
        }
        Ok(())
    }

    /// Concatenate another features object onto this one
    pub fn accumulate(&mut self, other: &FineTuningFeatures) {
        self.positive_ranks.extend_from_slice(&other.positive_ranks);
        self.negative_ranks.extend_from_slice(&other.negative_ranks);
        self.target.extend_from_slice(&other.target);
        self.positive_confidences
            .extend_from_slice(&other.positive_confidences);
        self.negative_confidences
            .extend_from_slice(&other.negative_confidences);
        self.positive_nodes.extend_from_slice(&other.positive_nodes);
        self.negative_nodes.extend_from_slice(&other.negative_nodes);
    }

    /// Keep only pairs with `min < |pos - neg| < max`
    ///
    /// Drops both trivial pairs (difference below `min`) and hopeless ones
    /// (difference above `max`), applied to all tensors uniformly.
    pub fn clamp_diff_in(&mut self, min: f32, max: f32) {
        if self.positive_ranks.is_empty() || self.negative_ranks.is_empty() {
            return;
        }
        let keep: Vec<bool> = self
            .positive_ranks
            .iter()
            .zip(&self.negative_ranks)
            .map(|(p, n)| {
                let diff = (p - n).abs();
                diff > min && diff < max
            })
            .collect();
        retain_by_mask(&mut self.positive_ranks, &keep);
        retain_by_mask(&mut self.negative_ranks, &keep);
        retain_by_mask(&mut self.target, &keep);
        retain_by_mask(&mut self.positive_confidences, &keep);
        retain_by_mask(&mut self.negative_confidences, &keep);
        retain_by_mask(&mut self.positive_nodes, &keep);
        retain_by_mask(&mut self.negative_nodes, &keep);
    }

    /// Borrow the positive side from a paired relevant input's features
    ///
    /// Turns a triplet regime into a contrastive one for fully irrelevant
    /// inputs. Sizing: the shorter of (own negatives, other's positives)
    /// wins, the longer side is truncated. The borrowed positive ranks also
    /// serve as positive confidences, standing in for the click signal the
    /// irrelevant input does not have.
    pub fn use_positive_from(&mut self, other: &FineTuningFeatures) {
        let n_neg = self.negative_ranks.len();
        let n_pos = other.positive_ranks.len();
        let keep = n_neg.min(n_pos);

        self.negative_ranks.truncate(keep);
        self.target.truncate(keep);
        self.negative_confidences.truncate(keep);
        self.negative_nodes.truncate(keep);

        self.positive_ranks = other.positive_ranks[..keep].to_vec();
        self.positive_nodes = other.positive_nodes[..keep].to_vec();
        self.positive_confidences = other.positive_ranks[..keep].to_vec();
    }
}

fn retain_by_mask<T>(values: &mut Vec<T>, keep: &[bool]) {
    let mut index = 0;
    values.retain(|_| {
        let retained = keep[index];
        index += 1;
        retained
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn features(pos: &[f32], neg: &[f32]) -> FineTuningFeatures {
        FineTuningFeatures::from_raw(
            pos.to_vec(),
            neg.to_vec(),
            vec![1.0; neg.len()],
            vec![1.0; pos.len()],
            vec![1.0; neg.len()],
        )
        .unwrap()
    }

    #[test]
    fn test_from_raw_checks_lengths() {
        assert!(FineTuningFeatures::from_raw(
            vec![1.0],
            vec![1.0, 2.0],
            vec![1.0, 1.0],
            vec![1.0],
            vec![1.0, 1.0],
        )
        .is_err());

        // Empty positive side is a legal pending state
        assert!(FineTuningFeatures::from_raw(
            vec![],
            vec![1.0, 2.0],
            vec![1.0, 1.0],
            vec![],
            vec![1.0, 1.0],
        )
        .is_ok());
    }

    #[test]
    fn test_accumulate_concatenates() {
        let mut a = features(&[0.9, 0.8], &[0.1, 0.2]);
        let b = features(&[0.7], &[0.3]);
        a.accumulate(&b);

        assert_eq!(a.len(), 3);
        assert_eq!(a.positive_ranks, vec![0.9, 0.8, 0.7]);
        assert_eq!(a.negative_ranks, vec![0.1, 0.2, 0.3]);
        a.check_lengths().unwrap();
    }

    #[test]
    fn test_accumulate_empty_is_identity() {
        let mut a = features(&[0.9], &[0.1]);
        let before = a.clone();
        a.accumulate(&FineTuningFeatures::default());
        assert_eq!(a, before);

        let mut empty = FineTuningFeatures::default();
        empty.accumulate(&before);
        assert_eq!(empty, before);
    }

    #[test]
    fn test_accumulate_commutes_up_to_order() {
        let a = features(&[0.9, 0.8], &[0.1, 0.2]);
        let b = features(&[0.7], &[0.3]);

        let mut ab = a.clone();
        ab.accumulate(&b);
        let mut ba = b.clone();
        ba.accumulate(&a);

        let sorted = |mut v: Vec<f32>| {
            v.sort_by(f32::total_cmp);
            v
        };
        assert_eq!(sorted(ab.positive_ranks), sorted(ba.positive_ranks));
        assert_eq!(sorted(ab.negative_ranks), sorted(ba.negative_ranks));
    }

    #[test]
    fn test_clamp_diff_in_filters_uniformly() {
        let mut f = features(&[0.9, 0.6, 0.5], &[0.1, 0.55, 0.1]);
        // diffs: 0.8, 0.05, 0.4; keep 0.1 < diff < 0.5
        f.clamp_diff_in(0.1, 0.5);

        assert_eq!(f.positive_ranks, vec![0.5]);
        assert_eq!(f.negative_ranks, vec![0.1]);
        assert_eq!(f.len(), 1);
        f.check_lengths().unwrap();

        for (p, n) in f.positive_ranks.iter().zip(&f.negative_ranks) {
            let diff = (p - n).abs();
            assert!(diff > 0.1 && diff < 0.5);
        }
    }

    #[test]
    fn test_clamp_bounds_are_exclusive() {
        let mut f = features(&[0.6, 0.7], &[0.5, 0.2]);
        // diffs: 0.1 (== min, dropped), 0.5 (== max, dropped)
        f.clamp_diff_in(0.1, 0.5);
        assert!(f.is_empty());
    }

    #[test]
    fn test_clamp_skips_pending_positives() {
        let mut f = FineTuningFeatures::from_raw(
            vec![],
            vec![0.5, 0.2],
            vec![1.0, 1.0],
            vec![],
            vec![1.0, 1.0],
        )
        .unwrap();
        f.clamp_diff_in(0.0, 1.0);
        assert_eq!(f.len(), 2);
    }

    #[test]
    fn test_use_positive_from_truncates_longer_negatives() {
        let mut irrelevant = FineTuningFeatures::from_raw(
            vec![],
            vec![0.3, 0.2, 0.1],
            vec![1.0, 1.0, 1.0],
            vec![],
            vec![0.5, 0.5, 0.5],
        )
        .unwrap();
        let relevant = features(&[0.9, 0.8], &[0.4, 0.3]);

        irrelevant.use_positive_from(&relevant);
        assert_eq!(irrelevant.len(), 2);
        assert_eq!(irrelevant.positive_ranks, vec![0.9, 0.8]);
        // Borrowed positive ranks double as positive confidences
        assert_eq!(irrelevant.positive_confidences, vec![0.9, 0.8]);
        assert_eq!(irrelevant.negative_ranks, vec![0.3, 0.2]);
        irrelevant.check_lengths().unwrap();
        assert!(!irrelevant.positives_pending());
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn features_strategy() -> impl Strategy<Value = FineTuningFeatures> {
            (1usize..8).prop_flat_map(|n| {
                (
                    proptest::collection::vec(-1.0f32..1.0, n),
                    proptest::collection::vec(-1.0f32..1.0, n),
                    proptest::collection::vec(0.0f32..1.0, n),
                    proptest::collection::vec(0.0f32..1.0, n),
                )
                    .prop_map(move |(pos, neg, pc, nc)| {
                        FineTuningFeatures::from_raw(pos, neg, vec![1.0; n], pc, nc).unwrap()
                    })
            })
        }

        proptest! {
            #[test]
            fn accumulating_empty_is_identity(f in features_strategy()) {
                let mut accumulated = f.clone();
                accumulated.accumulate(&FineTuningFeatures::default());
                prop_assert_eq!(&accumulated, &f);

                let mut from_empty = FineTuningFeatures::default();
                from_empty.accumulate(&f);
                prop_assert_eq!(&from_empty, &f);
            }

            #[test]
            fn clamp_keeps_lockstep_and_bounds(
                f in features_strategy(),
                min in 0.0f32..0.5,
                max in 0.5f32..2.0,
            ) {
                let mut clamped = f.clone();
                clamped.clamp_diff_in(min, max);
                prop_assert!(clamped.check_lengths().is_ok());
                for (p, n) in clamped.positive_ranks.iter().zip(&clamped.negative_ranks) {
                    let diff = (p - n).abs();
                    prop_assert!(diff > min && diff < max);
                }
            }

            #[test]
            fn accumulate_commutes_up_to_order(
                a in features_strategy(),
                b in features_strategy(),
            ) {
                let mut ab = a.clone();
                ab.accumulate(&b);
                let mut ba = b.clone();
                ba.accumulate(&a);
                let sorted = |mut v: Vec<f32>| {
                    v.sort_by(f32::total_cmp);
                    v
                };
                prop_assert_eq!(
                    sorted(ab.positive_ranks),
                    sorted(ba.positive_ranks)
                );
                prop_assert_eq!(
                    sorted(ab.negative_ranks),
                    sorted(ba.negative_ranks)
                );
            }
        }
    }

    #[test]
    fn test_use_positive_from_truncates_longer_positives() {
        let mut irrelevant = FineTuningFeatures::from_raw(
            vec![],
            vec![0.3],
            vec![1.0],
            vec![],
            vec![0.5],
        )
        .unwrap();
        let relevant = features(&[0.9, 0.8, 0.7], &[0.4, 0.3, 0.2]);

        irrelevant.use_positive_from(&relevant);
        assert_eq!(irrelevant.len(), 1);
        assert_eq!(irrelevant.positive_ranks, vec![0.9]);
        irrelevant.check_lengths().unwrap();
    }
}
