//! Training metric calculators
//!
//! Calculators observe a batch after an optimizer step and report named
//! values; the driver prefixes them with `train_` / `test_` and feeds them
//! to the experiment tracker.

use embedtune_core::Result;
use embedtune_registry::MetricValue;

use crate::dataset::InputPair;
use crate::extractor::FeatureExtractor;
use crate::items::ItemsSet;
use crate::model::EmbeddingModel;
use crate::ranker::Ranker;

/// A trackable metric over training batches
pub trait MetricCalculator: Send + Sync {
    /// Compute the metric values for one batch
    fn calculate(
        &self,
        batch: &[InputPair],
        ranker: &dyn Ranker,
        extractor: &FeatureExtractor,
        items: &ItemsSet,
        model: &dyn EmbeddingModel,
    ) -> Result<Vec<MetricValue>>;
}

/// How much item ranks moved in the preferred direction
///
/// For a relevant session the clicked items should rank higher than they
/// did at display time; for an irrelevant session every result should rank
/// lower. The sign convention follows the ranker: for similarity rankers
/// "higher is better", for distance rankers the comparison flips.
#[derive(Debug, Clone, Copy, Default)]
pub struct DistanceShift;

impl DistanceShift {
    fn shift_for_input(
        &self,
        input: &embedtune_core::FineTuningInput,
        ranker: &dyn Ranker,
        items: &ItemsSet,
        model: &dyn EmbeddingModel,
        irrelevant: bool,
    ) -> Result<Option<f64>> {
        let ids: Vec<String> = if irrelevant {
            input.results.clone()
        } else {
            input.events.clone()
        };
        let (found_items, found_ids) = items.items_by_ids(&ids);
        if found_ids.is_empty() {
            return Ok(None);
        }
        let query_vector = model.embed_query(&input.query)?;
        let item_vectors = model.embed_items(&found_items)?;

        let target: f64 = if ranker.is_similarity() { 1.0 } else { -1.0 };
        let mut shifts = Vec::with_capacity(found_ids.len());
        for (id, vector) in found_ids.iter().zip(&item_vectors) {
            let Some(previous) = input.ranks.get(id).copied().flatten() else {
                continue;
            };
            let new_rank = ranker.score(&query_vector, vector) as f64;
            let shift = if irrelevant {
                target * (previous - new_rank)
            } else {
                target * (new_rank - previous)
            };
            shifts.push(shift);
        }
        if shifts.is_empty() {
            return Ok(None);
        }
        Ok(Some(shifts.iter().sum::<f64>() / shifts.len() as f64))
    }
}

impl MetricCalculator for DistanceShift {
    fn calculate(
        &self,
        batch: &[InputPair],
        ranker: &dyn Ranker,
        _extractor: &FeatureExtractor,
        items: &ItemsSet,
        model: &dyn EmbeddingModel,
    ) -> Result<Vec<MetricValue>> {
        let mut relevant_shifts = Vec::new();
        let mut irrelevant_shifts = Vec::new();
        for (not_irrelevant, irrelevant) in batch {
            if let Some(input) = not_irrelevant {
                if let Some(shift) = self.shift_for_input(input, ranker, items, model, false)? {
                    relevant_shifts.push(shift);
                }
            }
            if let Some(input) = irrelevant {
                if let Some(shift) = self.shift_for_input(input, ranker, items, model, true)? {
                    irrelevant_shifts.push(shift);
                }
            }
        }

        let mut values = Vec::new();
        if !relevant_shifts.is_empty() {
            let mean = relevant_shifts.iter().sum::<f64>() / relevant_shifts.len() as f64;
            values.push(MetricValue::new("not_irrelevant_dist_shift", mean)?);
        }
        if !irrelevant_shifts.is_empty() {
            let mean = irrelevant_shifts.iter().sum::<f64>() / irrelevant_shifts.len() as f64;
            values.push(MetricValue::new("irrelevant_dist_shift", mean)?);
        }
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregators::{MaxClicksAggregator, MeanRanksAggregator};
    use crate::confidences::dummy_confidences;
    use crate::items::DownloadedItem;
    use crate::model::LinearAdapterModel;
    use crate::ranker::CosineRanker;
    use embedtune_core::{FineTuningInput, QueryItem};
    use std::sync::Arc;

    fn items_set(ids: &[&str]) -> ItemsSet {
        ItemsSet::from_items(
            ids.iter()
                .map(|id| DownloadedItem {
                    id: id.to_string(),
                    payload: serde_json::json!(format!("text for {id}")),
                })
                .collect(),
        )
    }

    fn extractor() -> FeatureExtractor {
        FeatureExtractor::new(
            Arc::new(CosineRanker::new()),
            true,
            1.0,
            0.0,
            2.0,
            dummy_confidences,
            Arc::new(MeanRanksAggregator::new()),
            Arc::new(MaxClicksAggregator),
        )
        .unwrap()
    }

    fn input(events: &[&str], results: &[&str], rank: f64) -> FineTuningInput {
        let ranks = results
            .iter()
            .map(|id| (id.to_string(), Some(rank)))
            .collect();
        FineTuningInput::new(
            QueryItem::text("query"),
            events.iter().map(|s| s.to_string()).collect(),
            results.iter().map(|s| s.to_string()).collect(),
            ranks,
        )
        .unwrap()
    }

    #[test]
    fn test_distance_shift_reports_both_sides() {
        let items = items_set(&["a", "b", "x"]);
        let model = LinearAdapterModel::new(8, 1).unwrap();
        let batch: Vec<InputPair> = vec![(
            Some(input(&["a"], &["a", "b"], 0.0)),
            Some(input(&[], &["x"], 0.0)),
        )];

        let ranker = CosineRanker::new();
        let values = DistanceShift
            .calculate(&batch, &ranker, &extractor(), &items, &model)
            .unwrap();
        let names: Vec<&str> = values.iter().map(|v| v.name()).collect();
        assert!(names.contains(&"not_irrelevant_dist_shift"));
        assert!(names.contains(&"irrelevant_dist_shift"));
    }

    #[test]
    fn test_distance_shift_sign_convention() {
        // Old rank is -1 (worst possible cosine); any model output moves
        // clicked items up, so the relevant shift is positive
        let items = items_set(&["a", "b"]);
        let model = LinearAdapterModel::new(8, 1).unwrap();
        let batch: Vec<InputPair> = vec![(Some(input(&["a"], &["a", "b"], -1.0)), None)];

        let ranker = CosineRanker::new();
        let values = DistanceShift
            .calculate(&batch, &ranker, &extractor(), &items, &model)
            .unwrap();
        assert_eq!(values.len(), 1);
        assert!(values[0].value() > 0.0);
    }

    #[test]
    fn test_distance_shift_empty_batch() {
        let items = items_set(&["a"]);
        let model = LinearAdapterModel::new(8, 1).unwrap();
        let ranker = CosineRanker::new();
        let values = DistanceShift
            .calculate(&[], &ranker, &extractor(), &items, &model)
            .unwrap();
        assert!(values.is_empty());
    }
}
