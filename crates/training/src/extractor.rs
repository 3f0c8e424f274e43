//! Feature extraction
//!
//! Turns a batch of (relevant, irrelevant) input pairs into one accumulated
//! `FineTuningFeatures` object plus the gradient graph of the forward pass.
//!
//! Per input: negatives are downsampled at object granularity, confidences
//! are computed over object groups, the model embeds the query and every
//! used item, part ranks are aggregated into object ranks, and positives
//! are paired against negatives by cycling. Pairs with a rank difference
//! outside the configured window are dropped.

use rand::Rng;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::warn;

use embedtune_core::{Error, FineTuningInput, Result};

use crate::aggregators::{ClicksAggregator, RanksAggregator};
use crate::confidences::ConfidenceCalculator;
use crate::dataset::InputPair;
use crate::features::FineTuningFeatures;
use crate::graph::{ExtractionGraph, NodeId};
use crate::items::ItemsSet;
use crate::model::EmbeddingModel;
use crate::ranker::Ranker;

/// Extracts training features from fine-tuning inputs
pub struct FeatureExtractor {
    ranker: Arc<dyn Ranker>,
    not_irrelevant_only: bool,
    negative_downsampling: f64,
    min_abs_difference_threshold: f32,
    max_abs_difference_threshold: f32,
    confidence_calculator: ConfidenceCalculator,
    ranks_aggregator: Arc<dyn RanksAggregator>,
    clicks_aggregator: Arc<dyn ClicksAggregator>,
}

impl FeatureExtractor {
    /// Create an extractor
    ///
    /// `negative_downsampling` is the fraction of negative object groups
    /// kept per input, in (0, 1]. The difference thresholds bound
    /// `|pos - neg|` for retained pairs.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ranker: Arc<dyn Ranker>,
        not_irrelevant_only: bool,
        negative_downsampling: f64,
        min_abs_difference_threshold: f32,
        max_abs_difference_threshold: f32,
        confidence_calculator: ConfidenceCalculator,
        ranks_aggregator: Arc<dyn RanksAggregator>,
        clicks_aggregator: Arc<dyn ClicksAggregator>,
    ) -> Result<Self> {
        if !(negative_downsampling > 0.0 && negative_downsampling <= 1.0) {
            return Err(Error::validation(
                "negative_downsampling must be in range (0, 1]",
            ));
        }
        if min_abs_difference_threshold < 0.0 {
            return Err(Error::validation(
                "min_abs_difference_threshold must be non-negative",
            ));
        }
        if max_abs_difference_threshold <= 0.0 {
            return Err(Error::validation(
                "max_abs_difference_threshold must be positive",
            ));
        }
        Ok(FeatureExtractor {
            ranker,
            not_irrelevant_only,
            negative_downsampling,
            min_abs_difference_threshold,
            max_abs_difference_threshold,
            confidence_calculator,
            ranks_aggregator,
            clicks_aggregator,
        })
    }

    /// The target sign for this extractor's ranker
    fn target_sign(&self) -> f32 {
        if self.ranker.is_similarity() {
            1.0
        } else {
            -1.0
        }
    }

    /// Downsample negatives at object granularity
    ///
    /// Groups `not_events` by object id, samples `ceil(rate * groups)`
    /// groups without replacement, and returns the union of their ids in
    /// the original order.
    fn downsample_not_events<R: Rng>(
        &self,
        input: &FineTuningInput,
        rng: &mut R,
    ) -> Vec<String> {
        let not_events = input.not_events();
        let mut groups: Vec<(String, Vec<String>)> = Vec::new();
        let mut group_index: BTreeMap<String, usize> = BTreeMap::new();
        for id in not_events {
            let object_id = input.get_object_id(&id).to_string();
            match group_index.get(&object_id).copied() {
                Some(index) => groups[index].1.push(id),
                None => {
                    group_index.insert(object_id.clone(), groups.len());
                    groups.push((object_id, vec![id]));
                }
            }
        }
        if groups.is_empty() {
            return Vec::new();
        }
        let keep = ((self.negative_downsampling * groups.len() as f64).ceil() as usize)
            .clamp(1, groups.len());
        let mut chosen = rand::seq::index::sample(rng, groups.len(), keep).into_vec();
        chosen.sort_unstable();
        chosen
            .into_iter()
            .flat_map(|index| groups[index].1.clone())
            .collect()
    }

    /// Per-object confidences scattered back over events and negatives
    ///
    /// Ranks and clicks are grouped by object id in first-appearance order,
    /// aggregated to one value per group, and the calculator runs once over
    /// the full aggregated vectors so window and position context covers
    /// every group.
    fn confidences(
        &self,
        input: &FineTuningInput,
        not_events: &[String],
    ) -> (Vec<f32>, Vec<f32>) {
        let event_ids: BTreeSet<&str> = input.events.iter().map(String::as_str).collect();

        let mut group_order: Vec<String> = Vec::new();
        let mut group_index: BTreeMap<String, usize> = BTreeMap::new();
        let mut group_ranks: Vec<Vec<f32>> = Vec::new();
        let mut group_clicks: Vec<Vec<f32>> = Vec::new();
        for id in input.events.iter().chain(not_events) {
            let object_id = input.get_object_id(id).to_string();
            let rank = input.ranks.get(id).copied().flatten().unwrap_or(0.0) as f32;
            let click = if event_ids.contains(id.as_str()) { 1.0 } else { 0.0 };
            match group_index.get(&object_id).copied() {
                Some(g) => {
                    group_ranks[g].push(rank);
                    group_clicks[g].push(click);
                }
                None => {
                    group_index.insert(object_id.clone(), group_ranks.len());
                    group_order.push(object_id);
                    group_ranks.push(vec![rank]);
                    group_clicks.push(vec![click]);
                }
            }
        }

        let aggregated_ranks: Vec<f32> = group_ranks
            .iter()
            .map(|ranks| self.ranks_aggregator.aggregate(ranks))
            .collect();
        let aggregated_clicks: Vec<f32> = group_clicks
            .iter()
            .map(|clicks| self.clicks_aggregator.aggregate(clicks))
            .collect();
        let confidences = (self.confidence_calculator)(&aggregated_ranks, &aggregated_clicks);

        let group_confidences: BTreeMap<String, f32> =
            group_order.into_iter().zip(confidences).collect();
        let scatter = |ids: &[String]| {
            ids.iter()
                .map(|id| group_confidences[input.get_object_id(id)])
                .collect::<Vec<f32>>()
        };
        (scatter(&input.events), scatter(not_events))
    }

    /// Extract features for one input
    ///
    /// A fully irrelevant input produces features with a pending positive
    /// side; the caller pairs it via `use_positive_from`.
    pub fn extract<R: Rng>(
        &self,
        input: &FineTuningInput,
        items: &ItemsSet,
        model: &dyn EmbeddingModel,
        graph: &mut ExtractionGraph,
        rng: &mut R,
    ) -> Result<FineTuningFeatures> {
        let not_events = self.downsample_not_events(input, rng);
        let (positive_confidences, negative_confidences) =
            self.confidences(input, &not_events);

        let query_vector = model.embed_query(&input.query)?;
        let slot = graph.add_query(input.query.clone());

        let used: Vec<String> = input
            .events
            .iter()
            .chain(&not_events)
            .cloned()
            .collect();
        let (found_items, found_ids) = items.items_by_ids(&used);
        let item_vectors = model.embed_items(&found_items)?;

        // Group part vectors by object id, preserving first-appearance order
        let mut groups: Vec<(String, Vec<usize>)> = Vec::new();
        let mut group_index: BTreeMap<String, usize> = BTreeMap::new();
        for (index, id) in found_ids.iter().enumerate() {
            let object_id = input.get_object_id(id).to_string();
            match group_index.get(&object_id).copied() {
                Some(g) => groups[g].1.push(index),
                None => {
                    group_index.insert(object_id.clone(), groups.len());
                    groups.push((object_id, vec![index]));
                }
            }
        }

        // One aggregated rank node per object
        let mut object_ranks: BTreeMap<String, (f32, NodeId)> = BTreeMap::new();
        for (object_id, member_indices) in &groups {
            let mut scores = Vec::with_capacity(member_indices.len());
            let mut query_grads = Vec::with_capacity(member_indices.len());
            let mut item_grads = Vec::with_capacity(member_indices.len());
            for index in member_indices {
                let (score, grad_query, grad_item) = self
                    .ranker
                    .score_with_grad(&query_vector, &item_vectors[*index]);
                scores.push(score);
                query_grads.push(grad_query);
                item_grads.push(grad_item);
            }
            let (rank, weights) = self.ranks_aggregator.aggregate_with_grad(&scores);

            let dim = query_vector.len();
            let mut node_query_grad = vec![0.0_f32; dim];
            let mut node_part_grads = Vec::with_capacity(member_indices.len());
            for (j, index) in member_indices.iter().enumerate() {
                let weight = weights[j];
                for (accumulated, g) in node_query_grad.iter_mut().zip(&query_grads[j]) {
                    *accumulated += weight * g;
                }
                node_part_grads.push((
                    found_ids[*index].clone(),
                    item_grads[j].iter().map(|g| weight * g).collect(),
                ));
            }
            let node = graph.add_node(slot, node_query_grad, node_part_grads);
            object_ranks.insert(object_id.clone(), (rank, node));
        }

        // Scatter object ranks back per id
        let mut positives: Vec<(f32, f32, NodeId)> = Vec::new();
        let mut negatives: Vec<(f32, f32, NodeId)> = Vec::new();
        for id in &found_ids {
            let object_id = input.get_object_id(id);
            let (rank, node) = object_ranks[object_id];
            if let Some(position) = input.events.iter().position(|e| e == id) {
                positives.push((rank, positive_confidences[position], node));
            } else if let Some(position) = not_events.iter().position(|n| n == id) {
                negatives.push((rank, negative_confidences[position], node));
            }
        }

        let mut features = FineTuningFeatures::default();
        let sign = self.target_sign();
        for (rank, confidence, node) in &negatives {
            features.negative_ranks.push(*rank);
            features.negative_confidences.push(*confidence);
            features.negative_nodes.push(Some(*node));
            features.target.push(sign);
        }
        if !positives.is_empty() {
            // Pair positives against negatives by cycling the shorter side
            for i in 0..negatives.len() {
                let (rank, confidence, node) = &positives[i % positives.len()];
                features.positive_ranks.push(*rank);
                features.positive_confidences.push(*confidence);
                features.positive_nodes.push(Some(*node));
            }
        }

        features.clamp_diff_in(
            self.min_abs_difference_threshold,
            self.max_abs_difference_threshold,
        );
        features.check_lengths()?;
        Ok(features)
    }

    /// Extract and accumulate features over a batch of pairs
    pub fn extract_batch<R: Rng>(
        &self,
        batch: &[InputPair],
        items: &ItemsSet,
        model: &dyn EmbeddingModel,
        rng: &mut R,
    ) -> Result<(FineTuningFeatures, ExtractionGraph)> {
        let mut graph = ExtractionGraph::new();
        let mut features = FineTuningFeatures::default();

        for (not_irrelevant, irrelevant) in batch {
            let Some(not_irrelevant) = not_irrelevant else {
                if irrelevant.is_some() {
                    warn!(
                        target: "embedtune::training",
                        "Pair without a relevant input has no positives to borrow, skipping"
                    );
                }
                continue;
            };
            if not_irrelevant.events.is_empty() {
                warn!(target: "embedtune::training", "Relevant input has no events, skipping");
                continue;
            }

            let use_pair = !self.not_irrelevant_only
                && irrelevant.as_ref().map(|i| !i.is_empty()).unwrap_or(false);
            if use_pair {
                let relevant_features =
                    self.extract(not_irrelevant, items, model, &mut graph, rng)?;
                let mut irrelevant_features = self.extract(
                    irrelevant.as_ref().unwrap(),
                    items,
                    model,
                    &mut graph,
                    rng,
                )?;
                irrelevant_features.use_positive_from(&relevant_features);
                features.accumulate(&relevant_features);
                features.accumulate(&irrelevant_features);
            } else {
                let extracted = self.extract(not_irrelevant, items, model, &mut graph, rng)?;
                features.accumulate(&extracted);
            }
        }

        features.check_lengths()?;
        Ok((features, graph))
    }

    /// Rank every result of an input with the current model
    ///
    /// Used by the rank-preprocessing pass for inputs whose display-time
    /// ranks are missing. Results absent from the items set keep a `None`
    /// rank.
    pub fn calculate_ranks(
        &self,
        input: &FineTuningInput,
        items: &ItemsSet,
        model: &dyn EmbeddingModel,
    ) -> Result<BTreeMap<String, Option<f64>>> {
        let query_vector = model.embed_query(&input.query)?;
        let (found_items, found_ids) = items.items_by_ids(&input.results);
        let item_vectors = model.embed_items(&found_items)?;

        let mut ranks: BTreeMap<String, Option<f64>> = input
            .results
            .iter()
            .map(|id| (id.clone(), None))
            .collect();
        for (id, vector) in found_ids.iter().zip(&item_vectors) {
            ranks.insert(
                id.clone(),
                Some(self.ranker.score(&query_vector, vector) as f64),
            );
        }
        Ok(ranks)
    }
}
