//! Gradient bookkeeping for the extraction forward pass
//!
//! The feature extractor computes every object rank as
//! `aggregate(ranker(query_vec, part_vec) for part in group)`. The graph
//! records, per rank, the closed-form derivatives of that chain:
//! `d rank / d query_vec` (aggregator weights folded through the ranker's
//! query gradients) and `d rank / d part_vec` per part. Given the loss's
//! gradient w.r.t. the rank tensors, `backward` scatters gradients down to
//! query and item embeddings, which the model then pushes into its
//! parameters.

use std::collections::BTreeMap;

use embedtune_core::QueryItem;

use crate::features::FineTuningFeatures;
use crate::model::Vector;

/// Handle to one recorded rank computation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub(crate) usize);

/// Derivative record of one object rank
#[derive(Debug, Clone)]
struct RankNode {
    /// Which query slot produced this rank
    input_slot: usize,
    /// d rank / d query embedding
    grad_query: Vector,
    /// Per part: item id and d rank / d item embedding
    part_grads: Vec<(String, Vector)>,
}

/// Gradients of the loss w.r.t. the rank tensors, parallel to
/// `positive_ranks` / `negative_ranks`
#[derive(Debug, Clone, Default)]
pub struct RankGradients {
    /// d loss / d positive_ranks
    pub positive: Vec<f32>,
    /// d loss / d negative_ranks
    pub negative: Vec<f32>,
}

/// Embedding-space gradients of one batch
#[derive(Debug, Clone, Default)]
pub struct GradientBatch {
    /// Per query: the query item and d loss / d its embedding
    pub query_grads: Vec<(QueryItem, Vector)>,
    /// Per item id: d loss / d its embedding, accumulated over parts
    pub item_grads: BTreeMap<String, Vector>,
}

impl GradientBatch {
    /// Whether every gradient is zero-length
    pub fn is_empty(&self) -> bool {
        self.query_grads.is_empty() && self.item_grads.is_empty()
    }
}

/// Forward-pass record of one extraction batch
#[derive(Debug, Clone, Default)]
pub struct ExtractionGraph {
    queries: Vec<QueryItem>,
    nodes: Vec<RankNode>,
}

impl ExtractionGraph {
    /// Create an empty graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a query, returning its slot
    pub fn add_query(&mut self, query: QueryItem) -> usize {
        self.queries.push(query);
        self.queries.len() - 1
    }

    /// Record one object-rank computation
    pub fn add_node(
        &mut self,
        input_slot: usize,
        grad_query: Vector,
        part_grads: Vec<(String, Vector)>,
    ) -> NodeId {
        self.nodes.push(RankNode {
            input_slot,
            grad_query,
            part_grads,
        });
        NodeId(self.nodes.len() - 1)
    }

    /// Number of recorded rank nodes
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph recorded nothing
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Scatter rank gradients down to embedding gradients
    ///
    /// Rank slots without a recorded node (borrowed or synthetic values)
    /// contribute nothing.
    pub fn backward(
        &self,
        features: &FineTuningFeatures,
        grads: &RankGradients,
    ) -> GradientBatch {
        let mut query_accum: BTreeMap<usize, Vector> = BTreeMap::new();
        let mut item_grads: BTreeMap<String, Vector> = BTreeMap::new();

        let mut apply = |node_id: &Option<NodeId>, upstream: f32| {
            let Some(NodeId(index)) = node_id else {
                return;
            };
            if upstream == 0.0 {
                return;
            }
            let node = &self.nodes[*index];
            let slot = query_accum
                .entry(node.input_slot)
                .or_insert_with(|| vec![0.0; node.grad_query.len()]);
            for (accumulated, g) in slot.iter_mut().zip(&node.grad_query) {
                *accumulated += upstream * g;
            }
            for (item_id, part_grad) in &node.part_grads {
                let accumulated = item_grads
                    .entry(item_id.clone())
                    .or_insert_with(|| vec![0.0; part_grad.len()]);
                for (a, g) in accumulated.iter_mut().zip(part_grad) {
                    *a += upstream * g;
                }
            }
        };

        for (node_id, upstream) in features.positive_nodes.iter().zip(&grads.positive) {
            apply(node_id, *upstream);
        }
        for (node_id, upstream) in features.negative_nodes.iter().zip(&grads.negative) {
            apply(node_id, *upstream);
        }

        let query_grads = query_accum
            .into_iter()
            .map(|(slot, grad)| (self.queries[slot].clone(), grad))
            .collect();
        GradientBatch {
            query_grads,
            item_grads,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn features_with_nodes(
        positive: Vec<(f32, Option<NodeId>)>,
        negative: Vec<(f32, Option<NodeId>)>,
    ) -> FineTuningFeatures {
        let mut features = FineTuningFeatures::default();
        for (rank, node) in positive {
            features.positive_ranks.push(rank);
            features.positive_confidences.push(1.0);
            features.positive_nodes.push(node);
        }
        for (rank, node) in negative {
            features.negative_ranks.push(rank);
            features.negative_confidences.push(1.0);
            features.target.push(1.0);
            features.negative_nodes.push(node);
        }
        features
    }

    #[test]
    fn test_backward_scatters_to_query_and_items() {
        let mut graph = ExtractionGraph::new();
        let slot = graph.add_query(QueryItem::text("q"));
        let pos = graph.add_node(
            slot,
            vec![1.0, 0.0],
            vec![("a".to_string(), vec![0.5, 0.5])],
        );
        let neg = graph.add_node(
            slot,
            vec![0.0, 1.0],
            vec![("b".to_string(), vec![2.0, 0.0])],
        );

        let features = features_with_nodes(
            vec![(0.9, Some(pos))],
            vec![(0.2, Some(neg))],
        );
        let grads = RankGradients {
            positive: vec![2.0],
            negative: vec![-1.0],
        };
        let batch = graph.backward(&features, &grads);

        assert_eq!(batch.query_grads.len(), 1);
        let (query, qgrad) = &batch.query_grads[0];
        assert_eq!(query.as_text(), Some("q"));
        // 2.0 * [1, 0] + (-1.0) * [0, 1]
        assert_eq!(qgrad, &vec![2.0, -1.0]);

        assert_eq!(batch.item_grads["a"], vec![1.0, 1.0]);
        assert_eq!(batch.item_grads["b"], vec![-2.0, -0.0]);
    }

    #[test]
    fn test_backward_accumulates_shared_items() {
        let mut graph = ExtractionGraph::new();
        let slot = graph.add_query(QueryItem::text("q"));
        let first = graph.add_node(slot, vec![0.0], vec![("a".to_string(), vec![1.0])]);
        let second = graph.add_node(slot, vec![0.0], vec![("a".to_string(), vec![1.0])]);

        let features = features_with_nodes(
            vec![(0.5, Some(first)), (0.6, Some(second))],
            vec![(0.1, None), (0.2, None)],
        );
        let grads = RankGradients {
            positive: vec![1.0, 3.0],
            negative: vec![0.0, 0.0],
        };
        let batch = graph.backward(&features, &grads);
        assert_eq!(batch.item_grads["a"], vec![4.0]);
    }

    #[test]
    fn test_nodeless_slots_are_ignored() {
        let graph = ExtractionGraph::new();
        let features = features_with_nodes(vec![(0.5, None)], vec![(0.1, None)]);
        let grads = RankGradients {
            positive: vec![1.0],
            negative: vec![1.0],
        };
        assert!(graph.backward(&features, &grads).is_empty());
    }
}
