//! Ranking functions
//!
//! A ranker scores a query embedding against an item embedding. Scores are
//! always "higher = more similar" for similarity rankers; the extractor
//! flips the training target for distance rankers. Each ranker also exposes
//! the analytic gradient of its score w.r.t. both inputs, which is what the
//! backward pass chains through.

/// A differentiable scoring function over embedding pairs
pub trait Ranker: Send + Sync {
    /// Whether higher scores mean more similar
    fn is_similarity(&self) -> bool;

    /// Score one query/item pair
    fn score(&self, query: &[f32], item: &[f32]) -> f32;

    /// Score plus gradients: `(score, d score/d query, d score/d item)`
    fn score_with_grad(&self, query: &[f32], item: &[f32]) -> (f32, Vec<f32>, Vec<f32>);
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn norm(a: &[f32]) -> f32 {
    dot(a, a).sqrt()
}

/// Cosine similarity ranker
///
/// `dot(q, v) / (|q| * |v|)`, norms clamped from below to keep the score
/// and its gradient finite for degenerate vectors.
#[derive(Debug, Clone, Copy)]
pub struct CosineRanker {
    eps: f32,
}

impl CosineRanker {
    /// Create a cosine ranker with the default epsilon
    pub fn new() -> Self {
        CosineRanker { eps: 1e-6 }
    }
}

impl Default for CosineRanker {
    fn default() -> Self {
        Self::new()
    }
}

impl Ranker for CosineRanker {
    fn is_similarity(&self) -> bool {
        true
    }

    fn score(&self, query: &[f32], item: &[f32]) -> f32 {
        let nq = norm(query).max(self.eps);
        let nv = norm(item).max(self.eps);
        dot(query, item) / (nq * nv)
    }

    fn score_with_grad(&self, query: &[f32], item: &[f32]) -> (f32, Vec<f32>, Vec<f32>) {
        let nq = norm(query).max(self.eps);
        let nv = norm(item).max(self.eps);
        let cos = dot(query, item) / (nq * nv);

        // d cos / d q = v / (|q||v|) - cos * q / |q|^2
        let grad_query: Vec<f32> = query
            .iter()
            .zip(item)
            .map(|(q, v)| v / (nq * nv) - cos * q / (nq * nq))
            .collect();
        let grad_item: Vec<f32> = query
            .iter()
            .zip(item)
            .map(|(q, v)| q / (nq * nv) - cos * v / (nv * nv))
            .collect();
        (cos, grad_query, grad_item)
    }
}

/// Raw dot-product ranker for pre-normalized embeddings
#[derive(Debug, Clone, Copy, Default)]
pub struct DotProductRanker;

impl Ranker for DotProductRanker {
    fn is_similarity(&self) -> bool {
        true
    }

    fn score(&self, query: &[f32], item: &[f32]) -> f32 {
        dot(query, item)
    }

    fn score_with_grad(&self, query: &[f32], item: &[f32]) -> (f32, Vec<f32>, Vec<f32>) {
        (dot(query, item), item.to_vec(), query.to_vec())
    }
}
