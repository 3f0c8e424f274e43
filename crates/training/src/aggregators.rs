//! Rank and click aggregation over split items
//!
//! When an object was split into parts before embedding, each part gets its
//! own rank; aggregators collapse part ranks into one object rank. The
//! differentiable forms report the jacobian `d aggregate / d rank` so the
//! backward pass can distribute the object-level gradient over parts.
//!
//! Max/min use a softmax-weighted sum with a large sharpness so their
//! differentiable value tracks the true extreme while keeping nonzero
//! gradients on every part.

/// Aggregates part ranks into one object rank
pub trait RanksAggregator: Send + Sync {
    /// Plain aggregate
    fn aggregate(&self, ranks: &[f32]) -> f32;

    /// Aggregate plus `d aggregate / d rank` per part
    fn aggregate_with_grad(&self, ranks: &[f32]) -> (f32, Vec<f32>);
}

/// Softmax-weighted extreme: `beta > 0` approximates max, `beta < 0` min
///
/// value `s = sum(p_i * r_i)` with `p = softmax(beta * r)`;
/// `d s / d r_k = p_k * (1 + beta * (r_k - s))`.
fn softmax_extreme(ranks: &[f32], beta: f32) -> (f32, Vec<f32>) {
    let max_scaled = ranks
        .iter()
        .map(|r| beta * r)
        .fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = ranks.iter().map(|r| (beta * r - max_scaled).exp()).collect();
    let total: f32 = exps.iter().sum();
    let probs: Vec<f32> = exps.iter().map(|e| e / total).collect();
    let value: f32 = probs.iter().zip(ranks).map(|(p, r)| p * r).sum();
    let grads = probs
        .iter()
        .zip(ranks)
        .map(|(p, r)| p * (1.0 + beta * (r - value)))
        .collect();
    (value, grads)
}

/// Maximum of part ranks
#[derive(Debug, Clone, Copy)]
pub struct MaxRanksAggregator {
    /// Value returned for an empty group
    pub if_empty_value: f32,
    /// Softmax sharpness of the differentiable form
    pub beta: f32,
}

impl MaxRanksAggregator {
    /// Max aggregator with the default sharpness
    pub fn new() -> Self {
        MaxRanksAggregator {
            if_empty_value: 0.0,
            beta: 50.0,
        }
    }
}

impl Default for MaxRanksAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl RanksAggregator for MaxRanksAggregator {
    fn aggregate(&self, ranks: &[f32]) -> f32 {
        if ranks.is_empty() {
            return self.if_empty_value;
        }
        ranks.iter().copied().fold(f32::NEG_INFINITY, f32::max)
    }

    fn aggregate_with_grad(&self, ranks: &[f32]) -> (f32, Vec<f32>) {
        if ranks.is_empty() {
            return (self.if_empty_value, Vec::new());
        }
        softmax_extreme(ranks, self.beta)
    }
}

/// Minimum of part ranks
#[derive(Debug, Clone, Copy)]
pub struct MinRanksAggregator {
    /// Value returned for an empty group
    pub if_empty_value: f32,
    /// Softmax sharpness of the differentiable form
    pub beta: f32,
}

impl MinRanksAggregator {
    /// Min aggregator with the default sharpness
    pub fn new() -> Self {
        MinRanksAggregator {
            if_empty_value: 0.0,
            beta: 50.0,
        }
    }
}

impl Default for MinRanksAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl RanksAggregator for MinRanksAggregator {
    fn aggregate(&self, ranks: &[f32]) -> f32 {
        if ranks.is_empty() {
            return self.if_empty_value;
        }
        ranks.iter().copied().fold(f32::INFINITY, f32::min)
    }

    fn aggregate_with_grad(&self, ranks: &[f32]) -> (f32, Vec<f32>) {
        if ranks.is_empty() {
            return (self.if_empty_value, Vec::new());
        }
        softmax_extreme(ranks, -self.beta)
    }
}

/// Arithmetic mean of part ranks
#[derive(Debug, Clone, Copy)]
pub struct MeanRanksAggregator {
    /// Value returned for an empty group
    pub if_empty_value: f32,
    /// Value returned when every rank is zero
    pub if_zeroes_value: f32,
}

impl MeanRanksAggregator {
    /// Mean aggregator with zero fallbacks
    pub fn new() -> Self {
        MeanRanksAggregator {
            if_empty_value: 0.0,
            if_zeroes_value: 0.0,
        }
    }
}

impl Default for MeanRanksAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl RanksAggregator for MeanRanksAggregator {
    fn aggregate(&self, ranks: &[f32]) -> f32 {
        if ranks.is_empty() {
            return self.if_empty_value;
        }
        let sum: f32 = ranks.iter().sum();
        if sum == 0.0 {
            return self.if_zeroes_value;
        }
        sum / ranks.len() as f32
    }

    fn aggregate_with_grad(&self, ranks: &[f32]) -> (f32, Vec<f32>) {
        if ranks.is_empty() {
            return (self.if_empty_value, Vec::new());
        }
        let sum: f32 = ranks.iter().sum();
        if sum == 0.0 {
            return (self.if_zeroes_value, vec![0.0; ranks.len()]);
        }
        let n = ranks.len() as f32;
        (sum / n, vec![1.0 / n; ranks.len()])
    }
}

/// Aggregates part clicks into one object click
pub trait ClicksAggregator: Send + Sync {
    /// Collapse a group's click indicators into one value
    fn aggregate(&self, clicks: &[f32]) -> f32;
}

/// A group counts as clicked if any of its parts was clicked
#[derive(Debug, Clone, Copy, Default)]
pub struct MaxClicksAggregator;

impl ClicksAggregator for MaxClicksAggregator {
    fn aggregate(&self, clicks: &[f32]) -> f32 {
        clicks.iter().copied().fold(0.0, f32::max)
    }
}
