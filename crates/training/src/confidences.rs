//! Event confidence calculators
//!
//! A confidence weighs how trustworthy one (non-)click is as a training
//! signal. Calculators see parallel rank and click vectors over result
//! positions and return one confidence per position.

/// Calculator signature: `(ranks, clicks) -> confidences`
///
/// `clicks[i]` is 1.0 for an event, 0.0 otherwise. Output is parallel to
/// the inputs.
pub type ConfidenceCalculator = fn(&[f32], &[f32]) -> Vec<f32>;

/// Every confidence is 1.0
pub fn dummy_confidences(_ranks: &[f32], clicks: &[f32]) -> Vec<f32> {
    vec![1.0; clicks.len()]
}

/// Window-based confidence over result positions
///
/// For each position a window of `WINDOW_SIZE` neighbors yields the local
/// average rank and click proportion. A click surrounded by other clicks
/// with similar ranks is trustworthy; a click that contradicts its
/// neighborhood is trusted in proportion to how much its rank deviates.
/// A position bias `exp(-3(i+1)/N - 0.3) + 0.25` damps the tail, and the
/// result is min-max normalized into [0, 1].
pub fn calculate_confidences(ranks: &[f32], clicks: &[f32]) -> Vec<f32> {
    const WINDOW_SIZE: usize = 3;
    calculate_confidences_windowed(ranks, clicks, WINDOW_SIZE)
}

/// Window-based confidences with an explicit window size
pub fn calculate_confidences_windowed(
    ranks: &[f32],
    clicks: &[f32],
    window_size: usize,
) -> Vec<f32> {
    let num_results = clicks.len();
    if num_results == 0 {
        return Vec::new();
    }
    let mut scores = vec![0.0_f32; num_results];

    for i in 0..num_results {
        let start = i.saturating_sub(window_size / 2);
        let end = (i + window_size / 2 + 1).min(num_results);

        let window_ranks = &ranks[start..end];
        let window_clicks = &clicks[start..end];

        let avg_rank: f32 = window_ranks.iter().sum::<f32>() / window_ranks.len() as f32;
        let click_proportion: f32 =
            window_clicks.iter().sum::<f32>() / window_clicks.len() as f32;

        let rank_similarity = if avg_rank != 0.0 {
            (ranks[i] - avg_rank).abs() / avg_rank
        } else {
            0.0
        };
        let position_score =
            (-3.0 * (i as f32 + 1.0) / num_results as f32 - 0.3).exp() + 0.25;

        let confidence = if clicks[i] == 1.0 {
            (1.0 - rank_similarity) * click_proportion
                + (1.0 - click_proportion) * rank_similarity
        } else {
            (1.0 - click_proportion) * (1.0 - rank_similarity)
                + click_proportion * rank_similarity
        };
        scores[i] = confidence * position_score;
    }

    // Min-max normalize; a flat vector normalizes to all ones
    let min = scores.iter().copied().fold(f32::INFINITY, f32::min);
    let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if (max - min).abs() < f32::EPSILON {
        return vec![1.0; num_results];
    }
    scores.iter().map(|s| (s - min) / (max - min)).collect()
}
