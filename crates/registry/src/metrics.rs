//! Metric values and accumulators
//!
//! A tracker feeds every reported metric through its accumulators; each
//! accumulator owns one metric name and emits the last value plus the
//! aggregations it was configured for (mean, sliding mean over a window,
//! min, max).

use embedtune_core::{Error, Result};

/// One named metric observation
#[derive(Debug, Clone, PartialEq)]
pub struct MetricValue {
    name: String,
    value: f64,
}

impl MetricValue {
    /// Create a metric value; the name must not be empty
    pub fn new(name: impl Into<String>, value: f64) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::validation("metric name should not be empty"));
        }
        Ok(MetricValue { name, value })
    }

    /// Metric name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Metric value
    pub fn value(&self) -> f64 {
        self.value
    }

    /// Prefix the name, e.g. `loss` -> `train_loss`
    pub fn add_prefix(mut self, prefix: &str) -> Self {
        self.name = format!("{prefix}_{}", self.name);
        self
    }
}

/// Accumulator of one metric plus its aggregations
#[derive(Debug, Clone)]
pub struct MetricsAccumulator {
    name: String,
    calc_mean: bool,
    calc_sliding: bool,
    calc_min: bool,
    calc_max: bool,
    window_size: usize,
    values: Vec<f64>,
}

impl MetricsAccumulator {
    /// Create an accumulator
    ///
    /// `window_size` bounds the sliding mean and must be greater than 1.
    pub fn new(
        name: impl Into<String>,
        calc_mean: bool,
        calc_sliding: bool,
        calc_min: bool,
        calc_max: bool,
        window_size: usize,
    ) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::validation("accumulator name should not be empty"));
        }
        if window_size <= 1 {
            return Err(Error::validation("window_size should be greater than 1"));
        }
        Ok(MetricsAccumulator {
            name,
            calc_mean,
            calc_sliding,
            calc_min,
            calc_max,
            window_size,
            values: Vec::new(),
        })
    }

    /// Accumulator that only re-emits the last value
    pub fn last_only(name: impl Into<String>) -> Result<Self> {
        Self::new(name, false, false, false, false, 10)
    }

    /// Metric name this accumulator listens for
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Drop all accumulated values
    pub fn clear(&mut self) {
        self.values.clear();
    }

    /// Add a value if the name matches; returns the refreshed aggregations
    pub fn accumulate(&mut self, value: &MetricValue) -> Vec<(String, f64)> {
        if self.name != value.name() {
            return Vec::new();
        }
        self.values.push(value.value());
        self.aggregate()
    }

    /// Current aggregations: last value plus whatever was configured
    pub fn aggregate(&self) -> Vec<(String, f64)> {
        let Some(last) = self.values.last() else {
            return Vec::new();
        };
        let mut aggregations = vec![(self.name.clone(), *last)];
        if self.calc_mean {
            aggregations.push((format!("mean_{}", self.name), mean(&self.values)));
        }
        if self.calc_sliding {
            let window = if self.values.len() < self.window_size {
                &self.values[..]
            } else {
                &self.values[self.values.len() - self.window_size..]
            };
            aggregations.push((format!("sliding_{}", self.name), mean(window)));
        }
        if self.calc_min {
            let min = self.values.iter().copied().fold(f64::INFINITY, f64::min);
            aggregations.push((format!("min_{}", self.name), min));
        }
        if self.calc_max {
            let max = self
                .values
                .iter()
                .copied()
                .fold(f64::NEG_INFINITY, f64::max);
            aggregations.push((format!("max_{}", self.name), max));
        }
        aggregations
    }
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_value_rejects_empty_name() {
        assert!(MetricValue::new("", 1.0).is_err());
    }

    #[test]
    fn test_metric_value_prefix() {
        let m = MetricValue::new("loss", 0.5).unwrap().add_prefix("train");
        assert_eq!(m.name(), "train_loss");
        assert_eq!(m.value(), 0.5);
    }

    #[test]
    fn test_accumulator_validation() {
        assert!(MetricsAccumulator::new("", true, false, false, false, 10).is_err());
        assert!(MetricsAccumulator::new("loss", true, false, false, false, 1).is_err());
    }

    #[test]
    fn test_accumulator_ignores_other_names() {
        let mut acc = MetricsAccumulator::last_only("loss").unwrap();
        let out = acc.accumulate(&MetricValue::new("accuracy", 0.9).unwrap());
        assert!(out.is_empty());
        assert!(acc.aggregate().is_empty());
    }

    #[test]
    fn test_accumulator_all_aggregations() {
        let mut acc = MetricsAccumulator::new("loss", true, true, true, true, 2).unwrap();
        acc.accumulate(&MetricValue::new("loss", 4.0).unwrap());
        acc.accumulate(&MetricValue::new("loss", 2.0).unwrap());
        let out = acc.accumulate(&MetricValue::new("loss", 3.0).unwrap());

        let lookup = |name: &str| {
            out.iter()
                .find(|(n, _)| n == name)
                .map(|(_, v)| *v)
                .unwrap()
        };
        assert_eq!(lookup("loss"), 3.0);
        assert_eq!(lookup("mean_loss"), 3.0);
        assert_eq!(lookup("sliding_loss"), 2.5); // last two values
        assert_eq!(lookup("min_loss"), 2.0);
        assert_eq!(lookup("max_loss"), 4.0);
    }

    #[test]
    fn test_sliding_with_short_history_uses_all_values() {
        let mut acc = MetricsAccumulator::new("loss", false, true, false, false, 10).unwrap();
        acc.accumulate(&MetricValue::new("loss", 1.0).unwrap());
        let out = acc.accumulate(&MetricValue::new("loss", 3.0).unwrap());
        let sliding = out.iter().find(|(n, _)| n == "sliding_loss").unwrap().1;
        assert_eq!(sliding, 2.0);
    }

    #[test]
    fn test_clear_resets_history() {
        let mut acc = MetricsAccumulator::new("loss", true, false, false, false, 5).unwrap();
        acc.accumulate(&MetricValue::new("loss", 1.0).unwrap());
        acc.clear();
        assert!(acc.aggregate().is_empty());
    }
}
