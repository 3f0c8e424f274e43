//! Fine-tuning hyperparameters
//!
//! One `FineTuningParams` value identifies one training run. The run name in
//! the experiment registry is the SHA-256 digest of the canonical string
//! form, so identical parameter sets map to the same run across retries.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Which example difficulty classes a trainer consumes, and in what order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExamplesType {
    /// Medium-difficulty examples of both polarities
    MediumAll,
    /// Hard examples of both polarities
    HardAll,
    /// Soft examples of both polarities
    SoftAll,
    /// Medium-difficulty positive examples
    MediumPositive,
    /// Hard positive examples
    HardPositive,
    /// Soft positive examples
    SoftPositive,
    /// Medium-difficulty negative examples
    MediumNegative,
    /// Hard negative examples
    HardNegative,
    /// Soft negative examples
    SoftNegative,
    /// Negative examples only
    NegativeOnly,
    /// Every example
    AllExamples,
}

impl ExamplesType {
    /// Get string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            ExamplesType::MediumAll => "medium_all",
            ExamplesType::HardAll => "hard_all",
            ExamplesType::SoftAll => "soft_all",
            ExamplesType::MediumPositive => "medium_positive",
            ExamplesType::HardPositive => "hard_positive",
            ExamplesType::SoftPositive => "soft_positive",
            ExamplesType::MediumNegative => "medium_negative",
            ExamplesType::HardNegative => "hard_negative",
            ExamplesType::SoftNegative => "soft_negative",
            ExamplesType::NegativeOnly => "negative_only",
            ExamplesType::AllExamples => "all_examples",
        }
    }
}

/// Hyperparameters of one fine-tuning run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FineTuningParams {
    /// Number of frozen layers in each sub-model
    pub num_fixed_layers: u32,
    /// Learning rate of the query-model optimizer
    pub query_lr: f64,
    /// Learning rate of the items-model optimizer
    pub items_lr: f64,
    /// Weight decay of the query-model optimizer
    pub query_weight_decay: f64,
    /// Weight decay of the items-model optimizer
    pub items_weight_decay: f64,
    /// Margin of the ranking loss
    pub margin: f64,
    /// Use only not-irrelevant inputs (triplet regime) instead of pairing
    /// with irrelevant inputs (contrastive regime)
    pub not_irrelevant_only: bool,
    /// Fraction of negative groups kept per input, in (0, 1]
    pub negative_downsampling: f64,
    /// Drop pairs with |pos - neg| below this threshold
    pub min_abs_difference_threshold: f64,
    /// Drop pairs with |pos - neg| above this threshold
    pub max_abs_difference_threshold: f64,
    /// Order of passing examples to the trainer
    pub examples_order: Vec<ExamplesType>,
}

impl Default for FineTuningParams {
    fn default() -> Self {
        FineTuningParams {
            num_fixed_layers: 0,
            query_lr: 1e-3,
            items_lr: 1e-3,
            query_weight_decay: 0.0,
            items_weight_decay: 0.0,
            margin: 1.0,
            not_irrelevant_only: true,
            negative_downsampling: 0.5,
            min_abs_difference_threshold: 0.0,
            max_abs_difference_threshold: 1.0,
            examples_order: vec![ExamplesType::AllExamples],
        }
    }
}

impl FineTuningParams {
    /// Validate all numeric constraints
    pub fn validate(&self) -> Result<()> {
        if !(self.query_lr > 0.0) {
            return Err(Error::validation("query_lr must be a positive float"));
        }
        if !(self.items_lr > 0.0) {
            return Err(Error::validation("items_lr must be a positive float"));
        }
        if self.query_weight_decay < 0.0 {
            return Err(Error::validation("query_weight_decay must be non-negative"));
        }
        if self.items_weight_decay < 0.0 {
            return Err(Error::validation("items_weight_decay must be non-negative"));
        }
        if self.margin < 0.0 {
            return Err(Error::validation("margin must be non-negative"));
        }
        if !(self.negative_downsampling > 0.0 && self.negative_downsampling <= 1.0) {
            return Err(Error::validation(
                "negative_downsampling must be in range (0, 1]",
            ));
        }
        if self.min_abs_difference_threshold < 0.0 {
            return Err(Error::validation(
                "min_abs_difference_threshold must be non-negative",
            ));
        }
        if !(self.max_abs_difference_threshold > 0.0) {
            return Err(Error::validation(
                "max_abs_difference_threshold must be positive",
            ));
        }
        if self.examples_order.is_empty() {
            return Err(Error::validation("examples_order must not be empty"));
        }
        Ok(())
    }

    /// Validate and return self, for construction chains
    pub fn validated(self) -> Result<Self> {
        self.validate()?;
        Ok(self)
    }

    /// Canonical string form: `key: value` pairs joined by `" / "`
    ///
    /// Field order is fixed; this string is the hashing input for `id`.
    pub fn canonical_string(&self) -> String {
        let examples = self
            .examples_order
            .iter()
            .map(|e| e.as_str())
            .collect::<Vec<_>>()
            .join(",");
        format!(
            "num_fixed_layers: {} / query_lr: {} / items_lr: {} / \
             query_weight_decay: {} / items_weight_decay: {} / margin: {} / \
             not_irrelevant_only: {} / negative_downsampling: {} / \
             min_abs_difference_threshold: {} / max_abs_difference_threshold: {} / \
             examples_order: {}",
            self.num_fixed_layers,
            self.query_lr,
            self.items_lr,
            self.query_weight_decay,
            self.items_weight_decay,
            self.margin,
            self.not_irrelevant_only,
            self.negative_downsampling,
            self.min_abs_difference_threshold,
            self.max_abs_difference_threshold,
            examples,
        )
    }

    /// Deterministic run identifier: SHA-256 hex of the canonical string
    pub fn id(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.canonical_string().as_bytes());
        let digest = hasher.finalize();
        digest.iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl std::fmt::Display for FineTuningParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.canonical_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_params_valid() {
        FineTuningParams::default().validate().unwrap();
    }

    #[test]
    fn test_negative_lr_rejected() {
        let params = FineTuningParams {
            query_lr: -0.1,
            ..Default::default()
        };
        assert!(params.validate().unwrap_err().is_validation());
    }

    #[test]
    fn test_zero_lr_rejected() {
        let params = FineTuningParams {
            items_lr: 0.0,
            ..Default::default()
        };
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_downsampling_bounds() {
        let low = FineTuningParams {
            negative_downsampling: 0.0,
            ..Default::default()
        };
        assert!(low.validate().is_err());

        let full = FineTuningParams {
            negative_downsampling: 1.0,
            ..Default::default()
        };
        full.validate().unwrap();

        let high = FineTuningParams {
            negative_downsampling: 1.5,
            ..Default::default()
        };
        assert!(high.validate().is_err());
    }

    #[test]
    fn test_empty_examples_order_rejected() {
        let params = FineTuningParams {
            examples_order: vec![],
            ..Default::default()
        };
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_id_is_stable_and_distinct() {
        let a = FineTuningParams::default();
        let b = FineTuningParams::default();
        assert_eq!(a.id(), b.id());
        assert_eq!(a.id().len(), 64);

        let c = FineTuningParams {
            margin: 2.0,
            ..Default::default()
        };
        assert_ne!(a.id(), c.id());
    }

    #[test]
    fn test_canonical_string_contains_all_fields() {
        let s = FineTuningParams::default().canonical_string();
        for key in [
            "num_fixed_layers",
            "query_lr",
            "items_lr",
            "query_weight_decay",
            "items_weight_decay",
            "margin",
            "not_irrelevant_only",
            "negative_downsampling",
            "min_abs_difference_threshold",
            "max_abs_difference_threshold",
            "examples_order",
        ] {
            assert!(s.contains(key), "missing {key} in {s}");
        }
        assert!(s.contains("all_examples"));
    }

    #[test]
    fn test_serde_roundtrip() {
        let params = FineTuningParams::default();
        let json = serde_json::to_string(&params).unwrap();
        let restored: FineTuningParams = serde_json::from_str(&json).unwrap();
        assert_eq!(params, restored);
        assert_eq!(params.id(), restored.id());
    }
}
