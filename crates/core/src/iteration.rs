//! Fine-tuning iteration identity
//!
//! An iteration groups all runs over one released batch for one plugin. Its
//! string form doubles as the experiment name in the registry:
//!
//! `"{plugin_name} / iteration / {run_id} / {batch_id}"`
//!
//! The special initial experiment (holding the hand-uploaded starting model)
//! is named `"{plugin_name} / iteration / initial"`.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Experiment-name segment marking an iteration
pub const ITERATION_PREFIX: &str = "iteration";

/// Name segment of the initial experiment
pub const INITIAL_SEGMENT: &str = "initial";

/// Identity of one fine-tuning iteration
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FineTuningIteration {
    /// Released session batch this iteration trains on
    pub batch_id: String,
    /// Run that produced the starting model (best run of the prior
    /// iteration); empty for the first iteration
    pub run_id: String,
    /// Name of the fine-tuning plugin
    pub plugin_name: String,
}

impl FineTuningIteration {
    /// Create an iteration identity
    pub fn new(
        plugin_name: impl Into<String>,
        run_id: impl Into<String>,
        batch_id: impl Into<String>,
    ) -> Self {
        FineTuningIteration {
            batch_id: batch_id.into(),
            run_id: run_id.into(),
            plugin_name: plugin_name.into(),
        }
    }

    /// Name of the initial experiment for a plugin
    pub fn initial_experiment_name(plugin_name: &str) -> String {
        format!("{plugin_name} / {ITERATION_PREFIX} / {INITIAL_SEGMENT}")
    }

    /// Parse an experiment name back into an iteration identity
    ///
    /// The initial form parses to an iteration with empty run and batch ids.
    pub fn parse(experiment_name: &str) -> Result<Self> {
        let parts: Vec<&str> = experiment_name.split(" / ").collect();
        if parts.contains(&INITIAL_SEGMENT) {
            if parts.len() != 3 {
                return Err(Error::validation(format!(
                    "experiment name does not follow the pattern: {experiment_name}"
                )));
            }
            return Ok(FineTuningIteration {
                plugin_name: parts[0].to_string(),
                ..Default::default()
            });
        }
        if parts.len() != 4 || parts[1] != ITERATION_PREFIX {
            return Err(Error::validation(format!(
                "experiment name does not follow the pattern: {experiment_name}"
            )));
        }
        Ok(FineTuningIteration {
            plugin_name: parts[0].to_string(),
            run_id: parts[2].to_string(),
            batch_id: parts[3].to_string(),
        })
    }
}

impl std::fmt::Display for FineTuningIteration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} / {} / {} / {}",
            self.plugin_name, ITERATION_PREFIX, self.run_id, self.batch_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_form() {
        let it = FineTuningIteration::new("text_default", "run-7", "batch-3");
        assert_eq!(it.to_string(), "text_default / iteration / run-7 / batch-3");
    }

    #[test]
    fn test_parse_roundtrip() {
        let it = FineTuningIteration::new("text_default", "run-7", "batch-3");
        let parsed = FineTuningIteration::parse(&it.to_string()).unwrap();
        assert_eq!(it, parsed);
    }

    #[test]
    fn test_parse_initial_form() {
        let name = FineTuningIteration::initial_experiment_name("text_default");
        assert_eq!(name, "text_default / iteration / initial");

        let parsed = FineTuningIteration::parse(&name).unwrap();
        assert_eq!(parsed.plugin_name, "text_default");
        assert!(parsed.run_id.is_empty());
        assert!(parsed.batch_id.is_empty());
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(FineTuningIteration::parse("just-a-name").is_err());
        assert!(FineTuningIteration::parse("a / b / c / d").is_err());
        assert!(FineTuningIteration::parse("a / initial").is_err());
    }
}
