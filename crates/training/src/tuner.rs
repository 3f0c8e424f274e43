//! Hyperparameter search
//!
//! The first iteration of a plugin explores a user-supplied choice grid
//! with seeded sampling (without replacement) for a bounded number of
//! trials. Every following iteration reuses the top-K parameter sets of the
//! previous iteration, with the starting run's parameters prepended.
//!
//! A failing run is recorded and skipped; only when every run of an
//! iteration fails is the previous iteration retained instead of deleted.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use tracing::{error, info, warn};

use embedtune_core::{Error, ExamplesType, FineTuningIteration, FineTuningParams, Result};
use embedtune_registry::ExperimentsTracker;

use crate::items::RankingData;
use crate::model::ModelCodec;
use crate::trainer::{fine_tune_one_param, FineTuningSettings};

/// Choice grid for the initial hyperparameter search
///
/// Each axis lists the values a trial may pick; sampling chooses uniformly
/// per axis.
#[derive(Debug, Clone)]
pub struct ParamGrid {
    /// Choices for the number of frozen layers
    pub num_fixed_layers: Vec<u32>,
    /// Choices for the query learning rate
    pub query_lr: Vec<f64>,
    /// Choices for the items learning rate
    pub items_lr: Vec<f64>,
    /// Choices for the query weight decay
    pub query_weight_decay: Vec<f64>,
    /// Choices for the items weight decay
    pub items_weight_decay: Vec<f64>,
    /// Choices for the loss margin
    pub margin: Vec<f64>,
    /// Choices for the triplet/contrastive regime switch
    pub not_irrelevant_only: Vec<bool>,
    /// Choices for the negative downsampling rate
    pub negative_downsampling: Vec<f64>,
    /// Choices for the minimal rank-difference threshold
    pub min_abs_difference_threshold: Vec<f64>,
    /// Choices for the maximal rank-difference threshold
    pub max_abs_difference_threshold: Vec<f64>,
    /// Choices for the examples order
    pub examples_order: Vec<Vec<ExamplesType>>,
}

impl Default for ParamGrid {
    fn default() -> Self {
        let defaults = FineTuningParams::default();
        ParamGrid {
            num_fixed_layers: vec![defaults.num_fixed_layers],
            query_lr: vec![defaults.query_lr],
            items_lr: vec![defaults.items_lr],
            query_weight_decay: vec![defaults.query_weight_decay],
            items_weight_decay: vec![defaults.items_weight_decay],
            margin: vec![defaults.margin],
            not_irrelevant_only: vec![defaults.not_irrelevant_only],
            negative_downsampling: vec![defaults.negative_downsampling],
            min_abs_difference_threshold: vec![defaults.min_abs_difference_threshold],
            max_abs_difference_threshold: vec![defaults.max_abs_difference_threshold],
            examples_order: vec![defaults.examples_order],
        }
    }
}

impl ParamGrid {
    /// Verify no axis is empty
    pub fn validate(&self) -> Result<()> {
        let empty = self.num_fixed_layers.is_empty()
            || self.query_lr.is_empty()
            || self.items_lr.is_empty()
            || self.query_weight_decay.is_empty()
            || self.items_weight_decay.is_empty()
            || self.margin.is_empty()
            || self.not_irrelevant_only.is_empty()
            || self.negative_downsampling.is_empty()
            || self.min_abs_difference_threshold.is_empty()
            || self.max_abs_difference_threshold.is_empty()
            || self.examples_order.is_empty();
        if empty {
            return Err(Error::validation("initial params grid must not be empty"));
        }
        Ok(())
    }

    /// Number of distinct parameter combinations
    pub fn combinations(&self) -> usize {
        [
            self.num_fixed_layers.len(),
            self.query_lr.len(),
            self.items_lr.len(),
            self.query_weight_decay.len(),
            self.items_weight_decay.len(),
            self.margin.len(),
            self.not_irrelevant_only.len(),
            self.negative_downsampling.len(),
            self.min_abs_difference_threshold.len(),
            self.max_abs_difference_threshold.len(),
            self.examples_order.len(),
        ]
        .iter()
        .fold(1usize, |acc, len| acc.saturating_mul(*len))
    }

    /// Sample one parameter set, choosing uniformly per axis
    pub fn sample<R: Rng>(&self, rng: &mut R) -> FineTuningParams {
        let pick = |values: &[f64], rng: &mut R| *values.choose(rng).expect("validated axis");
        FineTuningParams {
            num_fixed_layers: *self.num_fixed_layers.choose(rng).expect("validated axis"),
            query_lr: pick(&self.query_lr, rng),
            items_lr: pick(&self.items_lr, rng),
            query_weight_decay: pick(&self.query_weight_decay, rng),
            items_weight_decay: pick(&self.items_weight_decay, rng),
            margin: pick(&self.margin, rng),
            not_irrelevant_only: *self.not_irrelevant_only.choose(rng).expect("validated axis"),
            negative_downsampling: pick(&self.negative_downsampling, rng),
            min_abs_difference_threshold: pick(&self.min_abs_difference_threshold, rng),
            max_abs_difference_threshold: pick(&self.max_abs_difference_threshold, rng),
            examples_order: self.examples_order.choose(rng).expect("validated axis").clone(),
        }
    }
}

/// Run one fine-tuning iteration: select parameter sets and train each
///
/// The starting model is downloaded once; every run trains a fresh decoded
/// copy. On success the previous iteration's artifacts are deleted and its
/// metadata archived.
#[allow(clippy::too_many_arguments)]
pub fn fine_tune_embedding_model(
    iteration: &FineTuningIteration,
    settings: &FineTuningSettings,
    data: &mut RankingData,
    tracker: &ExperimentsTracker,
    codec: &dyn ModelCodec,
    initial_grid: &ParamGrid,
    initial_max_evals: usize,
    seed: u64,
) -> Result<()> {
    if initial_max_evals == 0 {
        return Err(Error::validation(
            "initial_max_evals should be a positive integer",
        ));
    }
    initial_grid.validate()?;

    tracker.set_iteration(iteration)?;
    info!(target: "embedtune::training", iteration = %iteration, "Start fine-tuning iteration");

    let best_params = if tracker.is_initial_run(&iteration.run_id)? {
        None
    } else {
        let starting = tracker
            .get_params_by_run_id(&iteration.run_id)?
            .ok_or_else(|| {
                Error::not_found(format!(
                    "fine-tuning params for starting run {}",
                    iteration.run_id
                ))
            })?;
        let experiment_id = tracker
            .get_experiment_id_of_run(&iteration.run_id)?
            .ok_or_else(|| {
                Error::not_found(format!("experiment of starting run {}", iteration.run_id))
            })?;
        let top = tracker
            .get_top_params_by_experiment_id(&experiment_id)?
            .ok_or_else(|| {
                Error::not_found(format!("top params of experiment {experiment_id}"))
            })?;
        let mut combined = vec![starting];
        combined.extend(top);
        Some(combined)
    };

    // The starting model artifact is fetched once per iteration; each run
    // decodes its own fresh copy.
    let model_bytes = tracker.download_model_by_run_id(&iteration.run_id)?;

    match best_params {
        None => {
            info!(
                target: "embedtune::training",
                initial_max_evals,
                "Initial iteration: sampling the provided params grid"
            );
            let mut rng = StdRng::seed_from_u64(seed);
            let trials = initial_max_evals.min(initial_grid.combinations());
            let mut seen: HashSet<String> = HashSet::new();
            let mut attempts = 0usize;
            while seen.len() < trials && attempts < initial_max_evals.saturating_mul(20) {
                attempts += 1;
                let params = initial_grid.sample(&mut rng);
                if !seen.insert(params.id()) {
                    continue;
                }
                run_one(codec, &model_bytes, settings, data, &params, tracker);
            }
        }
        Some(param_sets) => {
            info!(
                target: "embedtune::training",
                count = param_sets.len(),
                "Using best parameters from the previous fine-tuning iteration"
            );
            let mut failed_runs = 0usize;
            for (index, params) in param_sets.iter().enumerate() {
                info!(
                    target: "embedtune::training",
                    run = index + 1,
                    total = param_sets.len(),
                    "Starting run"
                );
                if !run_one(codec, &model_bytes, settings, data, params, tracker) {
                    failed_runs += 1;
                }
            }
            if failed_runs == param_sets.len() {
                error!(
                    target: "embedtune::training",
                    "Something went wrong, all runs failed; keeping the previous iteration"
                );
            } else {
                tracker.delete_previous_iteration()?;
            }
        }
    }

    tracker.finish_iteration()
}

/// Train one parameter set on a fresh copy of the starting model
///
/// Failures are logged and swallowed so the search continues.
fn run_one(
    codec: &dyn ModelCodec,
    model_bytes: &[u8],
    settings: &FineTuningSettings,
    data: &mut RankingData,
    params: &FineTuningParams,
    tracker: &ExperimentsTracker,
) -> bool {
    let mut model = match codec.decode(model_bytes) {
        Ok(model) => model,
        Err(e) => {
            error!(target: "embedtune::training", error = %e, "Cannot decode the starting model");
            return false;
        }
    };
    match fine_tune_one_param(model.as_mut(), settings, data, params, tracker) {
        Ok(quality) => {
            info!(target: "embedtune::training", quality, "Run finished");
            true
        }
        Err(e) => {
            warn!(target: "embedtune::training", error = %e, "Run failed, continuing the search");
            false
        }
    }
}
