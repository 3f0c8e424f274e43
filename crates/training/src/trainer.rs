//! Fine-tuning driver
//!
//! One run: freeze layers, resolve missing display ranks, loop epochs over
//! the train loader, periodically evaluate on the test loader, stop early
//! when the validation loss stalls, then elect the best model through the
//! tracker.
//!
//! The loop is explicit: extract features, compute the loss and its rank
//! gradients, push gradients through the extraction graph into the model,
//! and step one optimizer per sub-model. The cooperative scheduling point
//! is the batch boundary.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use embedtune_core::{Error, FineTuningParams, Result};
use embedtune_registry::{ExperimentsTracker, MetricValue};

use crate::aggregators::{
    ClicksAggregator, MaxClicksAggregator, MeanRanksAggregator, RanksAggregator,
};
use crate::confidences::{dummy_confidences, ConfidenceCalculator};
use crate::extractor::FeatureExtractor;
use crate::items::{ItemsSet, RankingData};
use crate::loss::{CosineProbMarginRankingLoss, RankingLoss};
use crate::metrics::{DistanceShift, MetricCalculator};
use crate::model::EmbeddingModel;
use crate::optimizer::{Sgd, StepDecay};
use crate::ranker::{CosineRanker, Ranker};

/// Settings of the fine-tuning procedure shared by every run
pub struct FineTuningSettings {
    /// Ranking loss; cloned and re-margined per run
    pub loss: Box<dyn RankingLoss>,
    /// Trackable metrics beyond the loss
    pub metric_calculators: Vec<Arc<dyn MetricCalculator>>,
    /// Ranking function
    pub ranker: Arc<dyn Ranker>,
    /// Confidence calculator for (non-)click evidence
    pub confidence_calculator: ConfidenceCalculator,
    /// Rank aggregation over split items
    pub ranks_aggregator: Arc<dyn RanksAggregator>,
    /// Click aggregation over split items
    pub clicks_aggregator: Arc<dyn ClicksAggregator>,
    /// Scheduler step size (optimizer steps per decay)
    pub step_size: usize,
    /// Scheduler decay factor
    pub gamma: f32,
    /// Number of training epochs
    pub num_epochs: usize,
    /// Input pairs per batch
    pub batch_size: usize,
    /// Test-pass frequency: values in (0, 1] are a fraction of the train
    /// loader length, larger values a batch count, non-positive values mean
    /// once per epoch
    pub test_each_n_inputs: f64,
    /// Consecutive non-improving test passes before stopping
    pub early_stopping_patience: usize,
    /// Seed of the loader shuffling and negative downsampling
    pub seed: u64,
}

impl FineTuningSettings {
    /// Cosine-similarity defaults: cosine loss and ranker, mean rank
    /// aggregation, max click aggregation, distance-shift metric
    pub fn cosine_defaults() -> Self {
        FineTuningSettings {
            loss: Box::new(CosineProbMarginRankingLoss::default()),
            metric_calculators: vec![Arc::new(DistanceShift)],
            ranker: Arc::new(CosineRanker::new()),
            confidence_calculator: dummy_confidences,
            ranks_aggregator: Arc::new(MeanRanksAggregator::new()),
            clicks_aggregator: Arc::new(MaxClicksAggregator),
            step_size: 500,
            gamma: 0.9,
            num_epochs: 10,
            batch_size: 1,
            test_each_n_inputs: -1.0,
            early_stopping_patience: 3,
            seed: 42,
        }
    }

    fn extractor(&self, params: &FineTuningParams) -> Result<FeatureExtractor> {
        FeatureExtractor::new(
            Arc::clone(&self.ranker),
            params.not_irrelevant_only,
            params.negative_downsampling,
            params.min_abs_difference_threshold as f32,
            params.max_abs_difference_threshold as f32,
            self.confidence_calculator,
            Arc::clone(&self.ranks_aggregator),
            Arc::clone(&self.clicks_aggregator),
        )
    }
}

/// Run fine-tuning for one parameter set
///
/// Starts (or resumes) the tracker run, trains unless an equivalent run
/// already finished with its model uploaded, saves the model best-only and
/// closes the run. A failure during training closes the run as FAILED and
/// surfaces `RunFailed`; the hyperparameter search treats that as a skip.
pub fn fine_tune_one_param(
    model: &mut dyn EmbeddingModel,
    settings: &FineTuningSettings,
    data: &mut RankingData,
    params: &FineTuningParams,
    tracker: &ExperimentsTracker,
) -> Result<f64> {
    params.validate()?;
    let already_finished = tracker.set_run(params)?;

    if already_finished {
        warn!(target: "embedtune::training", "Run with these params is finished");
        if let Ok(quality) = tracker.get_quality() {
            let (best_run, best_quality) = tracker.get_best_quality()?;
            let is_worse = if tracker.is_loss() {
                quality > best_quality
            } else {
                quality < best_quality
            };
            if best_run.is_some() && is_worse {
                info!(
                    target: "embedtune::training",
                    quality,
                    best_quality,
                    "Not retrying: run quality is not the best"
                );
                tracker.finish_run(false)?;
                return Ok(quality);
            }
            if tracker.model_is_uploaded()? {
                info!(
                    target: "embedtune::training",
                    "Not retrying: run already has its model uploaded"
                );
                tracker.finish_run(false)?;
                return Ok(quality);
            }
        }
    }

    match run_training(model, settings, data, params, tracker) {
        Ok(quality) => {
            tracker.finish_run(false)?;
            Ok(quality)
        }
        Err(e) => {
            warn!(target: "embedtune::training", error = %e, "Fine-tuning run failed");
            if let Err(finish_error) = tracker.finish_run(true) {
                warn!(
                    target: "embedtune::training",
                    error = %finish_error,
                    "Could not close the failed run"
                );
            }
            Err(Error::RunFailed(e.to_string()))
        }
    }
}

fn run_training(
    model: &mut dyn EmbeddingModel,
    settings: &FineTuningSettings,
    data: &mut RankingData,
    params: &FineTuningParams,
    tracker: &ExperimentsTracker,
) -> Result<f64> {
    let extractor = settings.extractor(params)?;

    model.fix_query_layers(params.num_fixed_layers);
    model.fix_item_layers(params.num_fixed_layers);

    preprocess_ranks(&extractor, data, model)?;

    let mut loss = settings.loss.clone_box();
    loss.set_margin(params.margin as f32);

    let mut items_optimizer = Sgd::new(
        params.items_lr as f32,
        params.items_weight_decay as f32,
    )?;
    let mut items_schedule = StepDecay::new(
        params.items_lr as f32,
        settings.step_size,
        settings.gamma,
    )?;
    let mut query_optimizer = if model.same_query_and_items() {
        None
    } else {
        Some((
            Sgd::new(params.query_lr as f32, params.query_weight_decay as f32)?,
            StepDecay::new(params.query_lr as f32, settings.step_size, settings.gamma)?,
        ))
    };

    let train_len = data.clickstream.train.len();
    if train_len == 0 {
        return Err(Error::validation("train split is empty"));
    }
    let batch_size = settings.batch_size.max(1);
    let batches_per_epoch = (train_len + batch_size - 1) / batch_size;
    let test_every = resolve_test_interval(settings.test_each_n_inputs, batches_per_epoch);

    let mut rng = StdRng::seed_from_u64(settings.seed);
    let mut best_val_loss = f64::INFINITY;
    let mut stale_passes = 0usize;
    let mut batch_counter = 0usize;
    let mut test_passes = 0usize;
    let mut stop_early = false;

    for epoch in 0..settings.num_epochs {
        let mut order: Vec<usize> = (0..train_len).collect();
        order.shuffle(&mut rng);

        for batch in data.clickstream.train.batches(batch_size, &order) {
            model.zero_grad();

            let (features, graph) =
                extractor.extract_batch(&batch, &data.items, &*model, &mut rng)?;
            let (loss_value, rank_grads) = loss.forward_backward(&features);
            let gradients = graph.backward(&features, &rank_grads);

            for (query, grad) in &gradients.query_grads {
                model.backward_query(query, grad)?;
            }
            let mut grad_items = Vec::with_capacity(gradients.item_grads.len());
            let mut grad_vectors = Vec::with_capacity(gradients.item_grads.len());
            for (id, grad) in &gradients.item_grads {
                if let Some(item) = data.items.get(id) {
                    grad_items.push(item.clone());
                    grad_vectors.push(grad.clone());
                }
            }
            model.backward_items(&grad_items, &grad_vectors)?;

            items_optimizer.step(model.item_parameters());
            items_optimizer.set_lr(items_schedule.step());
            if let Some((optimizer, schedule)) = query_optimizer.as_mut() {
                optimizer.step(model.query_parameters());
                optimizer.set_lr(schedule.step());
            }

            tracker.save_metric(
                &MetricValue::new("loss", loss_value as f64)?.add_prefix("train"),
            )?;
            for calculator in &settings.metric_calculators {
                let values = calculator.calculate(
                    &batch,
                    settings.ranker.as_ref(),
                    &extractor,
                    &data.items,
                    &*model,
                )?;
                for value in values {
                    tracker.save_metric(&value.add_prefix("train"))?;
                }
            }

            batch_counter += 1;
            if batch_counter % test_every == 0 {
                if let Some(val_loss) =
                    test_pass(&extractor, &*loss, settings, data, &*model, tracker, &mut rng)?
                {
                    test_passes += 1;
                    if val_loss < best_val_loss {
                        best_val_loss = val_loss;
                        stale_passes = 0;
                    } else {
                        stale_passes += 1;
                        if stale_passes >= settings.early_stopping_patience {
                            info!(
                                target: "embedtune::training",
                                epoch,
                                best_val_loss,
                                "Validation loss stalled, stopping early"
                            );
                            stop_early = true;
                        }
                    }
                }
            }
            if stop_early {
                break;
            }
        }
        debug!(target: "embedtune::training", epoch, "Epoch finished");
        if stop_early {
            break;
        }
    }

    // Make sure the main metric exists even when the interval never fired
    if test_passes == 0 {
        test_pass(&extractor, &*loss, settings, data, &*model, tracker, &mut rng)?;
    }

    model.unfix_query_layers();
    model.unfix_item_layers();

    let quality = match tracker.get_quality() {
        Ok(quality) => quality,
        Err(e) => {
            warn!(target: "embedtune::training", error = %e, "No main-metric value for this run");
            0.0
        }
    };
    info!(target: "embedtune::training", quality, "Saving model (best only)");
    if let Err(e) = tracker.save_model(model.to_bytes()?, true) {
        warn!(target: "embedtune::training", error = %e, "Unable to save the model");
    }
    Ok(quality)
}

/// Resolve missing display ranks by scoring results with the current model
fn preprocess_ranks(
    extractor: &FeatureExtractor,
    data: &mut RankingData,
    model: &dyn EmbeddingModel,
) -> Result<()> {
    let items = &data.items;
    let mut failure: Option<Error> = None;
    let mut fill = |input: &mut embedtune_core::FineTuningInput| {
        if failure.is_some() || !input.has_unresolved_ranks() {
            return;
        }
        match extractor.calculate_ranks(input, items, model) {
            Ok(ranks) => input.ranks = ranks,
            Err(e) => failure = Some(e),
        }
    };
    data.clickstream.train.for_each_input_mut(&mut fill);
    data.clickstream.test.for_each_input_mut(&mut fill);
    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn resolve_test_interval(test_each_n_inputs: f64, batches_per_epoch: usize) -> usize {
    if test_each_n_inputs > 0.0 && test_each_n_inputs <= 1.0 {
        ((test_each_n_inputs * batches_per_epoch as f64).round() as usize).max(1)
    } else if test_each_n_inputs > 1.0 {
        test_each_n_inputs as usize
    } else {
        batches_per_epoch.max(1)
    }
}

/// One gradient-free pass over the test loader
///
/// Emits the arithmetic mean of every metric with the `test_` prefix and
/// returns the mean loss, `None` when the test split is empty.
fn test_pass(
    extractor: &FeatureExtractor,
    loss: &dyn RankingLoss,
    settings: &FineTuningSettings,
    data: &RankingData,
    model: &dyn EmbeddingModel,
    tracker: &ExperimentsTracker,
    rng: &mut StdRng,
) -> Result<Option<f64>> {
    let test = &data.clickstream.test;
    if test.is_empty() {
        return Ok(None);
    }
    let mut accumulated: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    let order: Vec<usize> = (0..test.len()).collect();
    for batch in test.batches(1, &order) {
        let (features, _graph) = extractor.extract_batch(&batch, &data.items, model, rng)?;
        let loss_value = loss.forward(&features) as f64;
        accumulated.entry("loss".to_string()).or_default().push(loss_value);

        for calculator in &settings.metric_calculators {
            let values = calculator.calculate(
                &batch,
                settings.ranker.as_ref(),
                extractor,
                &data.items,
                model,
            )?;
            for value in values {
                accumulated
                    .entry(value.name().to_string())
                    .or_default()
                    .push(value.value());
            }
        }
    }

    let mut mean_loss = None;
    for (name, values) in accumulated {
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        if name == "loss" {
            mean_loss = Some(mean);
        }
        tracker.save_metric(&MetricValue::new(name, mean)?.add_prefix("test"))?;
    }
    Ok(mean_loss)
}
