//! Experiment tracker
//!
//! The tracker layers the fine-tuning experiment state machine over a
//! `TrackingBackend`:
//!
//! - plugins own iterations (experiments), iterations own runs, runs own
//!   metrics, parameters and a single model artifact
//! - run names are deterministic (the parameter-set id), so re-running the
//!   same parameters resumes the same run
//! - the best run's artifact is retained; electing a new best deletes the
//!   previous artifact
//! - every backend verb runs through the retry envelope
//!
//! The tracker holds the current iteration and run as explicit state; there
//! are no process-wide singletons.

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, warn};

use embedtune_core::{Error, FineTuningIteration, FineTuningParams, Result};

use crate::backend::{RunRecord, RunStatus, TrackingBackend};
use crate::metrics::{MetricValue, MetricsAccumulator};
use crate::retry::{retry_call, RetryConfig};

/// Artifact name of the model blob within a run
pub const MODEL_ARTIFACT_NAME: &str = "model/data/model.bin";

/// Metric flagging that a run has its model uploaded
pub const MODEL_UPLOADED_METRIC: &str = "model_uploaded";

/// Metric flagging that a run's model was deleted by retention
pub const MODEL_DELETED_METRIC: &str = "model_deleted";

/// Run name of the hand-uploaded starting model
pub const INITIAL_RUN_NAME: &str = "initial_model";

/// Parameter key carrying the lossless JSON form of the run's params
const PARAMS_JSON_KEY: &str = "params_json";

/// Tracker construction options
#[derive(Debug, Clone)]
pub struct TrackerOptions {
    /// Name of the metric that elects the iteration winner
    pub main_metric: String,
    /// Plugin whose iterations this tracker manages
    pub plugin_name: String,
    /// Whether the main metric is a loss (lower is better)
    pub is_loss: bool,
    /// How many top parameter sets following iterations reuse
    pub n_top_runs: usize,
    /// Retry policy for backend verbs
    pub retry_config: RetryConfig,
}

impl TrackerOptions {
    /// Options with the usual defaults
    pub fn new(main_metric: impl Into<String>, plugin_name: impl Into<String>) -> Self {
        TrackerOptions {
            main_metric: main_metric.into(),
            plugin_name: plugin_name.into(),
            is_loss: false,
            n_top_runs: 10,
            retry_config: RetryConfig::default(),
        }
    }

    /// Mark the main metric as a loss (lower is better)
    pub fn loss_metric(mut self) -> Self {
        self.is_loss = true;
        self
    }
}

#[derive(Default)]
struct TrackerState {
    iteration_name: Option<String>,
    iteration_id: Option<String>,
    run_id: Option<String>,
}

type RetryPredicate = Box<dyn Fn(&Error) -> bool + Send + Sync>;

/// The experiment-registry state machine
pub struct ExperimentsTracker {
    backend: Arc<dyn TrackingBackend>,
    main_metric: String,
    plugin_name: String,
    is_loss: bool,
    n_top_runs: usize,
    retry: RetryConfig,
    is_retryable: Option<RetryPredicate>,
    accumulators: Mutex<Vec<MetricsAccumulator>>,
    state: Mutex<TrackerState>,
}

impl ExperimentsTracker {
    /// Create a tracker
    ///
    /// Without accumulators only raw metric values are logged.
    pub fn new(
        backend: Arc<dyn TrackingBackend>,
        options: TrackerOptions,
        accumulators: Vec<MetricsAccumulator>,
    ) -> Result<Self> {
        if options.main_metric.is_empty() {
            return Err(Error::validation("main_metric should not be empty"));
        }
        if options.plugin_name.is_empty() {
            return Err(Error::validation("plugin_name should not be empty"));
        }
        if accumulators.is_empty() {
            warn!(
                target: "embedtune::registry",
                "No accumulators provided, metrics will pass through unaggregated"
            );
        }
        Ok(ExperimentsTracker {
            backend,
            main_metric: options.main_metric,
            plugin_name: options.plugin_name,
            is_loss: options.is_loss,
            n_top_runs: options.n_top_runs,
            retry: options.retry_config,
            is_retryable: None,
            accumulators: Mutex::new(accumulators),
            state: Mutex::new(TrackerState::default()),
        })
    }

    /// Extend the retryable-error set with a caller predicate
    pub fn with_retryable_predicate(
        mut self,
        predicate: impl Fn(&Error) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.is_retryable = Some(Box::new(predicate));
        self
    }

    /// Whether the main metric is a loss
    pub fn is_loss(&self) -> bool {
        self.is_loss
    }

    /// The metric electing iteration winners
    pub fn main_metric(&self) -> &str {
        &self.main_metric
    }

    /// Name of this plugin's initial experiment
    pub fn initial_experiment_name(&self) -> String {
        FineTuningIteration::initial_experiment_name(&self.plugin_name)
    }

    fn call<T>(&self, verb: &str, f: impl FnMut() -> Result<T>) -> Result<T> {
        let params = self.retry.get(verb);
        match &self.is_retryable {
            Some(predicate) => retry_call(params, verb, predicate.as_ref(), f),
            None => retry_call(params, verb, |_| false, f),
        }
    }

    // =========================================================================
    // Initial model
    // =========================================================================

    fn ensure_initial_experiment(&self) -> Result<String> {
        let name = self.initial_experiment_name();
        if let Some(experiment) =
            self.call("get_experiment", || self.backend.get_experiment_by_name(&name))?
        {
            return Ok(experiment.experiment_id);
        }
        self.call("create_experiment", || self.backend.create_experiment(&name))
    }

    fn initial_run(&self) -> Result<Option<RunRecord>> {
        let name = self.initial_experiment_name();
        let Some(experiment) =
            self.call("get_experiment", || self.backend.get_experiment_by_name(&name))?
        else {
            return Ok(None);
        };
        self.call("get_run", || {
            self.backend
                .find_run_by_name(&experiment.experiment_id, INITIAL_RUN_NAME)
        })
    }

    /// Whether a starting model was uploaded for this plugin
    pub fn has_initial_model(&self) -> Result<bool> {
        match self.initial_run()? {
            Some(run) => self.call("load_model", || {
                self.backend.artifact_exists(&run.run_id, MODEL_ARTIFACT_NAME)
            }),
            None => Ok(false),
        }
    }

    /// Upload the very first, initial model for this plugin
    ///
    /// A model already present is left untouched.
    pub fn upload_initial_model(&self, model_bytes: Vec<u8>) -> Result<()> {
        let experiment_id = self.ensure_initial_experiment()?;
        let run = match self.call("get_run", || {
            self.backend.find_run_by_name(&experiment_id, INITIAL_RUN_NAME)
        })? {
            Some(run) => run,
            None => self.call("start_run", || {
                self.backend.create_run(&experiment_id, INITIAL_RUN_NAME)
            })?,
        };
        if self.call("load_model", || {
            self.backend.artifact_exists(&run.run_id, MODEL_ARTIFACT_NAME)
        })? {
            info!(target: "embedtune::registry", "Initial model is already uploaded");
            return Ok(());
        }
        info!(
            target: "embedtune::registry",
            experiment_id = %experiment_id,
            "Uploading initial model"
        );
        self.call("log_model", || {
            self.backend
                .store_artifact(&run.run_id, MODEL_ARTIFACT_NAME, model_bytes.clone())
        })?;
        self.call("end_run", || {
            self.backend.set_run_status(&run.run_id, RunStatus::Finished)
        })
    }

    /// Download the initial model
    pub fn download_initial_model(&self) -> Result<Vec<u8>> {
        let run = self
            .initial_run()?
            .ok_or_else(|| Error::not_found("initial model run"))?;
        self.call("load_model", || {
            self.backend.load_artifact(&run.run_id, MODEL_ARTIFACT_NAME)
        })
    }

    // =========================================================================
    // Iteration lifecycle
    // =========================================================================

    /// Start (or resume) a fine-tuning iteration
    ///
    /// An archived experiment squatting on the name is renamed with an
    /// `_archive` suffix and a fresh experiment is created.
    pub fn set_iteration(&self, iteration: &FineTuningIteration) -> Result<()> {
        if iteration.plugin_name != self.plugin_name {
            return Err(Error::validation(format!(
                "can't set iteration with different plugin name: {} != {}",
                iteration.plugin_name, self.plugin_name
            )));
        }
        let name = iteration.to_string();
        let experiment_id = match self
            .call("get_experiment", || self.backend.get_experiment_by_name(&name))?
        {
            Some(experiment) if experiment.archived => {
                info!(
                    target: "embedtune::registry",
                    %name,
                    "Renaming archived experiment squatting on the iteration name"
                );
                let archived_name = format!("{name}_archive");
                self.call("delete_experiment", || {
                    self.backend
                        .rename_experiment(&experiment.experiment_id, &archived_name)
                })?;
                self.call("create_experiment", || self.backend.create_experiment(&name))?
            }
            Some(experiment) => experiment.experiment_id,
            None => self.call("create_experiment", || self.backend.create_experiment(&name))?,
        };

        info!(target: "embedtune::registry", %name, %experiment_id, "Iteration started");
        let mut state = self.state.lock();
        state.iteration_name = Some(name);
        state.iteration_id = Some(experiment_id);
        state.run_id = None;
        Ok(())
    }

    /// Finish the current iteration, parking the tracker on the initial
    /// experiment
    pub fn finish_iteration(&self) -> Result<()> {
        let experiment_id = self.ensure_initial_experiment()?;
        let mut state = self.state.lock();
        state.iteration_name = Some(self.initial_experiment_name());
        state.iteration_id = Some(experiment_id);
        state.run_id = None;
        info!(target: "embedtune::registry", "Current iteration is finished");
        Ok(())
    }

    fn current_iteration_id(&self) -> Result<String> {
        self.state
            .lock()
            .iteration_id
            .clone()
            .ok_or_else(|| Error::validation("no iteration was set"))
    }

    fn current_run_id(&self) -> Result<String> {
        self.state
            .lock()
            .run_id
            .clone()
            .ok_or_else(|| Error::validation("there is no current run"))
    }

    fn on_initial_iteration(&self) -> bool {
        let state = self.state.lock();
        state.iteration_name.as_deref() == Some(&self.initial_experiment_name()[..])
            || state.iteration_name.is_none()
    }

    // =========================================================================
    // Run lifecycle
    // =========================================================================

    /// Start a run for the given parameters
    ///
    /// Returns `true` when a run with the same parameters already finished
    /// (the driver may skip retraining).
    pub fn set_run(&self, params: &FineTuningParams) -> Result<bool> {
        params.validate()?;
        if self.on_initial_iteration() {
            return Err(Error::validation(
                "you can't start a run for the initial iteration",
            ));
        }
        let iteration_id = self.current_iteration_id()?;
        if self.state.lock().run_id.is_some() {
            self.finish_run(false)?;
        }

        let run_name = params.id();
        info!(
            target: "embedtune::registry",
            %iteration_id,
            %run_name,
            "Starting run"
        );
        let existing = self.call("get_run", || {
            self.backend.find_run_by_name(&iteration_id, &run_name)
        })?;
        match existing {
            Some(run) => {
                let finished = run.status == RunStatus::Finished;
                self.state.lock().run_id = Some(run.run_id);
                Ok(finished)
            }
            None => {
                let run = self.call("start_run", || {
                    self.backend.create_run(&iteration_id, &run_name)
                })?;
                let iteration_name = self.state.lock().iteration_name.clone().unwrap_or_default();
                self.call("log_param", || {
                    self.backend.log_param(&run.run_id, "iteration", &iteration_name)
                })?;
                for (key, value) in param_pairs(params) {
                    self.call("log_param", || {
                        self.backend.log_param(&run.run_id, &key, &value)
                    })?;
                }
                let params_json = serde_json::to_string(params)
                    .map_err(|e| Error::Serialization(e.to_string()))?;
                self.call("log_param", || {
                    self.backend.log_param(&run.run_id, PARAMS_JSON_KEY, &params_json)
                })?;
                self.call("log_metric", || {
                    self.backend.log_metric(&run.run_id, MODEL_UPLOADED_METRIC, 0.0)
                })?;
                self.state.lock().run_id = Some(run.run_id);
                Ok(false)
            }
        }
    }

    /// Close the current run with FINISHED or FAILED status
    pub fn finish_run(&self, as_failed: bool) -> Result<()> {
        for accumulator in self.accumulators.lock().iter_mut() {
            accumulator.clear();
        }
        let run_id = self.current_run_id()?;
        let status = if as_failed {
            RunStatus::Failed
        } else {
            RunStatus::Finished
        };
        self.call("end_run", || self.backend.set_run_status(&run_id, status))?;
        self.state.lock().run_id = None;
        debug!(target: "embedtune::registry", %run_id, status = status.as_str(), "Run closed");
        Ok(())
    }

    // =========================================================================
    // Metrics
    // =========================================================================

    /// Feed a metric through the accumulators and log every aggregation
    pub fn save_metric(&self, value: &MetricValue) -> Result<()> {
        let run_id = self.current_run_id()?;
        let mut aggregations = Vec::new();
        {
            let mut accumulators = self.accumulators.lock();
            if accumulators.is_empty() {
                aggregations.push((value.name().to_string(), value.value()));
            } else {
                for accumulator in accumulators.iter_mut() {
                    aggregations.extend(accumulator.accumulate(value));
                }
            }
        }
        for (name, metric) in aggregations {
            self.call("log_metric", || {
                self.backend.log_metric(&run_id, &name, metric)
            })?;
        }
        Ok(())
    }

    /// Main-metric value of the current run
    pub fn get_quality(&self) -> Result<f64> {
        let run_id = self.current_run_id()?;
        let run = self
            .call("get_run", || self.backend.get_run(&run_id))?
            .ok_or_else(|| Error::not_found(format!("run {run_id}")))?;
        run.metrics
            .get(&self.main_metric)
            .copied()
            .ok_or_else(|| Error::not_found(format!("metric {}", self.main_metric)))
    }

    fn best_quality_of(&self, experiment_id: &str) -> Result<(Option<String>, f64)> {
        let runs = self.call("search_runs", || self.backend.search_runs(experiment_id))?;
        let mut eligible: Vec<(&RunRecord, f64)> = runs
            .iter()
            .filter(|r| r.status == RunStatus::Finished && model_uploaded(r))
            .filter_map(|r| r.metrics.get(&self.main_metric).map(|m| (r, *m)))
            .collect();
        if eligible.is_empty() {
            warn!(
                target: "embedtune::registry",
                experiment_id,
                "No finished runs with an uploaded model"
            );
            return Ok((None, 0.0));
        }
        eligible.sort_by(|a, b| a.1.total_cmp(&b.1));
        let (best, value) = if self.is_loss {
            eligible.first().unwrap()
        } else {
            eligible.last().unwrap()
        };
        Ok((Some(best.run_id.clone()), *value))
    }

    /// Best run and quality of the current iteration
    pub fn get_best_quality(&self) -> Result<(Option<String>, f64)> {
        if self.on_initial_iteration() {
            return Err(Error::validation("no metrics for the initial iteration"));
        }
        let iteration_id = self.current_iteration_id()?;
        self.best_quality_of(&iteration_id)
    }

    /// Whether the current run has its model uploaded
    pub fn model_is_uploaded(&self) -> Result<bool> {
        let run_id = self.current_run_id()?;
        let run = self
            .call("get_run", || self.backend.get_run(&run_id))?
            .ok_or_else(|| Error::not_found(format!("run {run_id}")))?;
        Ok(model_uploaded(&run))
    }

    // =========================================================================
    // Models
    // =========================================================================

    /// Save the current run's model artifact
    ///
    /// With `best_only`, the artifact is written only when this run beats
    /// the iteration's current best, and the previous best artifact is
    /// deleted afterwards.
    pub fn save_model(&self, model_bytes: Vec<u8>, best_only: bool) -> Result<()> {
        if self.on_initial_iteration() {
            return Err(Error::validation(
                "can't save a non-initial model on the initial iteration",
            ));
        }
        let run_id = self.current_run_id()?;
        if !best_only {
            self.store_model(&run_id, model_bytes)?;
            return Ok(());
        }

        let current_quality = self.get_quality()?;
        let (best_run_id, best_quality) = self.get_best_quality()?;
        let beats = match best_run_id {
            None => true,
            Some(_) if self.is_loss => current_quality <= best_quality,
            Some(_) => current_quality >= best_quality,
        };
        if !beats {
            info!(
                target: "embedtune::registry",
                current_quality,
                best_quality,
                "Not the best run - ignore saving"
            );
            return Ok(());
        }
        self.store_model(&run_id, model_bytes)?;
        if let Some(previous_best) = best_run_id {
            if previous_best != run_id {
                self.delete_model(&previous_best)?;
            }
        }
        Ok(())
    }

    fn store_model(&self, run_id: &str, model_bytes: Vec<u8>) -> Result<()> {
        info!(target: "embedtune::registry", run_id, "Uploading model artifact");
        self.call("log_model", || {
            self.backend
                .store_artifact(run_id, MODEL_ARTIFACT_NAME, model_bytes.clone())
        })?;
        self.call("log_metric", || {
            self.backend.log_metric(run_id, MODEL_UPLOADED_METRIC, 1.0)
        })
    }

    /// Delete a run's model artifact and flip its retention metrics
    pub fn delete_model(&self, run_id: &str) -> Result<()> {
        let Some(run) = self.call("get_run", || self.backend.get_run(run_id))? else {
            warn!(target: "embedtune::registry", run_id, "Run doesn't exist, nothing to delete");
            return Ok(());
        };
        if !model_uploaded(&run) {
            warn!(
                target: "embedtune::registry",
                run_id,
                "Run has no model being uploaded, nothing to delete"
            );
            return Ok(());
        }
        self.call("delete_model", || {
            self.backend.delete_artifact(run_id, MODEL_ARTIFACT_NAME)
        })?;
        self.call("log_metric", || {
            self.backend.log_metric(run_id, MODEL_DELETED_METRIC, 1.0)
        })?;
        self.call("log_metric", || {
            self.backend.log_metric(run_id, MODEL_UPLOADED_METRIC, 0.0)
        })
    }

    /// Download the model of a specific run; empty run id resolves to the
    /// initial model
    pub fn download_model_by_run_id(&self, run_id: &str) -> Result<Vec<u8>> {
        if self.is_initial_run(run_id)? {
            return self.download_initial_model();
        }
        self.call("load_model", || {
            self.backend.load_artifact(run_id, MODEL_ARTIFACT_NAME)
        })
    }

    /// Best model of the previous iteration, falling back to the initial
    /// model
    pub fn get_last_model(&self) -> Result<Vec<u8>> {
        match self.get_previous_iteration_id()? {
            Some(experiment_id) => self.get_best_model(&experiment_id),
            None => {
                warn!(
                    target: "embedtune::registry",
                    "No previous iteration in history, downloading initial model"
                );
                self.download_initial_model()
            }
        }
    }

    /// Best model of a specific iteration, falling back to the initial model
    pub fn get_best_model(&self, experiment_id: &str) -> Result<Vec<u8>> {
        let (run_id, _) = self.best_quality_of(experiment_id)?;
        match run_id {
            Some(run_id) => self.call("load_model", || {
                self.backend.load_artifact(&run_id, MODEL_ARTIFACT_NAME)
            }),
            None => {
                warn!(
                    target: "embedtune::registry",
                    experiment_id,
                    "No finished runs with an uploaded model, downloading initial model"
                );
                self.download_initial_model()
            }
        }
    }

    /// Best model of the current iteration
    pub fn get_current_model(&self) -> Result<Vec<u8>> {
        if self.on_initial_iteration() {
            return self.download_initial_model();
        }
        let iteration_id = self.current_iteration_id()?;
        self.get_best_model(&iteration_id)
    }

    /// URL of the previous iteration's best model artifact
    pub fn get_last_model_url(&self) -> Result<Option<String>> {
        let Some(experiment_id) = self.get_previous_iteration_id()? else {
            return Ok(None);
        };
        let (run_id, _) = self.best_quality_of(&experiment_id)?;
        Ok(run_id.map(|id| self.backend.artifact_url(&id, MODEL_ARTIFACT_NAME)))
    }

    /// URL of the current iteration's best model artifact
    pub fn get_current_model_url(&self) -> Result<Option<String>> {
        if self.on_initial_iteration() {
            return Ok(None);
        }
        let iteration_id = self.current_iteration_id()?;
        let (run_id, _) = self.best_quality_of(&iteration_id)?;
        Ok(run_id.map(|id| self.backend.artifact_url(&id, MODEL_ARTIFACT_NAME)))
    }

    // =========================================================================
    // Iteration history
    // =========================================================================

    fn iteration_prefix(&self) -> String {
        format!("{} / {}", self.plugin_name, embedtune_core::ITERATION_PREFIX)
    }

    /// Most recently created non-archived iteration other than the current
    /// one (the initial experiment counts)
    pub fn get_previous_iteration_id(&self) -> Result<Option<String>> {
        if self.on_initial_iteration() {
            warn!(
                target: "embedtune::registry",
                "Can't find the previous iteration - no current iteration was set up"
            );
            return Ok(None);
        }
        let current_name = self.state.lock().iteration_name.clone().unwrap_or_default();
        let prefix = self.iteration_prefix();
        let initial_name = self.initial_experiment_name();
        let experiments = self.call("search_experiments", || self.backend.list_experiments())?;
        Ok(experiments
            .into_iter()
            .filter(|e| {
                e.name.starts_with(&prefix)
                    && e.name != current_name
                    && e.name != initial_name
                    && !e.archived
            })
            .max_by_key(|e| e.seq)
            .map(|e| e.experiment_id))
    }

    /// Most recent iteration whose runs all reached a terminal state
    pub fn get_last_finished_iteration_id(&self) -> Result<Option<String>> {
        let prefix = self.iteration_prefix();
        let initial_name = self.initial_experiment_name();
        let experiments = self.call("search_experiments", || self.backend.list_experiments())?;
        let mut finished = Vec::new();
        for experiment in experiments {
            if !experiment.name.starts_with(&prefix)
                || experiment.name == initial_name
                || experiment.archived
            {
                continue;
            }
            let runs = self.call("search_runs", || {
                self.backend.search_runs(&experiment.experiment_id)
            })?;
            if runs.iter().all(|r| r.status.is_terminal()) {
                finished.push(experiment);
            }
        }
        Ok(finished.into_iter().max_by_key(|e| e.seq).map(|e| e.experiment_id))
    }

    /// Whether a run id refers to the initial model (or is empty)
    pub fn is_initial_run(&self, run_id: &str) -> Result<bool> {
        if run_id.is_empty() {
            return Ok(true);
        }
        let Some(run) = self.call("get_run", || self.backend.get_run(run_id))? else {
            return Ok(false);
        };
        let initial_name = self.initial_experiment_name();
        let Some(experiment) = self.call("get_experiment", || {
            self.backend.get_experiment(&run.experiment_id)
        })?
        else {
            return Ok(false);
        };
        Ok(experiment.name == initial_name)
    }

    /// Parameters logged on a run
    pub fn get_params_by_run_id(&self, run_id: &str) -> Result<Option<FineTuningParams>> {
        let Some(run) = self.call("get_run", || self.backend.get_run(run_id))? else {
            return Ok(None);
        };
        parse_run_params(&run)
    }

    /// Experiment a run belongs to
    pub fn get_experiment_id_of_run(&self, run_id: &str) -> Result<Option<String>> {
        Ok(self
            .call("get_run", || self.backend.get_run(run_id))?
            .map(|r| r.experiment_id))
    }

    /// Top-N parameter sets of an iteration, ordered by main-metric
    /// direction
    ///
    /// Only finished runs with an uploaded model are eligible.
    pub fn get_top_params_by_experiment_id(
        &self,
        experiment_id: &str,
    ) -> Result<Option<Vec<FineTuningParams>>> {
        let runs = self.call("search_runs", || self.backend.search_runs(experiment_id))?;
        let mut eligible: Vec<(f64, FineTuningParams)> = Vec::new();
        for run in &runs {
            if run.status != RunStatus::Finished || !model_uploaded(run) {
                continue;
            }
            let Some(metric) = run.metrics.get(&self.main_metric) else {
                continue;
            };
            if let Some(params) = parse_run_params(run)? {
                eligible.push((*metric, params));
            }
        }
        if eligible.is_empty() {
            warn!(
                target: "embedtune::registry",
                experiment_id,
                "No finished runs with an uploaded model to take top params from"
            );
            return Ok(None);
        }
        eligible.sort_by(|a, b| a.0.total_cmp(&b.0));
        if !self.is_loss {
            eligible.reverse();
        }
        Ok(Some(
            eligible
                .into_iter()
                .take(self.n_top_runs)
                .map(|(_, params)| params)
                .collect(),
        ))
    }

    /// Top-N parameter sets of the previous iteration
    pub fn get_top_params(&self) -> Result<Option<Vec<FineTuningParams>>> {
        let Some(experiment_id) = self.get_previous_iteration_id()? else {
            warn!(
                target: "embedtune::registry",
                "Can't retrieve top params, no previous iteration in history"
            );
            return Ok(None);
        };
        self.get_top_params_by_experiment_id(&experiment_id)
    }

    /// Delete the previous iteration's artifacts and archive its metadata
    ///
    /// Every eligible run's model is deleted; the experiment keeps its runs
    /// and metrics, renamed with an `_archive` suffix.
    pub fn delete_previous_iteration(&self) -> Result<()> {
        let Some(experiment_id) = self.get_previous_iteration_id()? else {
            warn!(
                target: "embedtune::registry",
                "Can't delete the previous iteration, none in history"
            );
            return Ok(());
        };
        info!(
            target: "embedtune::registry",
            %experiment_id,
            "Deleting models of the previous iteration"
        );
        let runs = self.call("search_runs", || self.backend.search_runs(&experiment_id))?;
        for run in runs {
            if run.status == RunStatus::Finished && model_uploaded(&run) {
                self.delete_model(&run.run_id)?;
            }
        }
        let Some(experiment) = self.call("get_experiment", || {
            self.backend.get_experiment(&experiment_id)
        })?
        else {
            return Ok(());
        };
        let archived_name = format!("{}_archive", experiment.name);
        self.call("delete_experiment", || {
            self.backend.rename_experiment(&experiment_id, &archived_name)
        })?;
        self.call("delete_experiment", || {
            self.backend.archive_experiment(&experiment_id)
        })
    }
}

fn model_uploaded(run: &RunRecord) -> bool {
    run.metrics
        .get(MODEL_UPLOADED_METRIC)
        .map(|v| *v == 1.0)
        .unwrap_or(false)
}

fn parse_run_params(run: &RunRecord) -> Result<Option<FineTuningParams>> {
    let Some(json) = run.params.get(PARAMS_JSON_KEY) else {
        return Ok(None);
    };
    let params: FineTuningParams =
        serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))?;
    Ok(Some(params))
}

fn param_pairs(params: &FineTuningParams) -> Vec<(String, String)> {
    let examples = params
        .examples_order
        .iter()
        .map(|e| e.as_str())
        .collect::<Vec<_>>()
        .join(",");
    vec![
        ("num_fixed_layers".into(), params.num_fixed_layers.to_string()),
        ("query_lr".into(), params.query_lr.to_string()),
        ("items_lr".into(), params.items_lr.to_string()),
        (
            "query_weight_decay".into(),
            params.query_weight_decay.to_string(),
        ),
        (
            "items_weight_decay".into(),
            params.items_weight_decay.to_string(),
        ),
        ("margin".into(), params.margin.to_string()),
        (
            "not_irrelevant_only".into(),
            params.not_irrelevant_only.to_string(),
        ),
        (
            "negative_downsampling".into(),
            params.negative_downsampling.to_string(),
        ),
        (
            "min_abs_difference_threshold".into(),
            params.min_abs_difference_threshold.to_string(),
        ),
        (
            "max_abs_difference_threshold".into(),
            params.max_abs_difference_threshold.to_string(),
        ),
        ("examples_order".into(), examples),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryTrackingBackend;
    use crate::retry::RetryParams;
    use std::time::Duration;

    fn tracker(is_loss: bool) -> ExperimentsTracker {
        let backend = Arc::new(InMemoryTrackingBackend::new());
        let mut options = TrackerOptions::new("test_loss", "plugin_a");
        options.is_loss = is_loss;
        options.retry_config = RetryConfig::new(RetryParams::new(1, Duration::from_millis(0)));
        ExperimentsTracker::new(backend, options, vec![]).unwrap()
    }

    fn iteration(batch: &str) -> FineTuningIteration {
        FineTuningIteration::new("plugin_a", "", batch)
    }

    fn params_with_margin(margin: f64) -> FineTuningParams {
        FineTuningParams {
            margin,
            ..Default::default()
        }
    }

    #[test]
    fn test_rejects_empty_metric() {
        let backend = Arc::new(InMemoryTrackingBackend::new());
        let options = TrackerOptions::new("", "p");
        assert!(ExperimentsTracker::new(backend, options, vec![]).is_err());
    }

    #[test]
    fn test_set_run_requires_iteration() {
        let t = tracker(false);
        assert!(t.set_run(&params_with_margin(1.0)).unwrap_err().is_validation());
    }

    #[test]
    fn test_set_run_and_skip_when_finished() {
        let t = tracker(false);
        t.set_iteration(&iteration("b1")).unwrap();

        let params = params_with_margin(1.0);
        assert!(!t.set_run(&params).unwrap());
        t.save_metric(&MetricValue::new("test_loss", 0.7).unwrap()).unwrap();
        t.finish_run(false).unwrap();

        // Same parameters resume the same run, now finished
        assert!(t.set_run(&params).unwrap());
    }

    #[test]
    fn test_best_model_election_deletes_previous_artifact() {
        let t = tracker(false); // higher is better
        t.set_iteration(&iteration("b1")).unwrap();

        t.set_run(&params_with_margin(1.0)).unwrap();
        t.save_metric(&MetricValue::new("test_loss", 0.7).unwrap()).unwrap();
        t.save_model(vec![1], true).unwrap();
        let run_a = t.current_run_id().unwrap();
        t.finish_run(false).unwrap();

        t.set_run(&params_with_margin(2.0)).unwrap();
        t.save_metric(&MetricValue::new("test_loss", 0.8).unwrap()).unwrap();
        t.save_model(vec![2], true).unwrap();
        let run_b = t.current_run_id().unwrap();
        t.finish_run(false).unwrap();

        let (best_run, best_quality) = t.get_best_quality().unwrap();
        assert_eq!(best_run.as_deref(), Some(&run_b[..]));
        assert_eq!(best_quality, 0.8);

        // Run A's artifact was deleted and its flags flipped
        let backend = &t.backend;
        assert!(!backend.artifact_exists(&run_a, MODEL_ARTIFACT_NAME).unwrap());
        assert!(backend.artifact_exists(&run_b, MODEL_ARTIFACT_NAME).unwrap());
        let a = backend.get_run(&run_a).unwrap().unwrap();
        assert_eq!(a.metrics[MODEL_DELETED_METRIC], 1.0);
        assert_eq!(a.metrics[MODEL_UPLOADED_METRIC], 0.0);
    }

    #[test]
    fn test_worse_run_not_saved_when_best_only() {
        let t = tracker(true); // loss: lower is better
        t.set_iteration(&iteration("b1")).unwrap();

        t.set_run(&params_with_margin(1.0)).unwrap();
        t.save_metric(&MetricValue::new("test_loss", 0.3).unwrap()).unwrap();
        t.save_model(vec![1], true).unwrap();
        t.finish_run(false).unwrap();

        t.set_run(&params_with_margin(2.0)).unwrap();
        t.save_metric(&MetricValue::new("test_loss", 0.9).unwrap()).unwrap();
        t.save_model(vec![2], true).unwrap();
        let run_b = t.current_run_id().unwrap();
        t.finish_run(false).unwrap();

        assert!(!t
            .backend
            .artifact_exists(&run_b, MODEL_ARTIFACT_NAME)
            .unwrap());
        let (_, best) = t.get_best_quality().unwrap();
        assert_eq!(best, 0.3);
    }

    #[test]
    fn test_failed_runs_are_not_eligible() {
        let t = tracker(false);
        t.set_iteration(&iteration("b1")).unwrap();

        t.set_run(&params_with_margin(1.0)).unwrap();
        t.save_metric(&MetricValue::new("test_loss", 0.9).unwrap()).unwrap();
        t.save_model(vec![1], false).unwrap();
        t.finish_run(true).unwrap(); // failed

        let (best_run, _) = t.get_best_quality().unwrap();
        assert!(best_run.is_none());
    }

    #[test]
    fn test_top_params_ordering_and_direction() {
        let t = tracker(false);
        t.set_iteration(&iteration("b1")).unwrap();
        for (margin, quality) in [(1.0, 0.5), (2.0, 0.9), (3.0, 0.7)] {
            t.set_run(&params_with_margin(margin)).unwrap();
            t.save_metric(&MetricValue::new("test_loss", quality).unwrap()).unwrap();
            t.save_model(vec![1], false).unwrap();
            t.finish_run(false).unwrap();
        }
        // Move to the next iteration so b1 becomes "previous"
        t.set_iteration(&iteration("b2")).unwrap();

        let top = t.get_top_params().unwrap().unwrap();
        let margins: Vec<f64> = top.iter().map(|p| p.margin).collect();
        assert_eq!(margins, vec![2.0, 3.0, 1.0]);
    }

    #[test]
    fn test_top_params_none_without_history() {
        let t = tracker(false);
        t.set_iteration(&iteration("b1")).unwrap();
        assert!(t.get_top_params().unwrap().is_none());
    }

    #[test]
    fn test_initial_model_roundtrip() {
        let t = tracker(false);
        assert!(!t.has_initial_model().unwrap());
        t.upload_initial_model(vec![9, 9]).unwrap();
        assert!(t.has_initial_model().unwrap());
        assert_eq!(t.download_initial_model().unwrap(), vec![9, 9]);

        // Second upload is a no-op
        t.upload_initial_model(vec![1]).unwrap();
        assert_eq!(t.download_initial_model().unwrap(), vec![9, 9]);
    }

    #[test]
    fn test_is_initial_run() {
        let t = tracker(false);
        t.upload_initial_model(vec![1]).unwrap();
        assert!(t.is_initial_run("").unwrap());
        assert!(!t.is_initial_run("run-unknown").unwrap());

        let initial = t.initial_run().unwrap().unwrap();
        assert!(t.is_initial_run(&initial.run_id).unwrap());
    }

    #[test]
    fn test_get_last_model_falls_back_to_initial() {
        let t = tracker(false);
        t.upload_initial_model(vec![7]).unwrap();
        t.set_iteration(&iteration("b1")).unwrap();
        assert_eq!(t.get_last_model().unwrap(), vec![7]);
    }

    #[test]
    fn test_delete_previous_iteration_archives_metadata() {
        let t = tracker(false);
        t.set_iteration(&iteration("b1")).unwrap();
        t.set_run(&params_with_margin(1.0)).unwrap();
        t.save_metric(&MetricValue::new("test_loss", 0.5).unwrap()).unwrap();
        t.save_model(vec![1], false).unwrap();
        let run_id = t.current_run_id().unwrap();
        t.finish_run(false).unwrap();

        t.set_iteration(&iteration("b2")).unwrap();
        let previous = t.get_previous_iteration_id().unwrap().unwrap();
        t.delete_previous_iteration().unwrap();

        // Model gone, metadata retained under the archived name
        assert!(!t
            .backend
            .artifact_exists(&run_id, MODEL_ARTIFACT_NAME)
            .unwrap());
        let experiment = t.backend.get_experiment(&previous).unwrap().unwrap();
        assert!(experiment.archived);
        assert!(experiment.name.ends_with("_archive"));
        // Archived iterations no longer count as "previous"
        assert!(t.get_previous_iteration_id().unwrap().is_none());
    }

    #[test]
    fn test_current_model_url() {
        let t = tracker(false);
        t.set_iteration(&iteration("b1")).unwrap();
        assert!(t.get_current_model_url().unwrap().is_none());

        t.set_run(&params_with_margin(1.0)).unwrap();
        t.save_metric(&MetricValue::new("test_loss", 0.5).unwrap()).unwrap();
        t.save_model(vec![1], true).unwrap();
        t.finish_run(false).unwrap();

        let url = t.get_current_model_url().unwrap().unwrap();
        assert!(url.contains(MODEL_ARTIFACT_NAME));
    }

    #[test]
    fn test_metrics_flow_through_accumulators() {
        let backend = Arc::new(InMemoryTrackingBackend::new());
        let mut options = TrackerOptions::new("test_loss", "plugin_a");
        options.retry_config = RetryConfig::new(RetryParams::new(1, Duration::from_millis(0)));
        let accumulator =
            MetricsAccumulator::new("test_loss", true, false, false, false, 5).unwrap();
        let t = ExperimentsTracker::new(backend, options, vec![accumulator]).unwrap();

        t.set_iteration(&iteration("b1")).unwrap();
        t.set_run(&params_with_margin(1.0)).unwrap();
        t.save_metric(&MetricValue::new("test_loss", 2.0).unwrap()).unwrap();
        t.save_metric(&MetricValue::new("test_loss", 4.0).unwrap()).unwrap();

        let run_id = t.current_run_id().unwrap();
        let run = t.backend.get_run(&run_id).unwrap().unwrap();
        assert_eq!(run.metrics["test_loss"], 4.0);
        assert_eq!(run.metrics["mean_test_loss"], 3.0);
    }

    #[test]
    fn test_last_finished_iteration_id() {
        let t = tracker(false);
        t.set_iteration(&iteration("b1")).unwrap();
        t.set_run(&params_with_margin(1.0)).unwrap();
        t.finish_run(false).unwrap();
        assert!(t.get_last_finished_iteration_id().unwrap().is_some());

        t.set_iteration(&iteration("b2")).unwrap();
        t.set_run(&params_with_margin(2.0)).unwrap();
        // b2 has a running run, so the last fully finished iteration is b1
        let finished = t.get_last_finished_iteration_id().unwrap().unwrap();
        let b1_name = iteration("b1").to_string();
        let b1 = t.backend.get_experiment_by_name(&b1_name).unwrap().unwrap();
        assert_eq!(finished, b1.experiment_id);
    }
}
