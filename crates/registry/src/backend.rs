//! Tracking-backend contract and in-memory implementation
//!
//! The backend persists experiments, runs, their parameters and metrics, and
//! model artifacts. The tracker (`tracker.rs`) layers the iteration/run
//! state machine on top; backends stay dumb key-value surfaces so a remote
//! tracking server can slot in behind the same trait.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

use embedtune_core::{Error, Result, Timestamp};

/// Run lifecycle status in the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunStatus {
    /// Run created but not started
    Scheduled,
    /// Run in progress
    Running,
    /// Run completed normally
    Finished,
    /// Run ended with an error
    Failed,
    /// Run was externally terminated
    Killed,
}

impl RunStatus {
    /// Whether the run reached a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Finished | RunStatus::Failed | RunStatus::Killed
        )
    }

    /// Get string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Scheduled => "SCHEDULED",
            RunStatus::Running => "RUNNING",
            RunStatus::Finished => "FINISHED",
            RunStatus::Failed => "FAILED",
            RunStatus::Killed => "KILLED",
        }
    }
}

/// Experiment record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentRecord {
    /// Experiment identifier
    pub experiment_id: String,
    /// Experiment name (the iteration's string form)
    pub name: String,
    /// Creation time
    pub created_at: Timestamp,
    /// Creation sequence number, breaks ties in `created_at`
    pub seq: u64,
    /// Whether the experiment was archived by iteration cleanup
    pub archived: bool,
}

/// Run record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    /// Run identifier
    pub run_id: String,
    /// Owning experiment
    pub experiment_id: String,
    /// Run name (deterministic: the parameter-set id)
    pub name: String,
    /// Lifecycle status
    pub status: RunStatus,
    /// Logged parameters
    pub params: BTreeMap<String, String>,
    /// Logged metrics (latest value per name)
    pub metrics: BTreeMap<String, f64>,
}

/// Storage contract for the experiment registry
pub trait TrackingBackend: Send + Sync {
    /// Create an experiment; fails with a conflict if the name is taken
    fn create_experiment(&self, name: &str) -> Result<String>;

    /// Look up an experiment by name
    fn get_experiment_by_name(&self, name: &str) -> Result<Option<ExperimentRecord>>;

    /// Look up an experiment by id
    fn get_experiment(&self, experiment_id: &str) -> Result<Option<ExperimentRecord>>;

    /// All experiments, archived included
    fn list_experiments(&self) -> Result<Vec<ExperimentRecord>>;

    /// Rename an experiment
    fn rename_experiment(&self, experiment_id: &str, new_name: &str) -> Result<()>;

    /// Mark an experiment archived
    fn archive_experiment(&self, experiment_id: &str) -> Result<()>;

    /// Create a run under an experiment with a deterministic name
    fn create_run(&self, experiment_id: &str, name: &str) -> Result<RunRecord>;

    /// Look up a run by id
    fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>>;

    /// Look up a run by name within an experiment
    fn find_run_by_name(&self, experiment_id: &str, name: &str) -> Result<Option<RunRecord>>;

    /// All runs of an experiment
    fn search_runs(&self, experiment_id: &str) -> Result<Vec<RunRecord>>;

    /// Log one parameter on a run
    fn log_param(&self, run_id: &str, key: &str, value: &str) -> Result<()>;

    /// Log one metric on a run (latest value wins)
    fn log_metric(&self, run_id: &str, key: &str, value: f64) -> Result<()>;

    /// Move a run to a new status
    fn set_run_status(&self, run_id: &str, status: RunStatus) -> Result<()>;

    /// Store an artifact blob on a run
    fn store_artifact(&self, run_id: &str, name: &str, bytes: Vec<u8>) -> Result<()>;

    /// Load an artifact blob
    fn load_artifact(&self, run_id: &str, name: &str) -> Result<Vec<u8>>;

    /// Delete an artifact blob; missing artifacts are fine
    fn delete_artifact(&self, run_id: &str, name: &str) -> Result<()>;

    /// Whether an artifact exists
    fn artifact_exists(&self, run_id: &str, name: &str) -> Result<bool>;

    /// Stable URL for an artifact
    fn artifact_url(&self, run_id: &str, name: &str) -> String;
}

#[derive(Default)]
struct BackendState {
    experiments: HashMap<String, ExperimentRecord>,
    runs: HashMap<String, RunRecord>,
    artifacts: HashMap<(String, String), Vec<u8>>,
    seq: u64,
}

/// In-memory tracking backend for tests and local runs
#[derive(Default)]
pub struct InMemoryTrackingBackend {
    state: RwLock<BackendState>,
}

impl InMemoryTrackingBackend {
    /// Create an empty backend
    pub fn new() -> Self {
        Self::default()
    }
}

impl TrackingBackend for InMemoryTrackingBackend {
    fn create_experiment(&self, name: &str) -> Result<String> {
        let mut state = self.state.write();
        if state.experiments.values().any(|e| e.name == name) {
            return Err(Error::Conflict(format!(
                "experiment with name '{name}' already exists"
            )));
        }
        state.seq += 1;
        let record = ExperimentRecord {
            experiment_id: format!("exp-{}", Uuid::new_v4()),
            name: name.to_string(),
            created_at: Timestamp::now(),
            seq: state.seq,
            archived: false,
        };
        let id = record.experiment_id.clone();
        state.experiments.insert(id.clone(), record);
        Ok(id)
    }

    fn get_experiment_by_name(&self, name: &str) -> Result<Option<ExperimentRecord>> {
        let state = self.state.read();
        Ok(state
            .experiments
            .values()
            .find(|e| e.name == name)
            .cloned())
    }

    fn get_experiment(&self, experiment_id: &str) -> Result<Option<ExperimentRecord>> {
        let state = self.state.read();
        Ok(state.experiments.get(experiment_id).cloned())
    }

    fn list_experiments(&self) -> Result<Vec<ExperimentRecord>> {
        let state = self.state.read();
        let mut all: Vec<ExperimentRecord> = state.experiments.values().cloned().collect();
        all.sort_by_key(|e| e.seq);
        Ok(all)
    }

    fn rename_experiment(&self, experiment_id: &str, new_name: &str) -> Result<()> {
        let mut state = self.state.write();
        match state.experiments.get_mut(experiment_id) {
            Some(experiment) => {
                experiment.name = new_name.to_string();
                Ok(())
            }
            None => Err(Error::not_found(format!("experiment {experiment_id}"))),
        }
    }

    fn archive_experiment(&self, experiment_id: &str) -> Result<()> {
        let mut state = self.state.write();
        match state.experiments.get_mut(experiment_id) {
            Some(experiment) => {
                experiment.archived = true;
                Ok(())
            }
            None => Err(Error::not_found(format!("experiment {experiment_id}"))),
        }
    }

    fn create_run(&self, experiment_id: &str, name: &str) -> Result<RunRecord> {
        let mut state = self.state.write();
        if !state.experiments.contains_key(experiment_id) {
            return Err(Error::not_found(format!("experiment {experiment_id}")));
        }
        let record = RunRecord {
            run_id: format!("run-{}", Uuid::new_v4()),
            experiment_id: experiment_id.to_string(),
            name: name.to_string(),
            status: RunStatus::Running,
            params: BTreeMap::new(),
            metrics: BTreeMap::new(),
        };
        state.runs.insert(record.run_id.clone(), record.clone());
        Ok(record)
    }

    fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>> {
        let state = self.state.read();
        Ok(state.runs.get(run_id).cloned())
    }

    fn find_run_by_name(&self, experiment_id: &str, name: &str) -> Result<Option<RunRecord>> {
        let state = self.state.read();
        Ok(state
            .runs
            .values()
            .find(|r| r.experiment_id == experiment_id && r.name == name)
            .cloned())
    }

    fn search_runs(&self, experiment_id: &str) -> Result<Vec<RunRecord>> {
        let state = self.state.read();
        Ok(state
            .runs
            .values()
            .filter(|r| r.experiment_id == experiment_id)
            .cloned()
            .collect())
    }

    fn log_param(&self, run_id: &str, key: &str, value: &str) -> Result<()> {
        let mut state = self.state.write();
        match state.runs.get_mut(run_id) {
            Some(run) => {
                run.params.insert(key.to_string(), value.to_string());
                Ok(())
            }
            None => Err(Error::not_found(format!("run {run_id}"))),
        }
    }

    fn log_metric(&self, run_id: &str, key: &str, value: f64) -> Result<()> {
        let mut state = self.state.write();
        match state.runs.get_mut(run_id) {
            Some(run) => {
                run.metrics.insert(key.to_string(), value);
                Ok(())
            }
            None => Err(Error::not_found(format!("run {run_id}"))),
        }
    }

    fn set_run_status(&self, run_id: &str, status: RunStatus) -> Result<()> {
        let mut state = self.state.write();
        match state.runs.get_mut(run_id) {
            Some(run) => {
                run.status = status;
                Ok(())
            }
            None => Err(Error::not_found(format!("run {run_id}"))),
        }
    }

    fn store_artifact(&self, run_id: &str, name: &str, bytes: Vec<u8>) -> Result<()> {
        let mut state = self.state.write();
        if !state.runs.contains_key(run_id) {
            return Err(Error::not_found(format!("run {run_id}")));
        }
        state
            .artifacts
            .insert((run_id.to_string(), name.to_string()), bytes);
        Ok(())
    }

    fn load_artifact(&self, run_id: &str, name: &str) -> Result<Vec<u8>> {
        let state = self.state.read();
        state
            .artifacts
            .get(&(run_id.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| Error::not_found(format!("artifact {name} of run {run_id}")))
    }

    fn delete_artifact(&self, run_id: &str, name: &str) -> Result<()> {
        let mut state = self.state.write();
        state
            .artifacts
            .remove(&(run_id.to_string(), name.to_string()));
        Ok(())
    }

    fn artifact_exists(&self, run_id: &str, name: &str) -> Result<bool> {
        let state = self.state.read();
        Ok(state
            .artifacts
            .contains_key(&(run_id.to_string(), name.to_string())))
    }

    fn artifact_url(&self, run_id: &str, name: &str) -> String {
        format!("memory://{run_id}/{name}")
    }
}
