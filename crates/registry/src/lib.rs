//! Experiment tracking for Embedtune
//!
//! This crate owns the experiment-registry state machine:
//! - `TrackingBackend`: the storage contract for experiments, runs, metrics
//!   and model artifacts, with an in-memory implementation
//! - `ExperimentsTracker`: iteration/run lifecycle, best-model election,
//!   artifact retention
//! - retry envelope wrapping every backend verb
//! - metric accumulators (last, mean, sliding mean, min, max)

#![warn(clippy::all)]

pub mod backend;
pub mod metrics;
pub mod retry;
pub mod settings;
pub mod tracker;

pub use backend::{
    ExperimentRecord, InMemoryTrackingBackend, RunRecord, RunStatus, TrackingBackend,
};
pub use metrics::{MetricValue, MetricsAccumulator};
pub use retry::{retry_call, RetryConfig, RetryParams};
pub use settings::{EngineSettings, RetrySettings};
pub use tracker::{ExperimentsTracker, TrackerOptions, MODEL_ARTIFACT_NAME, MODEL_UPLOADED_METRIC};
