//! Environment-driven retry settings
//!
//! Attempt budgets and wait times are operational knobs and come from the
//! environment:
//!
//! - `EMBEDTUNE_DEFAULT_MAX_ATTEMPTS` / `EMBEDTUNE_DEFAULT_WAIT_SECONDS`
//! - per-verb overrides `EMBEDTUNE_<VERB>_ATTEMPTS` /
//!   `EMBEDTUNE_<VERB>_WAIT_SECONDS`, e.g. `EMBEDTUNE_LOG_MODEL_ATTEMPTS`
//!
//! Unset or unparsable variables fall back to the defaults.

use std::time::Duration;

use crate::retry::{RetryConfig, RetryParams};

/// Registry verbs with dedicated retry knobs
pub const RETRY_VERBS: &[&str] = &[
    "log_metric",
    "log_param",
    "log_model",
    "load_model",
    "delete_model",
    "search_runs",
    "start_run",
    "end_run",
    "get_run",
    "search_experiments",
    "delete_experiment",
    "create_experiment",
    "get_experiment",
];

/// Default attempt budget
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// Default wait between attempts, seconds
pub const DEFAULT_WAIT_TIME_SECONDS: f64 = 3.0;

/// Retry settings resolved from the environment
#[derive(Debug, Clone)]
pub struct RetrySettings {
    config: RetryConfig,
}

impl RetrySettings {
    /// Resolve settings from environment variables
    pub fn from_env() -> Self {
        let default_params = RetryParams::new(
            env_u32("EMBEDTUNE_DEFAULT_MAX_ATTEMPTS").unwrap_or(DEFAULT_MAX_ATTEMPTS),
            secs(env_f64("EMBEDTUNE_DEFAULT_WAIT_SECONDS").unwrap_or(DEFAULT_WAIT_TIME_SECONDS)),
        );
        let mut config = RetryConfig::new(default_params);
        for verb in RETRY_VERBS {
            let upper = verb.to_uppercase();
            let attempts = env_u32(&format!("EMBEDTUNE_{upper}_ATTEMPTS"));
            let wait = env_f64(&format!("EMBEDTUNE_{upper}_WAIT_SECONDS"));
            if attempts.is_some() || wait.is_some() {
                config.set(
                    *verb,
                    RetryParams::new(
                        attempts.unwrap_or(default_params.max_attempts),
                        wait.map(secs).unwrap_or(default_params.wait_time),
                    ),
                );
            }
        }
        RetrySettings { config }
    }

    /// The resolved per-verb retry config
    pub fn into_config(self) -> RetryConfig {
        self.config
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        RetrySettings {
            config: RetryConfig::new(RetryParams::new(
                DEFAULT_MAX_ATTEMPTS,
                secs(DEFAULT_WAIT_TIME_SECONDS),
            )),
        }
    }
}

/// Endpoints of the external collaborators
///
/// The core never dials these itself; the glue layers (task API, loaders,
/// inference client) read them from here.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    /// Host of the online inference server
    pub inference_host: String,
    /// Port of the online inference server
    pub inference_port: u16,
    /// Database connection string of the clickstream store
    pub database_url: String,
    /// URL of the experiment-tracking server
    pub tracking_url: String,
}

impl EngineSettings {
    /// Resolve settings from environment variables
    pub fn from_env() -> Self {
        let defaults = EngineSettings::default();
        EngineSettings {
            inference_host: std::env::var("EMBEDTUNE_INFERENCE_HOST")
                .unwrap_or(defaults.inference_host),
            inference_port: env_u32("EMBEDTUNE_INFERENCE_PORT")
                .and_then(|p| u16::try_from(p).ok())
                .unwrap_or(defaults.inference_port),
            database_url: std::env::var("EMBEDTUNE_DATABASE_URL")
                .unwrap_or(defaults.database_url),
            tracking_url: std::env::var("EMBEDTUNE_TRACKING_URL")
                .unwrap_or(defaults.tracking_url),
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        EngineSettings {
            inference_host: "localhost".to_string(),
            inference_port: 8001,
            database_url: "mongodb://localhost:27017/embedtune".to_string(),
            tracking_url: "http://localhost:5000".to_string(),
        }
    }
}

fn env_u32(name: &str) -> Option<u32> {
    std::env::var(name).ok()?.parse().ok()
}

fn env_f64(name: &str) -> Option<f64> {
    std::env::var(name).ok()?.parse().ok()
}

fn secs(value: f64) -> Duration {
    Duration::from_secs_f64(value.max(0.0))
}
