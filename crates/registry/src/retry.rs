//! Retry envelope for tracking-backend calls
//!
//! Every registry verb runs through `retry_call`. Retryable errors are
//! transient backend failures plus anything the caller's predicate accepts;
//! everything else propagates immediately. Exhausting the attempt budget
//! surfaces a distinguished `MaxAttemptsReached` error.

use std::collections::HashMap;
use std::time::Duration;
use tracing::{info, warn};

use embedtune_core::{Error, Result};

/// Attempt budget and backoff for one verb
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryParams {
    /// Maximum attempts; values <= 1 disable retrying
    pub max_attempts: u32,
    /// Wait between attempts
    pub wait_time: Duration,
}

impl RetryParams {
    /// Create retry params
    pub fn new(max_attempts: u32, wait_time: Duration) -> Self {
        RetryParams {
            max_attempts,
            wait_time,
        }
    }
}

impl Default for RetryParams {
    fn default() -> Self {
        RetryParams {
            max_attempts: 3,
            wait_time: Duration::from_secs(2),
        }
    }
}

/// Per-verb retry policy with a default fallback
#[derive(Debug, Clone, Default)]
pub struct RetryConfig {
    default_params: RetryParams,
    per_verb: HashMap<String, RetryParams>,
}

impl RetryConfig {
    /// Create a config with the given default params
    pub fn new(default_params: RetryParams) -> Self {
        RetryConfig {
            default_params,
            per_verb: HashMap::new(),
        }
    }

    /// Override the policy for one verb
    pub fn set(&mut self, verb: impl Into<String>, params: RetryParams) {
        self.per_verb.insert(verb.into(), params);
    }

    /// Policy for a verb, falling back to the default
    pub fn get(&self, verb: &str) -> RetryParams {
        self.per_verb
            .get(verb)
            .copied()
            .unwrap_or(self.default_params)
    }
}

/// Run `f` under the retry policy
///
/// `is_retryable` extends the built-in transient-error check with a
/// caller-supplied predicate.
pub fn retry_call<T>(
    params: RetryParams,
    verb: &str,
    is_retryable: impl Fn(&Error) -> bool,
    mut f: impl FnMut() -> Result<T>,
) -> Result<T> {
    if params.max_attempts <= 1 {
        return f();
    }

    let mut attempts = 0;
    loop {
        match f() {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() || is_retryable(&e) => {
                attempts += 1;
                warn!(
                    target: "embedtune::registry",
                    verb,
                    attempt = attempts,
                    error = %e,
                    "Retryable backend failure"
                );
                if attempts >= params.max_attempts {
                    return Err(Error::MaxAttemptsReached { attempts });
                }
                info!(
                    target: "embedtune::registry",
                    verb,
                    wait_ms = params.wait_time.as_millis() as u64,
                    "Waiting before next attempt"
                );
                std::thread::sleep(params.wait_time);
            }
            Err(e) => return Err(e),
        }
    }
}
