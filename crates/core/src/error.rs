//! Error types for Embedtune
//!
//! This module defines the unified error type used throughout the system.
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.
//!
//! ## Error Categories
//!
//! - **Not Found**: Entity (session, batch, run, model) doesn't exist
//! - **Conflict**: Duplicate insertion or concurrent state change
//! - **Validation**: Invariants violated at construction
//! - **Transient Backend**: Network / timeout / 5xx failures, retried by the
//!   registry's retry envelope
//! - **Max Attempts Reached**: retry envelope exhausted, surfaced unchanged
//! - **Run Failed**: a training run died; caught at the search boundary

use std::io;
use thiserror::Error;

/// Result type alias for Embedtune operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the Embedtune engine
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (file operations, artifact transfer, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Entity not found (session, batch, run, experiment, model)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Duplicate insertion or concurrent state change
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Invariant violated at construction or call time
    #[error("Validation error: {0}")]
    Validation(String),

    /// Transient backend failure (network, timeout, server error)
    #[error("Transient backend error: {0}")]
    TransientBackend(String),

    /// Retry envelope exhausted
    #[error("Max attempts reached after {attempts} tries")]
    MaxAttemptsReached {
        /// How many attempts were made before giving up
        attempts: u32,
    },

    /// A training run failed; the hyperparameter search continues
    #[error("Run failed: {0}")]
    RunFailed(String),
}

impl Error {
    /// Build a validation error from anything displayable
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    /// Build a not-found error from anything displayable
    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    /// Check if this error is transient
    ///
    /// Used by the retry envelope - only transient errors should be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::TransientBackend(_))
    }

    /// Check if this error is a conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }

    /// Check if this error is a validation failure
    pub fn is_validation(&self) -> bool {
        matches!(self, Error::Validation(_))
    }

    /// Check if this error is a missing-entity lookup
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_io() {
        let err = Error::Io(io::Error::new(io::ErrorKind::NotFound, "file not found"));
        let msg = err.to_string();
        assert!(msg.contains("I/O error"));
    }

    #[test]
    fn test_error_display_validation() {
        let err = Error::validation("ranks and results differ in size");
        let msg = err.to_string();
        assert!(msg.contains("Validation error"));
        assert!(msg.contains("ranks and results differ in size"));
    }

    #[test]
    fn test_error_display_max_attempts() {
        let err = Error::MaxAttemptsReached { attempts: 3 };
        assert!(err.to_string().contains("3"));
    }

    #[test]
    fn test_error_predicates() {
        assert!(Error::TransientBackend("503".into()).is_retryable());
        assert!(!Error::Conflict("dup".into()).is_retryable());
        assert!(Error::Conflict("dup".into()).is_conflict());
        assert!(Error::validation("bad").is_validation());
        assert!(Error::not_found("missing").is_not_found());
        assert!(!Error::not_found("missing").is_validation());
    }
}
