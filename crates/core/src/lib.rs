//! Core types for Embedtune
//!
//! This crate defines the foundational types used throughout the system:
//! - BatchId: Unique identifier for session batches
//! - Timestamp: Millisecond-precision UTC timestamps
//! - QueryItem / EventKind: tagged variants for queries and interaction events
//! - Session / SessionEvent / SessionBatch: the clickstream data model
//! - FineTuningInput: the training-side representation of one session
//! - FineTuningParams / FineTuningIteration: hyperparameters and iteration identity
//! - Error: unified error type hierarchy

#![warn(clippy::all)]

pub mod error;
pub mod input;
pub mod iteration;
pub mod params;
pub mod query;
pub mod session;
pub mod types;

// Re-export commonly used types at the crate root
pub use error::{Error, Result};
pub use input::FineTuningInput;
pub use iteration::{FineTuningIteration, ITERATION_PREFIX};
pub use params::{ExamplesType, FineTuningParams};
pub use query::{EventKind, QueryItem};
pub use session::{
    BatchStatus, RegisteredSession, SearchResultItem, Session, SessionBatch, SessionEvent,
    SessionWithEvents,
};
pub use types::{BatchId, Timestamp};
