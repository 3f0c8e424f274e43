//! Embedtune - embedding fine-tuning and ranking-feedback engine
//!
//! Embedtune consumes user search sessions (query, displayed results,
//! click events) and produces improved embedding models so that subsequent
//! similarity search ranks user-preferred items higher.
//!
//! The facade re-exports the member crates:
//! - [`core`]: data model, parameters, errors
//! - [`clickstream`]: session/batch storage and input conversion
//! - [`registry`]: experiment tracking, retry envelope, metric accumulators
//! - [`training`]: splitting, feature extraction, losses, the driver and
//!   the hyperparameter search
//!
//! ## Flow
//!
//! Sessions and events are registered into the single collecting batch of
//! the [`clickstream`] store; releasing the batch freezes its contents.
//! Each released batch drives one fine-tuning iteration: sessions convert
//! into training inputs, split into train/test, and the [`training`] search
//! runs the driver once per candidate parameter set, electing the best
//! model through the [`registry`] tracker.

pub use embedtune_clickstream as clickstream;
pub use embedtune_core as core;
pub use embedtune_registry as registry;
pub use embedtune_training as training;
