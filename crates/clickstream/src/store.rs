//! Clickstream storage contract
//!
//! The store persists sessions, their events, and session batches. The
//! persistence layout is abstract; the trait captures the semantic contract
//! every backend must honor.
//!
//! ## Concurrency contract
//!
//! - Batch-counter increment and session insertion form a single atomic
//!   unit: two concurrent `register_session` calls each receive a distinct
//!   `session_number`.
//! - At most one batch is in `Collecting` state at any time.
//! - `release_batch` is linearizable with registration: once it returns, no
//!   later registration attaches to the released batch.

use embedtune_core::{
    BatchId, BatchStatus, RegisteredSession, Result, Session, SessionBatch, SessionEvent,
    SessionWithEvents,
};

/// One page of a batch-sessions scan
///
/// `last_number` is the maximum session number returned, `None` when the
/// page is empty; feed it back as `after_number` to continue the scan.
#[derive(Debug, Clone)]
pub struct BatchSessionsPage {
    /// Batch being scanned
    pub batch_id: BatchId,
    /// Highest session number in `sessions`
    pub last_number: Option<u64>,
    /// Sessions in ascending `session_number` order
    pub sessions: Vec<SessionWithEvents>,
}

/// Storage contract for clickstream sessions, events and batches
pub trait ClickstreamStore: Send + Sync {
    /// Register a session into the single collecting batch
    ///
    /// Idempotent on `session_id`: re-registering returns the existing
    /// record unchanged. Otherwise the collecting batch is located (created
    /// if absent), its counter is incremented atomically, and the session is
    /// persisted with the new `(batch_id, session_number)`.
    fn register_session(&self, session: Session) -> Result<RegisteredSession>;

    /// Replace the stored record of an existing session
    ///
    /// The assigned `(batch_id, session_number)` never changes once set; an
    /// unknown session id falls back to registration.
    fn update_session(&self, session: Session) -> Result<RegisteredSession>;

    /// Insert events; duplicates on `(session_id, event_id)` are silently
    /// ignored, events for unknown sessions are dropped with a warning
    fn push_events(&self, events: Vec<SessionEvent>) -> Result<()>;

    /// Set the irrelevance mark on a session without touching its events
    fn mark_session_irrelevant(&self, session_id: &str) -> Result<Option<RegisteredSession>>;

    /// Fetch a session joined with its events
    fn get_session(&self, session_id: &str) -> Result<Option<SessionWithEvents>>;

    /// Scan a batch's sessions with `session_number > after_number`, in
    /// ascending order, each carrying up to `events_limit` events
    fn get_batch_sessions(
        &self,
        batch_id: BatchId,
        after_number: Option<u64>,
        limit: Option<usize>,
        events_limit: Option<usize>,
    ) -> Result<BatchSessionsPage>;

    /// Fetch a batch record
    fn get_batch(&self, batch_id: BatchId) -> Result<Option<SessionBatch>>;

    /// Promote the collecting batch to released
    ///
    /// Idempotent in `release_id`: a second call with the same key returns
    /// the already-released batch. Returns `None` when no collecting batch
    /// exists and the key is unknown.
    fn release_batch(&self, release_id: &str) -> Result<Option<SessionBatch>>;

    /// Move a batch to a later lifecycle status
    ///
    /// Returns `None` for unknown batches; fails with a conflict for a
    /// backwards transition.
    fn update_batch_status(
        &self,
        batch_id: BatchId,
        status: BatchStatus,
    ) -> Result<Option<SessionBatch>>;
}
