//! In-process clickstream store
//!
//! Thread-safe implementation of `ClickstreamStore`. The batch table sits
//! behind a single mutex: counter increment + session insertion commit as
//! one atomic unit, and release is linearizable with registration because
//! both run under the same lock. Session and event reads go through
//! concurrent maps and never take the batch lock.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, warn};

use embedtune_core::{
    BatchId, BatchStatus, Error, RegisteredSession, Result, Session, SessionBatch, SessionEvent,
    SessionWithEvents, Timestamp,
};

use crate::store::{BatchSessionsPage, ClickstreamStore};

/// Default cap on events returned per session in a batch scan
const DEFAULT_EVENTS_LIMIT: usize = 100;

/// Batch table state, guarded by one mutex
///
/// `collecting` points at the single batch in collecting state;
/// `by_release_id` is the idempotency index for release.
#[derive(Default)]
struct BatchTable {
    batches: HashMap<BatchId, SessionBatch>,
    collecting: Option<BatchId>,
    by_release_id: HashMap<String, BatchId>,
}

impl BatchTable {
    /// Locate the collecting batch, opening one if absent, and increment
    /// its counter. Returns `(batch_id, new_counter_value)`.
    fn increment(&mut self) -> (BatchId, u64) {
        let batch_id = match self.collecting {
            Some(id) => id,
            None => {
                let batch = SessionBatch::collecting(Timestamp::now());
                let id = batch.batch_id;
                info!(target: "embedtune::clickstream", batch_id = %id, "Opened new collecting batch");
                self.batches.insert(id, batch);
                self.collecting = Some(id);
                id
            }
        };
        let batch = self
            .batches
            .get_mut(&batch_id)
            .expect("collecting pointer refers to a stored batch");
        batch.session_counter += 1;
        (batch_id, batch.session_counter)
    }
}

/// Thread-safe in-memory `ClickstreamStore`
pub struct InMemoryClickstreamStore {
    batch_table: Mutex<BatchTable>,
    sessions: DashMap<String, RegisteredSession>,
    /// session_id -> event_id -> event
    events: DashMap<String, BTreeMap<String, SessionEvent>>,
}

impl InMemoryClickstreamStore {
    /// Create an empty store
    pub fn new() -> Self {
        InMemoryClickstreamStore {
            batch_table: Mutex::new(BatchTable::default()),
            sessions: DashMap::new(),
            events: DashMap::new(),
        }
    }

    fn session_events(&self, session_id: &str, limit: usize) -> Vec<SessionEvent> {
        match self.events.get(session_id) {
            Some(entry) => entry.values().take(limit).cloned().collect(),
            None => Vec::new(),
        }
    }
}

impl Default for InMemoryClickstreamStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ClickstreamStore for InMemoryClickstreamStore {
    fn register_session(&self, session: Session) -> Result<RegisteredSession> {
        // The batch lock also linearizes the duplicate check: concurrent
        // registrations of the same id resolve to one stored record.
        let mut table = self.batch_table.lock();

        if let Some(existing) = self.sessions.get(&session.session_id) {
            warn!(
                target: "embedtune::clickstream",
                session_id = %session.session_id,
                "Session already registered"
            );
            return Ok(existing.clone());
        }

        let (batch_id, session_number) = table.increment();
        let registered = RegisteredSession {
            session,
            batch_id,
            session_number,
        };
        self.sessions
            .insert(registered.session.session_id.clone(), registered.clone());
        debug!(
            target: "embedtune::clickstream",
            session_id = %registered.session.session_id,
            batch_id = %batch_id,
            session_number,
            "Session registered"
        );
        Ok(registered)
    }

    fn update_session(&self, session: Session) -> Result<RegisteredSession> {
        // The assigned (batch_id, session_number) is immutable; only the
        // session payload is replaced.
        let _table = self.batch_table.lock();
        match self.sessions.get_mut(&session.session_id) {
            Some(mut existing) => {
                existing.session = session;
                Ok(existing.clone())
            }
            None => {
                drop(_table);
                self.register_session(session)
            }
        }
    }

    fn push_events(&self, events: Vec<SessionEvent>) -> Result<()> {
        for event in events {
            if !self.sessions.contains_key(&event.session_id) {
                warn!(
                    target: "embedtune::clickstream",
                    session_id = %event.session_id,
                    event_id = %event.event_id,
                    "Dropping event for unknown session"
                );
                continue;
            }
            let mut entry = self.events.entry(event.session_id.clone()).or_default();
            if entry.contains_key(&event.event_id) {
                debug!(
                    target: "embedtune::clickstream",
                    session_id = %event.session_id,
                    event_id = %event.event_id,
                    "Ignoring duplicate event"
                );
                continue;
            }
            entry.insert(event.event_id.clone(), event);
        }
        Ok(())
    }

    fn mark_session_irrelevant(&self, session_id: &str) -> Result<Option<RegisteredSession>> {
        match self.sessions.get_mut(session_id) {
            Some(mut session) => {
                session.session.is_irrelevant = true;
                Ok(Some(session.clone()))
            }
            None => Ok(None),
        }
    }

    fn get_session(&self, session_id: &str) -> Result<Option<SessionWithEvents>> {
        let Some(registered) = self.sessions.get(session_id).map(|s| s.clone()) else {
            return Ok(None);
        };
        let events = self.session_events(session_id, usize::MAX);
        Ok(Some(SessionWithEvents { registered, events }))
    }

    fn get_batch_sessions(
        &self,
        batch_id: BatchId,
        after_number: Option<u64>,
        limit: Option<usize>,
        events_limit: Option<usize>,
    ) -> Result<BatchSessionsPage> {
        let after_number = after_number.unwrap_or(0);
        let events_limit = events_limit.unwrap_or(DEFAULT_EVENTS_LIMIT);

        let mut selected: Vec<RegisteredSession> = self
            .sessions
            .iter()
            .filter(|s| s.batch_id == batch_id && s.session_number > after_number)
            .map(|s| s.clone())
            .collect();
        selected.sort_by_key(|s| s.session_number);
        if let Some(limit) = limit {
            selected.truncate(limit);
        }

        let last_number = selected.last().map(|s| s.session_number);
        let sessions = selected
            .into_iter()
            .map(|registered| {
                let events = self.session_events(&registered.session.session_id, events_limit);
                SessionWithEvents { registered, events }
            })
            .collect();

        Ok(BatchSessionsPage {
            batch_id,
            last_number,
            sessions,
        })
    }

    fn get_batch(&self, batch_id: BatchId) -> Result<Option<SessionBatch>> {
        let table = self.batch_table.lock();
        Ok(table.batches.get(&batch_id).cloned())
    }

    fn release_batch(&self, release_id: &str) -> Result<Option<SessionBatch>> {
        let mut table = self.batch_table.lock();

        // Idempotency: a known release key returns the batch it released.
        if let Some(batch_id) = table.by_release_id.get(release_id).copied() {
            warn!(
                target: "embedtune::clickstream",
                release_id,
                "Batch already released"
            );
            return Ok(table.batches.get(&batch_id).cloned());
        }

        let Some(batch_id) = table.collecting.take() else {
            return Ok(None);
        };
        let batch = table
            .batches
            .get_mut(&batch_id)
            .expect("collecting pointer refers to a stored batch");
        batch.release(release_id, Timestamp::now());
        let released = batch.clone();
        table.by_release_id.insert(release_id.to_string(), batch_id);
        info!(
            target: "embedtune::clickstream",
            batch_id = %batch_id,
            release_id,
            session_counter = released.session_counter,
            "Batch released"
        );
        Ok(Some(released))
    }

    fn update_batch_status(
        &self,
        batch_id: BatchId,
        status: BatchStatus,
    ) -> Result<Option<SessionBatch>> {
        let mut table = self.batch_table.lock();
        let Some(batch) = table.batches.get_mut(&batch_id) else {
            return Ok(None);
        };
        if !batch.status.can_transition_to(status) {
            return Err(Error::Conflict(format!(
                "batch {batch_id} cannot move from {} to {}",
                batch.status, status
            )));
        }
        batch.status = status;
        let updated = batch.clone();
        if table.collecting == Some(batch_id) {
            table.collecting = None;
        }
        Ok(Some(updated))
    }
}
