//! Clickstream data model
//!
//! Sessions, their interaction events, and the batches that group sessions
//! for training. Cross-references are stored as id values, never as
//! pointers; the store resolves them.
//!
//! ## Batch lifecycle
//!
//! `Collecting -> Released -> FineTuning -> Archiving -> Archived`
//!
//! Transitions are forward-only; a released batch cannot revert. At most one
//! batch is in `Collecting` state at any time (enforced by the store).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::query::{EventKind, QueryItem};
use crate::types::{BatchId, Timestamp};

/// One displayed result within a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResultItem {
    /// Object identifier
    pub object_id: String,
    /// Rank score at display time, if the search engine reported one
    pub rank: Option<f64>,
    /// Optional payload metadata (loader hints, storage coordinates)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl SearchResultItem {
    /// Create a result item with a rank and no payload
    pub fn new(object_id: impl Into<String>, rank: Option<f64>) -> Self {
        SearchResultItem {
            object_id: object_id.into(),
            rank,
            payload: None,
        }
    }
}

/// One search interaction by a user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Immutable client-supplied identifier
    pub session_id: String,
    /// The query that initiated the session
    pub search_query: QueryItem,
    /// Creation time (epoch milliseconds, UTC)
    pub created_at: Timestamp,
    /// Ordered displayed results
    pub search_results: Vec<SearchResultItem>,
    /// Extra query metadata merged into the query item by the converter
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub search_meta: BTreeMap<String, serde_json::Value>,
    /// Payload filter applied at search time (opaque to the core)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_filter: Option<serde_json::Value>,
    /// Sorting options applied at search time (opaque to the core)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort_by: Option<serde_json::Value>,
    /// Optional user identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Store-level irrelevance mark (set via `mark_session_irrelevant`)
    #[serde(default)]
    pub is_irrelevant: bool,
    /// Whether this was a payload (structured) search
    #[serde(default)]
    pub is_payload_search: bool,
}

impl Session {
    /// Create a session with the required fields; optional fields default
    pub fn new(
        session_id: impl Into<String>,
        search_query: QueryItem,
        created_at: Timestamp,
        search_results: Vec<SearchResultItem>,
    ) -> Self {
        Session {
            session_id: session_id.into(),
            search_query,
            created_at,
            search_results,
            search_meta: BTreeMap::new(),
            payload_filter: None,
            sort_by: None,
            user_id: None,
            is_irrelevant: false,
            is_payload_search: false,
        }
    }
}

/// A user interaction against one of a session's displayed results
///
/// The pair `(session_id, event_id)` is globally unique.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    /// Event identifier, unique within the session
    pub event_id: String,
    /// Parent session
    pub session_id: String,
    /// Which displayed object the event targets
    pub object_id: String,
    /// Kind of interaction
    #[serde(default)]
    pub event_type: EventKind,
    /// Creation time (epoch milliseconds, UTC)
    pub created_at: Timestamp,
    /// Optional event metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
}

impl SessionEvent {
    /// Create a click event
    pub fn click(
        session_id: impl Into<String>,
        event_id: impl Into<String>,
        object_id: impl Into<String>,
        created_at: Timestamp,
    ) -> Self {
        SessionEvent {
            event_id: event_id.into(),
            session_id: session_id.into(),
            object_id: object_id.into(),
            event_type: EventKind::Click,
            created_at,
            meta: None,
        }
    }
}

/// Session batch lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    /// Accepting new sessions
    Collecting,
    /// Released for training; no new sessions attach
    Released,
    /// A fine-tuning iteration is consuming the batch
    FineTuning,
    /// Being archived after training
    Archiving,
    /// Terminal state
    Archived,
}

impl BatchStatus {
    /// Position in the forward-only lifecycle
    fn order(&self) -> u8 {
        match self {
            BatchStatus::Collecting => 0,
            BatchStatus::Released => 1,
            BatchStatus::FineTuning => 2,
            BatchStatus::Archiving => 3,
            BatchStatus::Archived => 4,
        }
    }

    /// Whether a transition to `next` is allowed
    ///
    /// Transitions only move forward; a released batch cannot revert to
    /// collecting.
    pub fn can_transition_to(&self, next: BatchStatus) -> bool {
        next.order() > self.order()
    }

    /// Get string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Collecting => "collecting",
            BatchStatus::Released => "released",
            BatchStatus::FineTuning => "fine_tuning",
            BatchStatus::Archiving => "archiving",
            BatchStatus::Archived => "archived",
        }
    }
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A contiguous, numbered group of sessions processed together
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionBatch {
    /// Batch identifier
    pub batch_id: BatchId,
    /// Number of sessions registered into the batch
    pub session_counter: u64,
    /// When the batch was opened
    pub created_at: Timestamp,
    /// Lifecycle status
    pub status: BatchStatus,
    /// Client-supplied idempotency key recorded at release
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_id: Option<String>,
    /// When the batch was released
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub released_at: Option<Timestamp>,
}

impl SessionBatch {
    /// Open a fresh collecting batch
    pub fn collecting(created_at: Timestamp) -> Self {
        SessionBatch {
            batch_id: BatchId::new(),
            session_counter: 0,
            created_at,
            status: BatchStatus::Collecting,
            release_id: None,
            released_at: None,
        }
    }

    /// Promote to released, recording the idempotency key
    pub fn release(&mut self, release_id: impl Into<String>, released_at: Timestamp) {
        self.status = BatchStatus::Released;
        self.release_id = Some(release_id.into());
        self.released_at = Some(released_at);
    }
}

/// A session enriched with its batch assignment
///
/// Once assigned, `(batch_id, session_number)` is immutable for that session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisteredSession {
    /// The underlying session record
    #[serde(flatten)]
    pub session: Session,
    /// Batch this session belongs to
    pub batch_id: BatchId,
    /// 1-based position within the batch
    pub session_number: u64,
}

/// A registered session joined with its events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionWithEvents {
    /// The registered session record
    #[serde(flatten)]
    pub registered: RegisteredSession,
    /// Interaction events recorded for the session
    pub events: Vec<SessionEvent>,
}

impl SessionWithEvents {
    /// The underlying session
    pub fn session(&self) -> &Session {
        &self.registered.session
    }
}
