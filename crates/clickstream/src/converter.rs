//! Session to training-input conversion
//!
//! Turns a stored `SessionWithEvents` into a `FineTuningInput` plus the item
//! metadata the data loader needs to fetch payloads for the session's
//! results.

use std::collections::BTreeMap;
use tracing::warn;

use embedtune_core::{FineTuningInput, QueryItem, Result, SessionWithEvents};

/// Loader-facing metadata for one displayed result
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ItemMeta {
    /// Object identifier
    pub object_id: String,
    /// Payload hints carried on the search result
    pub payload: Option<serde_json::Value>,
}

/// A fine-tuning input together with the item metadata of its results
#[derive(Debug, Clone)]
pub struct InputWithItems {
    /// The converted training input
    pub input: FineTuningInput,
    /// Item metadata for every displayed result, in display order
    pub items: Vec<ItemMeta>,
}

/// Converts stored sessions into fine-tuning inputs
#[derive(Debug, Clone, Default)]
pub struct SessionConverter;

impl SessionConverter {
    /// Create a converter
    pub fn new() -> Self {
        SessionConverter
    }

    /// Convert one session
    ///
    /// - the query merges the session's `search_meta` (fails when a key
    ///   would collide with the query text field)
    /// - events referencing objects outside the displayed results are
    ///   dropped with a warning
    /// - `ranks` carries the display-time rank per result; missing ranks
    ///   stay `None` and are computed on demand by the training driver
    pub fn convert(&self, session: &SessionWithEvents) -> Result<InputWithItems> {
        let inner = session.session();

        let query = match &inner.search_query {
            QueryItem::Text { text } => QueryItem::text_with_meta(text, &inner.search_meta)?,
            other => other.clone(),
        };

        let results: Vec<String> = inner
            .search_results
            .iter()
            .map(|r| r.object_id.clone())
            .collect();
        let ranks: BTreeMap<String, Option<f64>> = inner
            .search_results
            .iter()
            .map(|r| (r.object_id.clone(), r.rank))
            .collect();

        // One entry per event, in event order; repeated interactions with
        // the same object all count.
        let mut events: Vec<String> = Vec::new();
        let mut event_types: Vec<f64> = Vec::new();
        for event in &session.events {
            if !ranks.contains_key(&event.object_id) {
                warn!(
                    target: "embedtune::clickstream",
                    session_id = %inner.session_id,
                    event_id = %event.event_id,
                    object_id = %event.object_id,
                    "Dropping event referencing an object outside the session results"
                );
                continue;
            }
            events.push(event.object_id.clone());
            event_types.push(event.event_type.importance());
        }

        let input = FineTuningInput::new(query, events, results, ranks)?
            .with_event_types(event_types)
            .with_timestamp(inner.created_at);

        let items = inner
            .search_results
            .iter()
            .map(|r| ItemMeta {
                object_id: r.object_id.clone(),
                payload: r.payload.clone(),
            })
            .collect();

        Ok(InputWithItems { input, items })
    }

    /// Convert a batch of sessions, skipping sessions that fail with a
    /// warning
    pub fn convert_all(&self, sessions: &[SessionWithEvents]) -> Vec<InputWithItems> {
        sessions
            .iter()
            .filter_map(|s| match self.convert(s) {
                Ok(converted) => Some(converted),
                Err(e) => {
                    warn!(
                        target: "embedtune::clickstream",
                        session_id = %s.session().session_id,
                        error = %e,
                        "Skipping unconvertible session"
                    );
                    None
                }
            })
            .collect()
    }
}
