//! Training-side representation of one session
//!
//! A `FineTuningInput` is what the feature extractor consumes: the query,
//! the ordered result ids, the subset that received events, per-item display
//! ranks, and an optional part-to-object mapping for items that were split
//! into subitems before embedding.
//!
//! ## Invariants
//!
//! - `ranks` has exactly one entry per id in `results`
//! - every id in `events` appears in `results`
//! - `is_irrelevant` is derived: true iff `events` is empty
//!
//! `remove_results` maintains all three, and expands removed object ids to
//! their part ids when a part mapping is present.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{Error, Result};
use crate::query::QueryItem;
use crate::types::Timestamp;

/// The training-side representation of one search session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FineTuningInput {
    /// The user query that initiated the session
    pub query: QueryItem,
    /// Ids of results that received a user event, in event order
    pub events: Vec<String>,
    /// All displayed result ids, in display order
    pub results: Vec<String>,
    /// Result id to its rank at display time; `None` ranks are computed on
    /// demand by the training driver
    pub ranks: BTreeMap<String, Option<f64>>,
    /// Per-event importance scores, parallel to `events`
    #[serde(default)]
    pub event_types: Vec<f64>,
    /// Session creation time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Timestamp>,
    /// Derived: true iff `events` is empty
    pub is_irrelevant: bool,
    /// Part id to parent object id, present when items were split into
    /// subitems for embedding
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub part_to_object_dict: Option<BTreeMap<String, String>>,
}

impl FineTuningInput {
    /// Build an input, validating the invariants
    ///
    /// `is_irrelevant` is always derived from `events`; callers cannot
    /// assert it externally.
    pub fn new(
        query: QueryItem,
        events: Vec<String>,
        results: Vec<String>,
        ranks: BTreeMap<String, Option<f64>>,
    ) -> Result<Self> {
        if ranks.len() != results.len() {
            return Err(Error::validation(format!(
                "sizes of ranks ({}) and results ({}) are not equal",
                ranks.len(),
                results.len()
            )));
        }
        for id in &results {
            if !ranks.contains_key(id) {
                return Err(Error::validation(format!(
                    "no such id ({id}) in provided ranks"
                )));
            }
        }
        let result_set: BTreeSet<&String> = results.iter().collect();
        for id in &events {
            if !result_set.contains(id) {
                return Err(Error::validation(format!(
                    "event id ({id}) does not appear in results"
                )));
            }
        }
        let is_irrelevant = events.is_empty();
        Ok(FineTuningInput {
            query,
            events,
            results,
            ranks,
            event_types: Vec::new(),
            timestamp: None,
            is_irrelevant,
            part_to_object_dict: None,
        })
    }

    /// Attach per-event importance scores
    pub fn with_event_types(mut self, event_types: Vec<f64>) -> Self {
        self.event_types = event_types;
        self
    }

    /// Attach the session creation time
    pub fn with_timestamp(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Attach a part-to-object mapping
    pub fn with_part_mapping(mut self, mapping: BTreeMap<String, String>) -> Self {
        self.part_to_object_dict = Some(mapping);
        self
    }

    /// Number of results in this input
    pub fn len(&self) -> usize {
        self.results.len()
    }

    /// Whether the input has no results
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Result ids that did not receive any user interaction
    pub fn not_events(&self) -> Vec<String> {
        let event_set: BTreeSet<&String> = self.events.iter().collect();
        self.results
            .iter()
            .filter(|id| !event_set.contains(id))
            .cloned()
            .collect()
    }

    /// Map a part id to its parent object id
    ///
    /// Identity when no part mapping is present or the id is not a part.
    pub fn get_object_id<'a>(&'a self, id: &'a str) -> &'a str {
        match &self.part_to_object_dict {
            Some(mapping) => mapping.get(id).map(String::as_str).unwrap_or(id),
            None => id,
        }
    }

    /// Whether any rank is missing or null
    ///
    /// Such inputs need a rank-preprocessing pass before confidence
    /// computation.
    pub fn has_unresolved_ranks(&self) -> bool {
        self.ranks.is_empty() || self.ranks.values().any(Option::is_none)
    }

    /// Remove results by id, maintaining all invariants
    ///
    /// When a part mapping is present, the provided ids are object ids and
    /// every part id mapping to one of them is removed; the mapping itself
    /// is pruned. `is_irrelevant` is recomputed from the surviving events.
    pub fn remove_results(&mut self, ids: &BTreeSet<String>) {
        let ids_to_remove: BTreeSet<String> = match &self.part_to_object_dict {
            Some(mapping) => {
                let parts: BTreeSet<String> = mapping
                    .iter()
                    .filter(|(_, object_id)| ids.contains(*object_id))
                    .map(|(part_id, _)| part_id.clone())
                    .collect();
                self.part_to_object_dict = Some(
                    mapping
                        .iter()
                        .filter(|(part_id, _)| !parts.contains(*part_id))
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect(),
                );
                parts
            }
            None => ids.clone(),
        };

        self.results.retain(|id| !ids_to_remove.contains(id));
        self.events.retain(|id| !ids_to_remove.contains(id));
        self.ranks.retain(|id, _| !ids_to_remove.contains(id));
        self.is_irrelevant = self.events.is_empty();
    }
}
