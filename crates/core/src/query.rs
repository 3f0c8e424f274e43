//! Query and event variants
//!
//! Search queries and interaction events are open hierarchies in the wire
//! protocol. Here they are closed tagged enums: conversions are explicit and
//! total, and downstream code matches instead of duck-typing.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{Error, Result};

/// A search query as seen by the embedding model
///
/// The common case is a plain text query. Image queries carry raw bytes;
/// field queries carry a structured map (e.g. a parsed filter form).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueryItem {
    /// Free-text query
    Text {
        /// The raw query string
        text: String,
    },
    /// Image query (e.g. reverse image search)
    Image {
        /// Encoded image bytes; format is the model's concern
        bytes: Vec<u8>,
    },
    /// Structured query with named fields
    Fields {
        /// Field name to value; ordering is canonical for hashing
        fields: BTreeMap<String, serde_json::Value>,
    },
}

impl QueryItem {
    /// Build a plain text query
    pub fn text(text: impl Into<String>) -> Self {
        QueryItem::Text { text: text.into() }
    }

    /// Build a structured query from a text value plus metadata fields
    ///
    /// This is the converter's path: `text` becomes the `"text"` field and
    /// the session's `search_meta` entries are merged in. Fails if the
    /// metadata already carries a `"text"` key - the collision would
    /// silently shadow the query.
    pub fn text_with_meta(
        text: impl Into<String>,
        meta: &BTreeMap<String, serde_json::Value>,
    ) -> Result<Self> {
        if meta.is_empty() {
            return Ok(QueryItem::text(text));
        }
        if meta.contains_key("text") {
            return Err(Error::validation(
                "search_meta key 'text' collides with the query text field",
            ));
        }
        let mut fields = meta.clone();
        fields.insert("text".to_string(), serde_json::Value::String(text.into()));
        Ok(QueryItem::Fields { fields })
    }

    /// The text content, if this query has one
    ///
    /// For `Fields` queries this is the `"text"` field when it is a string.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            QueryItem::Text { text } => Some(text),
            QueryItem::Fields { fields } => fields.get("text").and_then(|v| v.as_str()),
            QueryItem::Image { .. } => None,
        }
    }
}

/// Kind of a user interaction event
///
/// Importance weights how strongly the event counts as a relevance signal.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    /// A plain click, importance 1.0
    Click,
    /// An event with an explicit importance weight
    Weighted {
        /// Relevance weight of this event kind
        importance: f64,
    },
}

impl EventKind {
    /// Relevance importance of this event kind
    pub fn importance(&self) -> f64 {
        match self {
            EventKind::Click => 1.0,
            EventKind::Weighted { importance } => *importance,
        }
    }

    /// Parse from a wire event-type string; unknown types fall back to click
    pub fn parse(s: &str) -> Self {
        match s {
            "click" | "" => EventKind::Click,
            other => {
                // Wire protocol allows "<type>:<importance>" for weighted events
                if let Some((_, raw)) = other.split_once(':') {
                    if let Ok(importance) = raw.parse::<f64>() {
                        return EventKind::Weighted { importance };
                    }
                }
                EventKind::Click
            }
        }
    }
}

impl Default for EventKind {
    fn default() -> Self {
        EventKind::Click
    }
}
