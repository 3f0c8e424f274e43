//! Items, loaders, and the assembled ranking dataset
//!
//! Item payloads arrive through a `DataLoader` collaborator (object storage,
//! SQL, anything); the `ItemsSet` is the in-memory view the extractor reads,
//! shared read-only across runs.

use std::collections::HashMap;
use tracing::warn;

use embedtune_core::{Error, FineTuningInput, Result};
use embedtune_clickstream::{InputWithItems, ItemMeta};

use crate::splitter::{TrainTestSplit, TrainTestSplitter};

/// One loaded item payload
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadedItem {
    /// Object (or part) identifier
    pub id: String,
    /// The payload the model embeds
    pub payload: serde_json::Value,
}

/// In-memory id-to-item view over loaded payloads
#[derive(Debug, Clone, Default)]
pub struct ItemsSet {
    items: HashMap<String, DownloadedItem>,
}

impl ItemsSet {
    /// Build a set from loaded items; later duplicates win
    pub fn from_items(items: Vec<DownloadedItem>) -> Self {
        ItemsSet {
            items: items.into_iter().map(|i| (i.id.clone(), i)).collect(),
        }
    }

    /// Look up one item
    pub fn get(&self, id: &str) -> Option<&DownloadedItem> {
        self.items.get(id)
    }

    /// Number of items
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Items for the given ids, preserving order
    ///
    /// Unknown ids are dropped with a warning; the returned id list is
    /// parallel to the returned items.
    pub fn items_by_ids(&self, ids: &[String]) -> (Vec<DownloadedItem>, Vec<String>) {
        let mut found = Vec::with_capacity(ids.len());
        let mut found_ids = Vec::with_capacity(ids.len());
        for id in ids {
            match self.items.get(id) {
                Some(item) => {
                    found.push(item.clone());
                    found_ids.push(id.clone());
                }
                None => {
                    warn!(target: "embedtune::training", %id, "Item is missing from the items set");
                }
            }
        }
        (found, found_ids)
    }
}

/// Loader collaborator fetching item payloads from external storage
pub trait DataLoader: Send + Sync {
    /// Total number of items available at the source, when known
    fn total_count(&self) -> Result<Option<usize>>;

    /// Load payloads for the given item metadata
    fn load_items(&self, metas: &[ItemMeta]) -> Result<Vec<DownloadedItem>>;

    /// Lazily load everything in batches of `batch_size`
    fn load_all<'a>(
        &'a self,
        batch_size: usize,
    ) -> Box<dyn Iterator<Item = Result<Vec<DownloadedItem>>> + 'a>;
}

/// Loader over a fixed in-memory table, for tests and local runs
#[derive(Debug, Clone, Default)]
pub struct InMemoryDataLoader {
    items: HashMap<String, serde_json::Value>,
}

impl InMemoryDataLoader {
    /// Build a loader over `(id, payload)` pairs
    pub fn new(items: impl IntoIterator<Item = (String, serde_json::Value)>) -> Self {
        InMemoryDataLoader {
            items: items.into_iter().collect(),
        }
    }
}

impl DataLoader for InMemoryDataLoader {
    fn total_count(&self) -> Result<Option<usize>> {
        Ok(Some(self.items.len()))
    }

    fn load_items(&self, metas: &[ItemMeta]) -> Result<Vec<DownloadedItem>> {
        Ok(metas
            .iter()
            .filter_map(|meta| {
                self.items.get(&meta.object_id).map(|payload| DownloadedItem {
                    id: meta.object_id.clone(),
                    payload: payload.clone(),
                })
            })
            .collect())
    }

    fn load_all<'a>(
        &'a self,
        batch_size: usize,
    ) -> Box<dyn Iterator<Item = Result<Vec<DownloadedItem>>> + 'a> {
        let mut all: Vec<DownloadedItem> = self
            .items
            .iter()
            .map(|(id, payload)| DownloadedItem {
                id: id.clone(),
                payload: payload.clone(),
            })
            .collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        let chunks: Vec<Vec<DownloadedItem>> = all
            .chunks(batch_size.max(1))
            .map(|c| c.to_vec())
            .collect();
        Box::new(chunks.into_iter().map(Ok))
    }
}

/// Everything one fine-tuning iteration trains on
#[derive(Debug)]
pub struct RankingData {
    /// Train/test split of the clickstream inputs
    pub clickstream: TrainTestSplit,
    /// Item payloads shared by both splits
    pub items: ItemsSet,
}

/// Assemble ranking data from converted sessions
///
/// Loads every referenced item through the loader, then splits the inputs.
pub fn prepare_ranking_data(
    converted: Vec<InputWithItems>,
    loader: &dyn DataLoader,
    splitter: &TrainTestSplitter,
) -> Result<RankingData> {
    if converted.is_empty() {
        return Err(Error::validation("no convertible sessions to train on"));
    }
    let mut metas: Vec<ItemMeta> = Vec::new();
    let mut seen = std::collections::HashSet::new();
    let mut inputs: Vec<FineTuningInput> = Vec::with_capacity(converted.len());
    for entry in converted {
        for meta in entry.items {
            if seen.insert(meta.object_id.clone()) {
                metas.push(meta);
            }
        }
        inputs.push(entry.input);
    }
    let items = ItemsSet::from_items(loader.load_items(&metas)?);
    let clickstream = splitter.split(inputs)?;
    Ok(RankingData { clickstream, items })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: &str) -> DownloadedItem {
        DownloadedItem {
            id: id.to_string(),
            payload: serde_json::json!(format!("payload-{id}")),
        }
    }

    #[test]
    fn test_items_set_lookup() {
        let set = ItemsSet::from_items(vec![item("a"), item("b")]);
        assert_eq!(set.len(), 2);
        assert!(set.get("a").is_some());
        assert!(set.get("z").is_none());
    }

    #[test]
    fn test_items_by_ids_drops_missing() {
        let set = ItemsSet::from_items(vec![item("a"), item("b")]);
        let (items, ids) = set.items_by_ids(&[
            "b".to_string(),
            "missing".to_string(),
            "a".to_string(),
        ]);
        assert_eq!(ids, vec!["b", "a"]);
        assert_eq!(items[0].id, "b");
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn test_in_memory_loader() {
        let loader = InMemoryDataLoader::new([
            ("a".to_string(), serde_json::json!("alpha")),
            ("b".to_string(), serde_json::json!("beta")),
            ("c".to_string(), serde_json::json!("gamma")),
        ]);
        assert_eq!(loader.total_count().unwrap(), Some(3));

        let loaded = loader
            .load_items(&[
                ItemMeta {
                    object_id: "a".to_string(),
                    payload: None,
                },
                ItemMeta {
                    object_id: "nope".to_string(),
                    payload: None,
                },
            ])
            .unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, "a");

        let batches: Vec<_> = loader.load_all(2).collect::<Result<Vec<_>>>().unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 2);
        assert_eq!(batches[1].len(), 1);
    }
}
