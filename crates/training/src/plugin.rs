//! Fine-tuning plugins
//!
//! A plugin bundles everything one deployment needs to fine-tune its
//! embedding space: the session converter, the splitter, trainer settings,
//! the initial search grid, the data loader and the model codec. Plugins
//! are registered explicitly by name; there is no discovery magic.

use std::collections::HashMap;
use std::sync::Arc;

use embedtune_core::{Error, Result, SessionWithEvents};
use embedtune_clickstream::SessionConverter;

use crate::items::{prepare_ranking_data, DataLoader, RankingData};
use crate::model::ModelCodec;
use crate::splitter::TrainTestSplitter;
use crate::trainer::FineTuningSettings;
use crate::tuner::ParamGrid;

/// Capabilities of one fine-tuning method
pub struct FineTuningPlugin {
    /// Registry name of the plugin
    pub name: String,
    /// Session-to-input conversion
    pub converter: SessionConverter,
    /// Train/test splitting policy
    pub splitter: TrainTestSplitter,
    /// Trainer settings shared by every run
    pub settings: FineTuningSettings,
    /// Choice grid of the initial hyperparameter search
    pub grid: ParamGrid,
    /// Trial budget of the initial search
    pub initial_max_evals: usize,
    /// Item payload loader
    pub loader: Arc<dyn DataLoader>,
    /// Model artifact codec
    pub codec: Arc<dyn ModelCodec>,
}

impl FineTuningPlugin {
    /// Convert sessions and assemble the iteration's ranking data
    pub fn prepare_data(&self, sessions: &[SessionWithEvents]) -> Result<RankingData> {
        let converted = self.converter.convert_all(sessions);
        prepare_ranking_data(converted, self.loader.as_ref(), &self.splitter)
    }
}

/// Explicit name-to-plugin registry
#[derive(Default)]
pub struct PluginRegistry {
    plugins: HashMap<String, Arc<FineTuningPlugin>>,
}

impl PluginRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin under its name
    ///
    /// Re-registering a name is a conflict.
    pub fn register(&mut self, plugin: FineTuningPlugin) -> Result<()> {
        let name = plugin.name.clone();
        if self.plugins.contains_key(&name) {
            return Err(Error::Conflict(format!(
                "plugin '{name}' is already registered"
            )));
        }
        self.plugins.insert(name, Arc::new(plugin));
        Ok(())
    }

    /// Look up a plugin by name
    pub fn get(&self, name: &str) -> Option<Arc<FineTuningPlugin>> {
        self.plugins.get(name).cloned()
    }

    /// Registered plugin names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.plugins.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::items::InMemoryDataLoader;
    use crate::model::LinearAdapterCodec;
    use embedtune_core::{
        BatchId, QueryItem, RegisteredSession, SearchResultItem, Session, SessionEvent, Timestamp,
    };

    fn plugin(name: &str) -> FineTuningPlugin {
        FineTuningPlugin {
            name: name.to_string(),
            converter: SessionConverter::new(),
            splitter: TrainTestSplitter::new(0.3, false, Some(3)).unwrap(),
            settings: FineTuningSettings::cosine_defaults(),
            grid: ParamGrid::default(),
            initial_max_evals: 10,
            loader: Arc::new(InMemoryDataLoader::new([
                ("a".to_string(), serde_json::json!("alpha")),
                ("b".to_string(), serde_json::json!("beta")),
            ])),
            codec: Arc::new(LinearAdapterCodec),
        }
    }

    fn session(id: &str) -> SessionWithEvents {
        let session = Session::new(
            id,
            QueryItem::text("hat"),
            Timestamp::from_millis(1),
            vec![
                SearchResultItem::new("a", Some(0.9)),
                SearchResultItem::new("b", Some(0.4)),
            ],
        );
        SessionWithEvents {
            registered: RegisteredSession {
                session,
                batch_id: BatchId::new(),
                session_number: 1,
            },
            events: vec![SessionEvent::click(id, "e1", "a", Timestamp::from_millis(2))],
        }
    }

    #[test]
    fn test_registry_register_and_lookup() {
        let mut registry = PluginRegistry::new();
        registry.register(plugin("text_default")).unwrap();
        registry.register(plugin("categories")).unwrap();

        assert!(registry.get("text_default").is_some());
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.names(), vec!["categories", "text_default"]);
    }

    #[test]
    fn test_registry_rejects_duplicate_names() {
        let mut registry = PluginRegistry::new();
        registry.register(plugin("p")).unwrap();
        assert!(registry.register(plugin("p")).unwrap_err().is_conflict());
    }

    #[test]
    fn test_plugin_prepares_ranking_data() {
        let plugin = plugin("p");
        let sessions: Vec<SessionWithEvents> =
            (0..6).map(|i| session(&format!("s{i}"))).collect();
        let data = plugin.prepare_data(&sessions).unwrap();

        assert_eq!(data.items.len(), 2);
        let total = data.clickstream.train.not_irrelevant().len()
            + data.clickstream.train.irrelevant().len()
            + data.clickstream.test.not_irrelevant().len()
            + data.clickstream.test.irrelevant().len();
        assert_eq!(total, 6);
    }

    #[test]
    fn test_plugin_prepare_data_rejects_empty() {
        let plugin = plugin("p");
        assert!(plugin.prepare_data(&[]).is_err());
    }
}
