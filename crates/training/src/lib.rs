//! Fine-tuning pipeline for Embedtune
//!
//! Everything between stored sessions and an improved embedding model:
//! - train/test splitting and paired datasets
//! - the feature extractor with explicit gradient bookkeeping
//! - probabilistic margin ranking losses
//! - the fine-tuning driver (epochs, test passes, early stopping,
//!   best-model election)
//! - hyperparameter search over grids and previous top-K parameter sets
//! - the plugin registry bundling per-deployment capabilities

#![warn(clippy::all)]

pub mod aggregators;
pub mod confidences;
pub mod dataset;
pub mod extractor;
pub mod features;
pub mod graph;
pub mod items;
pub mod loss;
pub mod metrics;
pub mod model;
pub mod optimizer;
pub mod plugin;
pub mod ranker;
pub mod splitter;
pub mod trainer;
pub mod tuner;

pub use aggregators::{
    ClicksAggregator, MaxClicksAggregator, MaxRanksAggregator, MeanRanksAggregator,
    MinRanksAggregator, RanksAggregator,
};
pub use confidences::{calculate_confidences, dummy_confidences, ConfidenceCalculator};
pub use dataset::{InputPair, PairedFineTuningInputs};
pub use extractor::FeatureExtractor;
pub use features::FineTuningFeatures;
pub use graph::{ExtractionGraph, GradientBatch, NodeId, RankGradients};
pub use items::{
    prepare_ranking_data, DataLoader, DownloadedItem, InMemoryDataLoader, ItemsSet, RankingData,
};
pub use loss::{CosineProbMarginRankingLoss, ProbMarginRankingLoss, RankingLoss};
pub use metrics::{DistanceShift, MetricCalculator};
pub use model::{EmbeddingModel, LinearAdapterCodec, LinearAdapterModel, ModelCodec, ParamTensor, Vector};
pub use optimizer::{Sgd, StepDecay};
pub use plugin::{FineTuningPlugin, PluginRegistry};
pub use ranker::{CosineRanker, DotProductRanker, Ranker};
pub use splitter::{QueryAugmenter, TrainTestSplit, TrainTestSplitter};
pub use trainer::{fine_tune_one_param, FineTuningSettings};
pub use tuner::{fine_tune_embedding_model, ParamGrid};
