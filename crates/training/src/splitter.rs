//! Train/test splitting
//!
//! Inputs are split by result-id overlap rather than at random: an input
//! goes to test when the majority of its results fall into the sampled test
//! id set, so related inputs stay together. A top-up rule keeps the test
//! split from starving when inputs share most of their results.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;
use rand::SeedableRng;
use std::collections::BTreeSet;
use tracing::warn;

use embedtune_core::{Error, FineTuningInput, QueryItem, Result};

use crate::dataset::PairedFineTuningInputs;

/// Produces additional query variants for augmentation
///
/// Results, events and ranks of the augmented inputs are unchanged; only
/// the query differs.
pub trait QueryAugmenter: Send + Sync {
    /// Additional query variants (the original is kept separately)
    fn augment(&self, query: &QueryItem) -> Vec<QueryItem>;
}

/// Train and test paired datasets
#[derive(Debug)]
pub struct TrainTestSplit {
    /// Training split
    pub train: PairedFineTuningInputs,
    /// Test split
    pub test: PairedFineTuningInputs,
}

/// Splits fine-tuning inputs into train and test sets
pub struct TrainTestSplitter {
    test_size_ratio: f64,
    shuffle: bool,
    seed: Option<u64>,
    augmenter: Option<Box<dyn QueryAugmenter>>,
    do_augment_test: bool,
}

impl TrainTestSplitter {
    /// Create a splitter
    ///
    /// `test_size_ratio` must lie in (0, 1); ratios of 0.5 and above are
    /// unusual and get a warning.
    pub fn new(test_size_ratio: f64, shuffle: bool, seed: Option<u64>) -> Result<Self> {
        if !(test_size_ratio > 0.0 && test_size_ratio < 1.0) {
            return Err(Error::validation(
                "test_size_ratio must be a value in range (0, 1)",
            ));
        }
        if test_size_ratio >= 0.5 {
            warn!(
                target: "embedtune::training",
                test_size_ratio,
                "test_size_ratio of 0.5+ is unusual, test will outweigh train"
            );
        }
        Ok(TrainTestSplitter {
            test_size_ratio,
            shuffle,
            seed,
            augmenter: None,
            do_augment_test: false,
        })
    }

    /// Splitter with the usual defaults (ratio 0.2, shuffled)
    pub fn default_split() -> Self {
        Self::new(0.2, true, None).expect("default ratio is valid")
    }

    /// Attach a query augmenter
    pub fn with_augmenter(
        mut self,
        augmenter: Box<dyn QueryAugmenter>,
        do_augment_test: bool,
    ) -> Self {
        self.augmenter = Some(augmenter);
        self.do_augment_test = do_augment_test;
        self
    }

    /// Whether pair order is shuffled inside the output datasets
    pub fn shuffle(&self) -> bool {
        self.shuffle
    }

    /// Split inputs into train and test paired datasets
    pub fn split(&self, inputs: Vec<FineTuningInput>) -> Result<TrainTestSplit> {
        // 1. All result ids, sorted for deterministic sampling
        let all_ids: BTreeSet<String> = inputs
            .iter()
            .flat_map(|i| i.results.iter().cloned())
            .collect();
        if all_ids.is_empty() {
            return Err(Error::validation("inputs list is empty"));
        }

        let mut rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        // 2. Sample the test id subset
        let mut id_pool: Vec<String> = all_ids.into_iter().collect();
        id_pool.shuffle(&mut rng);
        let test_id_count =
            ((self.test_size_ratio * id_pool.len() as f64).ceil() as usize).min(id_pool.len());
        let test_ids: BTreeSet<String> = id_pool.into_iter().take(test_id_count).collect();

        // 3. Assign by majority overlap
        let min_test_inputs = (self.test_size_ratio * inputs.len() as f64).ceil() as usize;
        let mut train_inputs: Vec<FineTuningInput> = Vec::new();
        let mut test_inputs: Vec<FineTuningInput> = Vec::new();
        let mut skipped: Vec<FineTuningInput> = Vec::new();
        for input in inputs {
            if input.results.is_empty() {
                skipped.push(input);
                continue;
            }
            let overlap = input
                .results
                .iter()
                .filter(|id| test_ids.contains(*id))
                .count() as f64
                / input.results.len() as f64;
            if overlap > 0.5 {
                test_inputs.push(input);
            } else {
                train_inputs.push(input);
            }
        }

        // 4. Top up the test split when overlap keeps everything in train
        if test_inputs.len() < min_test_inputs {
            warn!(
                target: "embedtune::training",
                "Inputs intersect highly, so they are not split well; topping up the test split"
            );
            while test_inputs.len() < min_test_inputs && !train_inputs.is_empty() {
                let index = rng.gen_range(0..train_inputs.len());
                test_inputs.push(train_inputs.swap_remove(index));
            }
        }

        // 5. Inputs in neither split land in train
        if !skipped.is_empty() {
            warn!(
                target: "embedtune::training",
                count = skipped.len(),
                "Adding unassigned inputs to the train split"
            );
            train_inputs.extend(skipped);
        }

        let train_inputs = self.augment(train_inputs, true);
        let test_inputs = self.augment(test_inputs, self.do_augment_test);

        Ok(TrainTestSplit {
            train: PairedFineTuningInputs::new(train_inputs, self.shuffle, None, self.seed),
            test: PairedFineTuningInputs::new(test_inputs, self.shuffle, None, self.seed),
        })
    }

    fn augment(&self, inputs: Vec<FineTuningInput>, enabled: bool) -> Vec<FineTuningInput> {
        let Some(augmenter) = (enabled.then_some(self.augmenter.as_ref())).flatten() else {
            return inputs;
        };
        let mut augmented = Vec::with_capacity(inputs.len());
        for input in inputs {
            for query in augmenter.augment(&input.query) {
                let mut variant = input.clone();
                variant.query = query;
                augmented.push(variant);
            }
            augmented.push(input);
        }
        augmented
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn input_with_results(name: &str, results: &[&str]) -> FineTuningInput {
        let ranks: BTreeMap<String, Option<f64>> = results
            .iter()
            .map(|id| (id.to_string(), Some(0.5)))
            .collect();
        FineTuningInput::new(
            QueryItem::text(name),
            vec![results[0].to_string()],
            results.iter().map(|s| s.to_string()).collect(),
            ranks,
        )
        .unwrap()
    }

    #[test]
    fn test_ratio_validation() {
        assert!(TrainTestSplitter::new(0.0, true, None).is_err());
        assert!(TrainTestSplitter::new(1.0, true, None).is_err());
        assert!(TrainTestSplitter::new(0.2, true, None).is_ok());
    }

    #[test]
    fn test_empty_inputs_rejected() {
        let splitter = TrainTestSplitter::new(0.2, false, Some(1)).unwrap();
        assert!(splitter.split(vec![]).unwrap_err().is_validation());
    }

    #[test]
    fn test_split_preserves_every_input() {
        let inputs: Vec<FineTuningInput> = (0..20)
            .map(|i| {
                let a = format!("id{}", i * 3);
                let b = format!("id{}", i * 3 + 1);
                let c = format!("id{}", i * 3 + 2);
                input_with_results(&format!("q{i}"), &[&a, &b, &c])
            })
            .collect();
        let splitter = TrainTestSplitter::new(0.25, false, Some(7)).unwrap();
        let split = splitter.split(inputs).unwrap();

        let total = split.train.not_irrelevant().len()
            + split.train.irrelevant().len()
            + split.test.not_irrelevant().len()
            + split.test.irrelevant().len();
        assert_eq!(total, 20);
        assert!(!split.test.is_empty());
    }

    #[test]
    fn test_top_up_when_all_inputs_share_results() {
        // Every input shares the same 3 result ids: majority overlap puts
        // them all on one side, the top-up rule must fill the test quota
        let inputs: Vec<FineTuningInput> = (0..10)
            .map(|i| input_with_results(&format!("q{i}"), &["a", "b", "c"]))
            .collect();
        let splitter = TrainTestSplitter::new(0.3, false, Some(3)).unwrap();
        let split = splitter.split(inputs).unwrap();

        let test_count = split.test.not_irrelevant().len() + split.test.irrelevant().len();
        let train_count = split.train.not_irrelevant().len() + split.train.irrelevant().len();
        assert!(test_count >= 3, "test has {test_count}");
        assert!(train_count <= 7);
        assert_eq!(test_count + train_count, 10);
    }

    #[test]
    fn test_deterministic_under_seed() {
        let make_inputs = || {
            (0..12)
                .map(|i| {
                    let a = format!("id{}", i * 2);
                    let b = format!("id{}", i * 2 + 1);
                    input_with_results(&format!("q{i}"), &[&a, &b])
                })
                .collect::<Vec<_>>()
        };
        let splitter = TrainTestSplitter::new(0.25, false, Some(11)).unwrap();
        let first = splitter.split(make_inputs()).unwrap();
        let second = splitter.split(make_inputs()).unwrap();

        let names = |d: &PairedFineTuningInputs| {
            d.not_irrelevant()
                .iter()
                .filter_map(|i| i.query.as_text().map(str::to_string))
                .collect::<Vec<_>>()
        };
        assert_eq!(names(&first.test), names(&second.test));
        assert_eq!(names(&first.train), names(&second.train));
    }

    #[test]
    fn test_empty_result_inputs_land_in_train() {
        let mut inputs = vec![
            input_with_results("q0", &["a", "b"]),
            input_with_results("q1", &["c", "d"]),
        ];
        // An input with no results at all
        inputs.push(
            FineTuningInput::new(QueryItem::text("empty"), vec![], vec![], BTreeMap::new())
                .unwrap(),
        );
        let splitter = TrainTestSplitter::new(0.4, false, Some(5)).unwrap();
        let split = splitter.split(inputs).unwrap();
        let all_train: Vec<Option<&str>> = split
            .train
            .irrelevant()
            .iter()
            .map(|i| i.query.as_text())
            .collect();
        assert!(all_train.contains(&Some("empty")));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;
        use std::collections::BTreeSet;

        proptest! {
            #[test]
            fn split_is_total(
                sizes in proptest::collection::vec(1usize..5, 2..20),
                ratio in 0.1f64..0.45,
                seed in 0u64..1000,
            ) {
                let inputs: Vec<FineTuningInput> = sizes
                    .iter()
                    .enumerate()
                    .map(|(i, size)| {
                        let mut seen = BTreeSet::new();
                        let results: Vec<String> = (0..*size)
                            .map(|j| format!("id{}", (i * 3 + j * 7) % 17))
                            .filter(|r| seen.insert(r.clone()))
                            .collect();
                        let ranks: BTreeMap<String, Option<f64>> = results
                            .iter()
                            .map(|r| (r.clone(), Some(0.5)))
                            .collect();
                        FineTuningInput::new(
                            QueryItem::text(format!("q{i}")),
                            vec![],
                            results,
                            ranks,
                        )
                        .unwrap()
                    })
                    .collect();
                let total = inputs.len();

                let splitter = TrainTestSplitter::new(ratio, false, Some(seed)).unwrap();
                let split = splitter.split(inputs).unwrap();
                let count = split.train.not_irrelevant().len()
                    + split.train.irrelevant().len()
                    + split.test.not_irrelevant().len()
                    + split.test.irrelevant().len();
                prop_assert_eq!(count, total);
            }
        }
    }

    struct UppercaseAugmenter;
    impl QueryAugmenter for UppercaseAugmenter {
        fn augment(&self, query: &QueryItem) -> Vec<QueryItem> {
            match query.as_text() {
                Some(text) => vec![QueryItem::text(text.to_uppercase())],
                None => vec![],
            }
        }
    }

    #[test]
    fn test_augmenter_expands_train_only_by_default() {
        let inputs: Vec<FineTuningInput> = (0..10)
            .map(|i| {
                let a = format!("id{}", i * 2);
                let b = format!("id{}", i * 2 + 1);
                input_with_results(&format!("q{i}"), &[&a, &b])
            })
            .collect();
        let splitter = TrainTestSplitter::new(0.2, false, Some(2))
            .unwrap()
            .with_augmenter(Box::new(UppercaseAugmenter), false);
        let split = splitter.split(inputs).unwrap();

        let train_count = split.train.not_irrelevant().len();
        // Augmentation doubles the train side (original + uppercase variant)
        assert_eq!(train_count % 2, 0);
        assert!(split
            .train
            .not_irrelevant()
            .iter()
            .any(|i| i.query.as_text().map(|t| t.starts_with('Q')).unwrap_or(false)));
        // Test side untouched
        assert!(split
            .test
            .not_irrelevant()
            .iter()
            .all(|i| i.query.as_text().map(|t| t.starts_with('q')).unwrap_or(true)));
    }
}
