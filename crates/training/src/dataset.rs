//! Paired fine-tuning dataset
//!
//! Training consumes (relevant, irrelevant) input pairs. The dataset
//! partitions inputs by their irrelevance flag, cycles the shorter side so
//! indices align, optionally shuffles each side independently, and yields
//! pairs. When one side is empty the other side is yielded alone.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::{debug, warn};

use embedtune_core::FineTuningInput;

/// One element of a training batch: `(relevant, irrelevant)`
pub type InputPair = (Option<FineTuningInput>, Option<FineTuningInput>);

/// Relevant and irrelevant inputs paired for training
#[derive(Debug, Clone)]
pub struct PairedFineTuningInputs {
    irrelevant: Vec<FineTuningInput>,
    not_irrelevant: Vec<FineTuningInput>,
    irrelevant_indexes: Vec<usize>,
    not_irrelevant_indexes: Vec<usize>,
}

impl PairedFineTuningInputs {
    /// Build a paired dataset
    ///
    /// `randomize` shuffles the two sides independently (seeded when `seed`
    /// is given); `inputs_count` caps the number of pairs.
    pub fn new(
        inputs: Vec<FineTuningInput>,
        randomize: bool,
        inputs_count: Option<usize>,
        seed: Option<u64>,
    ) -> Self {
        let mut irrelevant = Vec::new();
        let mut not_irrelevant = Vec::new();
        for input in inputs {
            if input.is_irrelevant {
                irrelevant.push(input);
            } else {
                not_irrelevant.push(input);
            }
        }

        let mut irrelevant_indexes: Vec<usize> = (0..irrelevant.len()).collect();
        let mut not_irrelevant_indexes: Vec<usize> = (0..not_irrelevant.len()).collect();

        if !irrelevant.is_empty() && !not_irrelevant.is_empty() {
            if irrelevant.len() != not_irrelevant.len() {
                debug!(
                    target: "embedtune::training",
                    irrelevant = irrelevant.len(),
                    not_irrelevant = not_irrelevant.len(),
                    "Cycling the shorter side to align pair indices"
                );
                let max_size = irrelevant_indexes.len().max(not_irrelevant_indexes.len());
                irrelevant_indexes = cycle_to(&irrelevant_indexes, max_size);
                not_irrelevant_indexes = cycle_to(&not_irrelevant_indexes, max_size);
            }

            if randomize {
                let mut rng = match seed {
                    Some(seed) => StdRng::seed_from_u64(seed),
                    None => StdRng::from_entropy(),
                };
                irrelevant_indexes.shuffle(&mut rng);
                not_irrelevant_indexes.shuffle(&mut rng);
            }

            if let Some(count) = inputs_count {
                irrelevant_indexes.truncate(count);
                not_irrelevant_indexes.truncate(count);
            }
        } else if irrelevant.is_empty() {
            warn!(target: "embedtune::training", "List of irrelevant inputs is empty");
        } else {
            warn!(target: "embedtune::training", "List of relevant inputs is empty");
        }

        PairedFineTuningInputs {
            irrelevant,
            not_irrelevant,
            irrelevant_indexes,
            not_irrelevant_indexes,
        }
    }

    /// Number of pairs
    pub fn len(&self) -> usize {
        if self.irrelevant.is_empty() {
            return self.not_irrelevant.len();
        }
        if self.not_irrelevant.is_empty() {
            return self.irrelevant.len();
        }
        self.irrelevant_indexes
            .len()
            .min(self.not_irrelevant_indexes.len())
    }

    /// Whether the dataset yields nothing
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The relevant inputs
    pub fn not_irrelevant(&self) -> &[FineTuningInput] {
        &self.not_irrelevant
    }

    /// The irrelevant inputs
    pub fn irrelevant(&self) -> &[FineTuningInput] {
        &self.irrelevant
    }

    /// Mutable pass over every input of both sides
    ///
    /// Used by the rank-preprocessing step of the driver.
    pub fn for_each_input_mut(&mut self, mut f: impl FnMut(&mut FineTuningInput)) {
        for input in self
            .not_irrelevant
            .iter_mut()
            .chain(self.irrelevant.iter_mut())
        {
            f(input);
        }
    }

    /// The pair at `index`
    pub fn get(&self, index: usize) -> Option<InputPair> {
        if index >= self.len() {
            return None;
        }
        if self.irrelevant.is_empty() {
            return Some((Some(self.not_irrelevant[index].clone()), None));
        }
        if self.not_irrelevant.is_empty() {
            return Some((None, Some(self.irrelevant[index].clone())));
        }
        Some((
            Some(self.not_irrelevant[self.not_irrelevant_indexes[index]].clone()),
            Some(self.irrelevant[self.irrelevant_indexes[index]].clone()),
        ))
    }

    /// Pairs chunked into batches of `batch_size`, in the given pair order
    pub fn batches(&self, batch_size: usize, order: &[usize]) -> Vec<Vec<InputPair>> {
        let size = batch_size.max(1);
        order
            .chunks(size)
            .map(|chunk| chunk.iter().filter_map(|i| self.get(*i)).collect())
            .collect()
    }
}

fn cycle_to(indexes: &[usize], size: usize) -> Vec<usize> {
    indexes.iter().copied().cycle().take(size).collect()
}
