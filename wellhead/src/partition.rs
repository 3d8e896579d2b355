//! Seeded train/eval assignment for encoded samples.

use std::collections::HashSet;

use clap::ValueEnum;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tracing::info;

// ============================================================================
// Split Assignment
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Split {
    Train,
    Eval,
}

impl Split {
    /// File stem of this split's output stream.
    pub fn stream_name(self) -> &'static str {
        match self {
            Split::Train => "train_input_part",
            Split::Eval => "test_input_part",
        }
    }

    /// Description recorded alongside the declared schema.
    pub fn description(self) -> &'static str {
        match self {
            Split::Train => "mt_TRAIN",
            Split::Eval => "mt_TEST",
        }
    }
}

/// Which index is tested against the eval set when a sample closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum PartitionKey {
    /// 0-based index of the data line that completed the sample (header
    /// excluded, malformed lines included). Compatible with existing datasets.
    #[default]
    RowIndex,
    /// Ordinal of the sample among all emitted samples.
    SampleIndex,
}

// ============================================================================
// Partitioner
// ============================================================================

/// Picks a fixed eval subset of `[0, total)` from a seeded shuffle.
///
/// The first `floor(total * eval_fraction)` entries of the shuffled range form
/// the eval set; every other index is train. Identical arguments always yield
/// the identical set.
#[derive(Debug, Clone)]
pub struct DatasetPartitioner {
    total: usize,
    key: PartitionKey,
    eval_indices: HashSet<usize>,
}

impl DatasetPartitioner {
    pub fn new(total: usize, eval_fraction: f64, seed: u64) -> Self {
        let eval_len = ((total as f64) * eval_fraction).floor() as usize;
        let mut all_indices: Vec<usize> = (0..total).collect();
        let mut rng = StdRng::seed_from_u64(seed);
        all_indices.shuffle(&mut rng);
        let eval_indices: HashSet<usize> = all_indices[..eval_len.min(total)].iter().copied().collect();
        info!(
            "  Partitioner: {} indices, {} eval (seed {})",
            total,
            eval_indices.len(),
            seed
        );
        Self {
            total,
            key: PartitionKey::default(),
            eval_indices,
        }
    }

    pub fn with_key(mut self, key: PartitionKey) -> Self {
        self.key = key;
        self
    }

    pub fn key(&self) -> PartitionKey {
        self.key
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn eval_len(&self) -> usize {
        self.eval_indices.len()
    }

    pub fn eval_indices(&self) -> &HashSet<usize> {
        &self.eval_indices
    }

    /// Split for a raw index. Indices outside `[0, total)` are train.
    pub fn split_of(&self, index: usize) -> Split {
        if self.eval_indices.contains(&index) {
            Split::Eval
        } else {
            Split::Train
        }
    }

    /// Split for a sample that closed on data line `row_index` as the
    /// `sample_index`-th sample, according to the configured key.
    pub fn route(&self, row_index: usize, sample_index: usize) -> Split {
        match self.key {
            PartitionKey::RowIndex => self.split_of(row_index),
            PartitionKey::SampleIndex => self.split_of(sample_index),
        }
    }
}
