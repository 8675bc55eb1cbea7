use std::collections::{HashMap, hash_map::Entry};

use ndarray::{Array2, ArrayView2, Axis};

use crate::error::{PsErr, Result};

/// The raw keys of a batch, one column per sparse input.
pub type SparseBatch = HashMap<String, Vec<u64>>;

/// The working set of a sparse table for a single batch.
///
/// Raw keys are deduplicated in first-seen order, every raw occurrence remembers the
/// position of its key so gathered rows can be expanded back and occurrence gradients
/// can be summed into one row per key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndexBatch {
    keys: Vec<u64>,
    indices: Vec<usize>,
    positions: HashMap<u64, usize>,
}

impl IndexBatch {
    /// Creates a new `IndexBatch` out of the raw keys of a batch.
    pub fn from_keys(raw: &[u64]) -> Self {
        let mut batch = Self::default();
        batch.combine(raw);
        batch
    }

    /// Appends raw key occurrences to the batch.
    ///
    /// # Arguments
    /// * `raw` - The keys in occurrence order, duplicates allowed.
    pub fn combine(&mut self, raw: &[u64]) {
        self.indices.reserve(raw.len());

        for &key in raw {
            let index = match self.positions.entry(key) {
                Entry::Occupied(entry) => *entry.get(),
                Entry::Vacant(entry) => {
                    self.keys.push(key);
                    *entry.insert(self.keys.len() - 1)
                }
            };

            self.indices.push(index);
        }
    }

    /// The unique keys, in first-seen order.
    pub fn keys(&self) -> &[u64] {
        &self.keys
    }

    /// The position in `keys` of every raw occurrence.
    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    /// The amount of unique keys.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn occurrences(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn clear(&mut self) {
        self.keys.clear();
        self.indices.clear();
        self.positions.clear();
    }

    /// Expands one row per unique key into one row per raw occurrence.
    ///
    /// # Arguments
    /// * `rows` - The rows of `keys`, in the same order.
    ///
    /// # Returns
    /// The expanded rows or a `SizeMismatch` error.
    pub fn gather(&self, rows: ArrayView2<'_, f32>) -> Result<Array2<f32>> {
        if rows.nrows() != self.keys.len() {
            return Err(PsErr::SizeMismatch {
                what: "gathered rows",
                got: rows.nrows(),
                expected: self.keys.len(),
            });
        }

        Ok(rows.select(Axis(0), &self.indices))
    }

    /// Sums the gradient of every raw occurrence into one row per unique key.
    ///
    /// # Arguments
    /// * `grads` - One gradient row per raw occurrence.
    ///
    /// # Returns
    /// One gradient row per unique key or a `SizeMismatch` error.
    pub fn scatter_add(&self, grads: ArrayView2<'_, f32>) -> Result<Array2<f32>> {
        if grads.nrows() != self.indices.len() {
            return Err(PsErr::SizeMismatch {
                what: "occurrence gradients",
                got: grads.nrows(),
                expected: self.indices.len(),
            });
        }

        let mut out = Array2::zeros((self.keys.len(), grads.ncols()));

        for (grad, &index) in grads.outer_iter().zip(&self.indices) {
            let mut row = out.row_mut(index);
            row += &grad;
        }

        Ok(out)
    }
}

/// Builds the index batches of a registry, combining each sparse input once per batch even
/// when several tables read it.
#[derive(Debug, Default)]
pub struct IndexBatchManager {
    inputs: Vec<String>,
    cache: HashMap<String, IndexBatch>,
}

impl IndexBatchManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares that some sparse table reads `input`.
    pub fn register(&mut self, input: &str) {
        if !self.inputs.iter().any(|i| i == input) {
            self.inputs.push(input.to_string());
        }
    }

    /// The registered inputs, in registration order.
    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    /// Drops every index batch of the previous batch.
    pub fn clear(&mut self) {
        self.cache.clear();
    }

    /// Returns the index batch of `input`, combining it from `batch` the first time.
    ///
    /// # Arguments
    /// * `input` - A registered input name.
    /// * `batch` - The raw keys of the current batch.
    ///
    /// # Returns
    /// The index batch or an error if `input` isn't registered or missing from `batch`.
    pub fn combine(&mut self, input: &str, batch: &SparseBatch) -> Result<&IndexBatch> {
        if !self.inputs.iter().any(|i| i == input) {
            return Err(PsErr::invalid(
                "sparse input",
                format!("{input:?}"),
                "an input registered by some sparse table",
            ));
        }

        match self.cache.entry(input.to_string()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let raw = batch.get(input).ok_or_else(|| {
                    PsErr::invalid(
                        "sparse input",
                        format!("{input:?}"),
                        "a column present in the batch",
                    )
                })?;

                Ok(entry.insert(IndexBatch::from_keys(raw)))
            }
        }
    }
}
