use std::{path::Path, sync::Arc};

use async_trait::async_trait;
use ndarray::{Array2, ArrayD, ArrayView2, ArrayViewD};

use crate::{
    error::Result,
    initialization::Initializer,
    optimization::Updater,
};

/// Selects the rows `RemoteStore::delete_where` removes from a sparse table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RowPredicate {
    /// Rows whose largest absolute value is at most `epsilon`.
    Small { epsilon: f32 },
    /// Rows untouched for more than `max_age` table versions.
    Old { max_age: u64 },
}

impl RowPredicate {
    /// Evaluates the predicate on a single row.
    ///
    /// # Arguments
    /// * `values` - The values of the row.
    /// * `age` - How many versions ago the row was last pushed.
    pub fn matches(&self, values: &[f32], age: u64) -> bool {
        match *self {
            Self::Small { epsilon } => values.iter().all(|v| v.abs() <= epsilon),
            Self::Old { max_age } => age > max_age,
        }
    }
}

/// The contract of the authoritative store every `DistributedTensor` synchronizes against.
///
/// Implementations must be linearizable per key and must fail instead of hanging. The store
/// keeps the updater and initializer a tensor was registered with and applies them itself.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Registers a dense tensor, allocating and initializing it if it doesn't exist yet.
    ///
    /// # Arguments
    /// * `name` - The qualified name of the tensor.
    /// * `shape` - Its declared shape.
    /// * `initializer` - Generates the first value.
    /// * `updater` - Turns every pushed gradient into a new value.
    ///
    /// # Returns
    /// Whether the tensor was created by this call, or an error if the name is taken by a
    /// tensor of another kind or shape.
    async fn create_dense(
        &self,
        name: &str,
        shape: &[usize],
        initializer: Arc<dyn Initializer>,
        updater: Arc<dyn Updater>,
    ) -> Result<bool>;

    /// Registers a sparse table if it doesn't exist yet, rows are created lazily.
    ///
    /// # Arguments
    /// * `name` - The qualified name of the table.
    /// * `width` - The amount of values per row.
    /// * `partition_count` - The amount of partitions the keys are spread across.
    /// * `initializer` - Generates the first value of every new row.
    /// * `updater` - Turns every pushed gradient into new row values.
    ///
    /// # Returns
    /// Whether the table was created by this call.
    async fn create_sparse(
        &self,
        name: &str,
        width: usize,
        partition_count: usize,
        initializer: Arc<dyn Initializer>,
        updater: Arc<dyn Updater>,
    ) -> Result<bool>;

    /// Fetches the whole value of a dense tensor in its declared shape.
    async fn get(&self, name: &str) -> Result<ArrayD<f32>>;

    /// Overwrites the value of a dense tensor, its optimizer state is kept.
    async fn set(&self, name: &str, value: ArrayViewD<'_, f32>) -> Result<()>;

    /// Applies the registered updater to a dense tensor.
    async fn apply_update(&self, name: &str, grad: ArrayViewD<'_, f32>) -> Result<()>;

    /// Fetches one row per key, creating the rows of unseen keys.
    async fn get_slice(&self, table: &str, keys: &[u64]) -> Result<Array2<f32>>;

    /// Overwrites the rows of `keys`, creating them if needed.
    async fn set_slice(&self, table: &str, keys: &[u64], rows: ArrayView2<'_, f32>) -> Result<()>;

    /// Applies the registered updater to the rows of `keys`, all or nothing.
    ///
    /// # Arguments
    /// * `table` - The name of the table.
    /// * `keys` - The unique keys being pushed.
    /// * `grads` - One gradient row per key.
    async fn apply_slice_update(
        &self,
        table: &str,
        keys: &[u64],
        grads: ArrayView2<'_, f32>,
    ) -> Result<()>;

    /// Removes every row of `table` matching `predicate`.
    ///
    /// # Returns
    /// The amount of removed rows.
    async fn delete_where(&self, table: &str, predicate: RowPredicate) -> Result<usize>;

    /// Writes a checkpoint of a tensor, optimizer state included, into `dir`.
    async fn save(&self, name: &str, dir: &Path) -> Result<()>;

    /// Restores a tensor from a checkpoint previously written into `dir`.
    ///
    /// # Arguments
    /// * `name` - The tensor to restore, it must already be registered.
    /// * `dir` - The checkpoint directory.
    /// * `keep_meta` - Whether to keep the row ages of a sparse table or reset them.
    async fn load(&self, name: &str, dir: &Path, keep_meta: bool) -> Result<()>;

    /// Writes the values of a sparse table into `dir`, one file per partition.
    async fn export(&self, table: &str, dir: &Path) -> Result<()>;

    /// The amount of partitions of a sparse table.
    fn partition_count(&self, table: &str) -> Result<usize>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_rows_compare_the_largest_magnitude() {
        let zero = RowPredicate::Small { epsilon: 0. };
        assert!(zero.matches(&[0., -0., 0.], 0));
        assert!(!zero.matches(&[0., 1e-12, 0.], 0));

        let small = RowPredicate::Small { epsilon: 0.5 };
        assert!(small.matches(&[0.5, -0.5], 0));
        assert!(!small.matches(&[0.1, -0.6], 0));
    }

    #[test]
    fn old_rows_are_strictly_older() {
        let old = RowPredicate::Old { max_age: 3 };
        assert!(old.matches(&[], 4));
        assert!(!old.matches(&[], 3));
        assert!(!old.matches(&[], 2));
    }
}
