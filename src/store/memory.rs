use std::{collections::HashMap, path::Path, sync::Arc};

use async_trait::async_trait;
use log::{debug, info};
use ndarray::{Array2, ArrayD, ArrayView2, ArrayViewD};
use parking_lot::RwLock;

use super::{
    RemoteStore, RowPredicate,
    checkpoint::{self, DenseRecord, SparseRecord},
    dense::DenseSlot,
    sparse::SparseTable,
};
use crate::{
    error::{PsErr, Result},
    initialization::Initializer,
    optimization::Updater,
};

#[derive(Debug, Clone)]
enum Entry {
    Dense(Arc<DenseSlot>),
    Sparse(Arc<SparseTable>),
}

/// An in-process reference implementation of `RemoteStore`.
///
/// Every tensor lives behind its own locks, so operations on different tensors never
/// contend, and sparse tables are further split in partitions updated in parallel.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, name: &str) -> Result<Entry> {
        self.entries
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| PsErr::UnknownTensor {
                name: name.to_string(),
            })
    }

    fn dense(&self, name: &str) -> Result<Arc<DenseSlot>> {
        match self.entry(name)? {
            Entry::Dense(slot) => Ok(slot),
            Entry::Sparse(_) => Err(PsErr::State(format!(
                "{name:?} is a sparse table, not a dense tensor"
            ))),
        }
    }

    fn sparse(&self, name: &str) -> Result<Arc<SparseTable>> {
        match self.entry(name)? {
            Entry::Sparse(table) => Ok(table),
            Entry::Dense(_) => Err(PsErr::State(format!(
                "{name:?} is a dense tensor, not a sparse table"
            ))),
        }
    }

    /// The amount of rows currently held by a sparse table.
    pub fn sparse_len(&self, table: &str) -> Result<usize> {
        Ok(self.sparse(table)?.len())
    }

    /// A copy of every row of a sparse table, with its version and ages.
    pub fn sparse_snapshot(&self, table: &str) -> Result<SparseRecord> {
        Ok(self.sparse(table)?.snapshot())
    }

    /// The current version of a sparse table.
    pub fn sparse_version(&self, table: &str) -> Result<u64> {
        Ok(self.sparse(table)?.version())
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn create_dense(
        &self,
        name: &str,
        shape: &[usize],
        initializer: Arc<dyn Initializer>,
        updater: Arc<dyn Updater>,
    ) -> Result<bool> {
        let mut entries = self.entries.write();

        match entries.get(name) {
            Some(Entry::Dense(slot)) if slot.shape() == shape => Ok(false),
            Some(Entry::Dense(slot)) => Err(PsErr::SizeMismatch {
                what: "dense shape",
                got: shape.iter().product(),
                expected: slot.shape().iter().product(),
            }),
            Some(Entry::Sparse(_)) => Err(PsErr::State(format!(
                "{name:?} is already registered as a sparse table"
            ))),
            None => {
                let slot = DenseSlot::new(name, shape, initializer.as_ref(), updater)?;
                entries.insert(name.to_string(), Entry::Dense(Arc::new(slot)));
                debug!(tensor = name; "created dense tensor with shape {shape:?}");
                Ok(true)
            }
        }
    }

    async fn create_sparse(
        &self,
        name: &str,
        width: usize,
        partition_count: usize,
        initializer: Arc<dyn Initializer>,
        updater: Arc<dyn Updater>,
    ) -> Result<bool> {
        let mut entries = self.entries.write();

        match entries.get(name) {
            Some(Entry::Sparse(table)) if table.width() == width => Ok(false),
            Some(Entry::Sparse(table)) => Err(PsErr::SizeMismatch {
                what: "sparse width",
                got: width,
                expected: table.width(),
            }),
            Some(Entry::Dense(_)) => Err(PsErr::State(format!(
                "{name:?} is already registered as a dense tensor"
            ))),
            None => {
                let table = SparseTable::new(name, width, partition_count, initializer, updater)?;
                entries.insert(name.to_string(), Entry::Sparse(Arc::new(table)));
                debug!(tensor = name; "created sparse table of width {width} in {partition_count} partitions");
                Ok(true)
            }
        }
    }

    async fn get(&self, name: &str) -> Result<ArrayD<f32>> {
        self.dense(name)?.get()
    }

    async fn set(&self, name: &str, value: ArrayViewD<'_, f32>) -> Result<()> {
        self.dense(name)?.set(value)
    }

    async fn apply_update(&self, name: &str, grad: ArrayViewD<'_, f32>) -> Result<()> {
        self.dense(name)?.apply_update(grad)
    }

    async fn get_slice(&self, table: &str, keys: &[u64]) -> Result<Array2<f32>> {
        self.sparse(table)?.get_slice(keys)
    }

    async fn set_slice(&self, table: &str, keys: &[u64], rows: ArrayView2<'_, f32>) -> Result<()> {
        self.sparse(table)?.set_slice(keys, rows)
    }

    async fn apply_slice_update(
        &self,
        table: &str,
        keys: &[u64],
        grads: ArrayView2<'_, f32>,
    ) -> Result<()> {
        self.sparse(table)?.apply_update(keys, grads)
    }

    async fn delete_where(&self, table: &str, predicate: RowPredicate) -> Result<usize> {
        let removed = self.sparse(table)?.delete_where(predicate);
        info!(tensor = table, removed = removed; "deleted rows matching {predicate:?}");
        Ok(removed)
    }

    async fn save(&self, name: &str, dir: &Path) -> Result<()> {
        let path = checkpoint::checkpoint_path(dir, name);

        match self.entry(name)? {
            Entry::Dense(slot) => checkpoint::write_record(&path, &slot.snapshot()).await?,
            Entry::Sparse(table) => checkpoint::write_record(&path, &table.snapshot()).await?,
        }

        debug!(tensor = name; "saved checkpoint to {}", path.display());
        Ok(())
    }

    async fn load(&self, name: &str, dir: &Path, keep_meta: bool) -> Result<()> {
        let path = checkpoint::checkpoint_path(dir, name);

        match self.entry(name)? {
            Entry::Dense(slot) => {
                let record: DenseRecord = checkpoint::read_record(&path).await?;
                slot.restore(record)?;
            }
            Entry::Sparse(table) => {
                let record: SparseRecord = checkpoint::read_record(&path).await?;
                table.restore(record, keep_meta)?;
            }
        }

        debug!(tensor = name, keep_meta = keep_meta; "loaded checkpoint from {}", path.display());
        Ok(())
    }

    async fn export(&self, table: &str, dir: &Path) -> Result<()> {
        let partitions = self.sparse(table)?.export();

        for (i, partition) in partitions.iter().enumerate() {
            checkpoint::write_record(&checkpoint::partition_path(dir, i), partition).await?;
        }

        debug!(tensor = table; "exported {} partitions to {}", partitions.len(), dir.display());
        Ok(())
    }

    fn partition_count(&self, table: &str) -> Result<usize> {
        Ok(self.sparse(table)?.partition_count())
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{ArrayD, IxDyn, array};
    use tempfile::tempdir;

    use super::*;
    use crate::{
        initialization::{ConstInit, NormalInit, shared_rng},
        optimization::{Adam, Sgd},
    };

    fn sgd() -> Arc<dyn Updater> {
        Arc::new(Sgd::new(0.5).unwrap())
    }

    #[tokio::test]
    async fn create_is_idempotent() {
        let store = MemoryStore::new();
        let one: Arc<dyn Initializer> = Arc::new(ConstInit::one());

        assert!(store.create_dense("w", &[2, 2], one.clone(), sgd()).await.unwrap());
        store
            .apply_update("w", ArrayD::from_elem(IxDyn(&[2, 2]), 1.0).view())
            .await
            .unwrap();

        assert!(!store.create_dense("w", &[2, 2], one.clone(), sgd()).await.unwrap());
        assert!(store.get("w").await.unwrap().iter().all(|&v| v == 0.5));

        assert!(store.create_dense("w", &[4], one.clone(), sgd()).await.is_err());
        assert!(store.create_sparse("w", 4, 2, one, sgd()).await.is_err());
    }

    #[tokio::test]
    async fn failed_slice_updates_change_nothing() {
        let store = MemoryStore::new();
        let init: Arc<dyn Initializer> = Arc::new(NormalInit::standard(shared_rng(Some(5))));
        store.create_sparse("emb", 1, 2, init, sgd()).await.unwrap();
        store.get_slice("emb", &[2]).await.unwrap();
        let before = store.sparse_snapshot("emb").unwrap();

        let err = store
            .apply_slice_update("emb", &[2, 3, 2], array![[0.5], [0.5], [0.5]].view())
            .await
            .unwrap_err();

        assert!(matches!(err, PsErr::InvalidArgument { .. }));
        assert_eq!(store.sparse_snapshot("emb").unwrap(), before);
        assert_eq!(store.sparse_version("emb").unwrap(), 0);
    }

    #[tokio::test]
    async fn unknown_tensors_are_reported() {
        let store = MemoryStore::new();
        let err = store.get("missing").await.unwrap_err();
        assert!(matches!(err, PsErr::UnknownTensor { .. }));
    }

    #[tokio::test]
    async fn prune_small_with_zero_epsilon_removes_exact_zeros_only() {
        let store = MemoryStore::new();
        store
            .create_sparse("emb", 2, 2, Arc::new(ConstInit::one()), sgd())
            .await
            .unwrap();

        store
            .set_slice("emb", &[1, 2, 3], array![[0., 0.], [0., 1e-7], [-0., 0.]].view())
            .await
            .unwrap();

        let removed = store
            .delete_where("emb", RowPredicate::Small { epsilon: 0. })
            .await
            .unwrap();

        assert_eq!(removed, 2);
        assert_eq!(store.sparse_len("emb").unwrap(), 1);
    }

    #[tokio::test]
    async fn dense_checkpoint_round_trips_bit_for_bit() {
        let dir = tempdir().unwrap();
        let store = MemoryStore::new();
        let adam: Arc<dyn Updater> = Arc::new(Adam::new(0.01, 0.9, 0.999, 1e-8).unwrap());
        let init = Arc::new(NormalInit::standard(shared_rng(Some(11))));

        store.create_dense("fc.weight", &[3, 5], init, adam.clone()).await.unwrap();
        let grad = ArrayD::from_shape_fn(IxDyn(&[3, 5]), |i| i[0] as f32 - 0.3 * i[1] as f32);
        store.apply_update("fc.weight", grad.view()).await.unwrap();

        let before = store.get("fc.weight").await.unwrap();
        store.save("fc.weight", dir.path()).await.unwrap();

        store.apply_update("fc.weight", grad.view()).await.unwrap();
        assert_ne!(store.get("fc.weight").await.unwrap(), before);

        store.load("fc.weight", dir.path(), false).await.unwrap();
        let after = store.get("fc.weight").await.unwrap();

        let bits = |a: &ArrayD<f32>| a.iter().map(|v| v.to_bits()).collect::<Vec<_>>();
        assert_eq!(bits(&before), bits(&after));
    }

    #[tokio::test]
    async fn export_writes_one_file_per_partition() {
        let dir = tempdir().unwrap();
        let store = MemoryStore::new();
        store
            .create_sparse("emb", 3, 4, Arc::new(ConstInit::one()), sgd())
            .await
            .unwrap();
        store.get_slice("emb", &[1, 2, 3, 4, 5]).await.unwrap();

        let out = dir.path().join("model.ptm.msd").join("emb.msm");
        store.export("emb", &out).await.unwrap();

        for i in 0..4 {
            assert!(checkpoint::partition_path(&out, i).is_file());
        }

        let first: checkpoint::ExportedPartition =
            checkpoint::read_record(&checkpoint::partition_path(&out, 1)).await.unwrap();
        let keys: Vec<u64> = first.rows.iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, [1, 5]);
    }
}
