use std::{path::Path, sync::Arc};

use log::debug;
use ndarray::{Array2, ArrayD, ArrayView2, ArrayViewD, IxDyn};

use super::IndexBatch;
use crate::{
    checks,
    error::{PsErr, Result},
    initialization::Initializer,
    names,
    optimization::Updater,
    store::{RowPredicate, StoreHandle},
};

/// Whether a tensor is a single fixed-shape value or a key addressed table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorKind {
    Dense,
    Sparse,
}

/// What a dense tensor pushes to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenseRole {
    /// A trainable parameter, it pushes its gradient.
    Parameter,
    /// A running statistic, it pushes its local value as the input of its updater.
    Buffer,
}

#[derive(Debug)]
struct DenseMirror {
    role: DenseRole,
    value: ArrayD<f32>,
    grad: Option<ArrayD<f32>>,
}

#[derive(Debug)]
struct SparseMirror {
    width: usize,
    partition_count: usize,
    input: String,
    batch: IndexBatch,
    rows: Array2<f32>,
    grad: Option<Array2<f32>>,
}

#[derive(Debug)]
enum Mirror {
    Dense(DenseMirror),
    Sparse(SparseMirror),
}

/// Binds a local mirror of a tensor to its authoritative copy in the store.
///
/// Every operation against the store is a single request, the registry fans them out over
/// all of its tensors. A tensor is only ever borrowed by one of those requests at a time.
#[derive(Debug)]
pub struct DistributedTensor {
    name: String,
    store: StoreHandle,
    initializer: Arc<dyn Initializer>,
    updater: Arc<dyn Updater>,
    mirror: Mirror,
}

impl DistributedTensor {
    /// Creates a new dense `DistributedTensor`, its local value starts zeroed until pulled.
    ///
    /// # Arguments
    /// * `name` - A valid qualified name.
    /// * `shape` - The declared shape.
    /// * `role` - Whether it pushes gradients or its own value.
    /// * `store` - The authoritative store.
    /// * `initializer` - Generates the first value in the store.
    /// * `updater` - Applied by the store on every push.
    ///
    /// # Returns
    /// A new `DistributedTensor` or an `InvalidName` error.
    pub fn dense(
        name: &str,
        shape: &[usize],
        role: DenseRole,
        store: StoreHandle,
        initializer: Arc<dyn Initializer>,
        updater: Arc<dyn Updater>,
    ) -> Result<Self> {
        Ok(Self {
            name: names::checked_qualified_name(name)?,
            store,
            initializer,
            updater,
            mirror: Mirror::Dense(DenseMirror {
                role,
                value: ArrayD::zeros(IxDyn(shape)),
                grad: None,
            }),
        })
    }

    /// Creates a new sparse `DistributedTensor` with an empty working set.
    ///
    /// # Arguments
    /// * `name` - A valid qualified name.
    /// * `width` - The amount of values per row, must be positive.
    /// * `partition_count` - The amount of store partitions, must be positive.
    /// * `input` - The sparse input column the table reads its keys from.
    /// * `store` - The authoritative store.
    /// * `initializer` - Generates the first value of every new key.
    /// * `updater` - Applied by the store on every push.
    ///
    /// # Returns
    /// A new `DistributedTensor` or an error if any argument is invalid.
    pub fn sparse(
        name: &str,
        width: usize,
        partition_count: usize,
        input: &str,
        store: StoreHandle,
        initializer: Arc<dyn Initializer>,
        updater: Arc<dyn Updater>,
    ) -> Result<Self> {
        let name = names::checked_qualified_name(name)?;

        if width == 0 {
            return Err(PsErr::invalid("width", width, "a positive integer"));
        }

        if partition_count == 0 {
            return Err(PsErr::invalid(
                "partition_count",
                partition_count,
                "a positive integer",
            ));
        }

        Ok(Self {
            name,
            store,
            initializer,
            updater,
            mirror: Mirror::Sparse(SparseMirror {
                width,
                partition_count,
                input: input.to_string(),
                batch: IndexBatch::default(),
                rows: Array2::zeros((0, width)),
                grad: None,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> TensorKind {
        match self.mirror {
            Mirror::Dense(_) => TensorKind::Dense,
            Mirror::Sparse(_) => TensorKind::Sparse,
        }
    }

    pub fn is_dense(&self) -> bool {
        self.kind() == TensorKind::Dense
    }

    pub fn is_sparse(&self) -> bool {
        self.kind() == TensorKind::Sparse
    }

    pub fn updater(&self) -> &Arc<dyn Updater> {
        &self.updater
    }

    pub fn initializer(&self) -> &Arc<dyn Initializer> {
        &self.initializer
    }

    /// The role of a dense tensor, `None` for sparse ones.
    pub fn role(&self) -> Option<DenseRole> {
        match &self.mirror {
            Mirror::Dense(dense) => Some(dense.role),
            Mirror::Sparse(_) => None,
        }
    }

    fn dense_ref(&self) -> Result<&DenseMirror> {
        match &self.mirror {
            Mirror::Dense(dense) => Ok(dense),
            Mirror::Sparse(_) => Err(kind_err(&self.name, "dense")),
        }
    }

    fn dense_mut(&mut self) -> Result<&mut DenseMirror> {
        match &mut self.mirror {
            Mirror::Dense(dense) => Ok(dense),
            Mirror::Sparse(_) => Err(kind_err(&self.name, "dense")),
        }
    }

    fn sparse_ref(&self) -> Result<&SparseMirror> {
        match &self.mirror {
            Mirror::Sparse(sparse) => Ok(sparse),
            Mirror::Dense(_) => Err(kind_err(&self.name, "sparse")),
        }
    }

    fn sparse_mut(&mut self) -> Result<&mut SparseMirror> {
        match &mut self.mirror {
            Mirror::Sparse(sparse) => Ok(sparse),
            Mirror::Dense(_) => Err(kind_err(&self.name, "sparse")),
        }
    }

    /// The declared shape of a dense tensor.
    pub fn shape(&self) -> Result<&[usize]> {
        Ok(self.dense_ref()?.value.shape())
    }

    /// The local value of a dense tensor.
    pub fn value(&self) -> Result<ArrayViewD<'_, f32>> {
        Ok(self.dense_ref()?.value.view())
    }

    /// Overwrites the local value of a dense tensor, like a forward pass does with running
    /// statistics.
    ///
    /// # Returns
    /// A `SizeMismatch` error if `value` doesn't have the declared shape.
    pub fn set_value(&mut self, value: ArrayViewD<'_, f32>) -> Result<()> {
        let dense = self.dense_mut()?;
        check_shape("dense value", value.shape(), dense.value.shape())?;
        dense.value.assign(&value);
        Ok(())
    }

    /// The local gradient of a dense tensor, if any was accumulated.
    pub fn grad(&self) -> Result<Option<ArrayViewD<'_, f32>>> {
        Ok(self.dense_ref()?.grad.as_ref().map(|g| g.view()))
    }

    /// Adds `grad` to the local gradient of a dense tensor.
    pub fn accumulate_grad(&mut self, grad: ArrayViewD<'_, f32>) -> Result<()> {
        let dense = self.dense_mut()?;
        check_shape("dense gradient", grad.shape(), dense.value.shape())?;

        match &mut dense.grad {
            Some(acc) => *acc += &grad,
            None => dense.grad = Some(grad.to_owned()),
        }

        Ok(())
    }

    /// The row width of a sparse table.
    pub fn width(&self) -> Result<usize> {
        Ok(self.sparse_ref()?.width)
    }

    pub fn partition_count(&self) -> Result<usize> {
        Ok(self.sparse_ref()?.partition_count)
    }

    /// The sparse input column a table reads its keys from.
    pub fn input(&self) -> Result<&str> {
        Ok(&self.sparse_ref()?.input)
    }

    /// The working set of a sparse table.
    pub fn working_set(&self) -> Result<&IndexBatch> {
        Ok(&self.sparse_ref()?.batch)
    }

    /// Replaces the working set of a sparse table with the one of a new batch.
    pub fn set_working_set(&mut self, batch: IndexBatch) -> Result<()> {
        let sparse = self.sparse_mut()?;
        sparse.rows = Array2::zeros((0, sparse.width));
        sparse.grad = None;
        sparse.batch = batch;
        Ok(())
    }

    /// The pulled rows of a sparse table, one per key of the working set.
    pub fn rows(&self) -> Result<ArrayView2<'_, f32>> {
        Ok(self.sparse_ref()?.rows.view())
    }

    /// Looks up the embedding of every raw occurrence of the working set.
    pub fn embed(&self) -> Result<Array2<f32>> {
        let sparse = self.sparse_ref()?;
        sparse.batch.gather(sparse.rows.view())
    }

    /// The gradient of a sparse table, one row per key of the working set.
    pub fn sparse_grad(&self) -> Result<Option<ArrayView2<'_, f32>>> {
        Ok(self.sparse_ref()?.grad.as_ref().map(|g| g.view()))
    }

    /// Sums the gradient of every raw occurrence into the per-key gradient of a sparse table.
    ///
    /// # Arguments
    /// * `grads` - One row per raw occurrence of the working set.
    pub fn accumulate_sparse_grad(&mut self, grads: ArrayView2<'_, f32>) -> Result<()> {
        let sparse = self.sparse_mut()?;
        check_shape("sparse gradient width", &[grads.ncols()], &[sparse.width])?;
        let summed = sparse.batch.scatter_add(grads)?;

        match &mut sparse.grad {
            Some(acc) => *acc += &summed,
            None => sparse.grad = Some(summed),
        }

        Ok(())
    }

    /// Registers the tensor in the store unless it already exists there.
    pub async fn init(&self) -> Result<()> {
        let created = match &self.mirror {
            Mirror::Dense(dense) => {
                self.store
                    .create_dense(
                        &self.name,
                        dense.value.shape(),
                        Arc::clone(&self.initializer),
                        Arc::clone(&self.updater),
                    )
                    .await?
            }
            Mirror::Sparse(sparse) => {
                self.store
                    .create_sparse(
                        &self.name,
                        sparse.width,
                        sparse.partition_count,
                        Arc::clone(&self.initializer),
                        Arc::clone(&self.updater),
                    )
                    .await?
            }
        };

        debug!(tensor = self.name.as_str(), created = created; "initialized");
        Ok(())
    }

    /// Fetches the authoritative value, the rows of the working set for sparse tables.
    pub async fn pull(&mut self) -> Result<()> {
        match &mut self.mirror {
            Mirror::Dense(dense) => {
                let value = self.store.get(&self.name).await?;
                check_shape("pulled dense value", value.shape(), dense.value.shape())?;
                dense.value = value;
            }
            Mirror::Sparse(sparse) => {
                if sparse.batch.is_empty() {
                    sparse.rows = Array2::zeros((0, sparse.width));
                    return Ok(());
                }

                let rows = self.store.get_slice(&self.name, sparse.batch.keys()).await?;
                check_shape(
                    "pulled sparse rows",
                    rows.shape(),
                    &[sparse.batch.len(), sparse.width],
                )?;
                sparse.rows = rows;
            }
        }

        Ok(())
    }

    /// Sends the local gradient, or the local value, to the store.
    ///
    /// # Arguments
    /// * `is_value` - Overwrite the authoritative value instead of updating it.
    /// * `skip_no_grad` - Don't push tensors without a local gradient, otherwise push zeros.
    pub async fn push(&mut self, is_value: bool, skip_no_grad: bool) -> Result<()> {
        match &self.mirror {
            Mirror::Dense(dense) if is_value => {
                self.store.set(&self.name, dense.value.view()).await?;
            }
            Mirror::Dense(dense) if dense.role == DenseRole::Buffer => {
                self.store.apply_update(&self.name, dense.value.view()).await?;
            }
            Mirror::Dense(dense) => match &dense.grad {
                Some(grad) => self.store.apply_update(&self.name, grad.view()).await?,
                None if skip_no_grad => return Ok(()),
                None => {
                    let zeros = ArrayD::zeros(dense.value.raw_dim());
                    self.store.apply_update(&self.name, zeros.view()).await?;
                }
            },
            Mirror::Sparse(sparse) if sparse.batch.is_empty() => return Ok(()),
            Mirror::Sparse(sparse) if is_value => {
                self.store
                    .set_slice(&self.name, sparse.batch.keys(), sparse.rows.view())
                    .await?;
            }
            Mirror::Sparse(sparse) => match &sparse.grad {
                Some(grad) => {
                    self.store
                        .apply_slice_update(&self.name, sparse.batch.keys(), grad.view())
                        .await?;
                }
                None if skip_no_grad => return Ok(()),
                None => {
                    let zeros = Array2::zeros((sparse.batch.len(), sparse.width));
                    self.store
                        .apply_slice_update(&self.name, sparse.batch.keys(), zeros.view())
                        .await?;
                }
            },
        }

        debug!(tensor = self.name.as_str(), is_value = is_value; "pushed");
        Ok(())
    }

    /// Drops the local gradient, the store isn't involved.
    pub fn zero_grad(&mut self) {
        match &mut self.mirror {
            Mirror::Dense(dense) => dense.grad = None,
            Mirror::Sparse(sparse) => sparse.grad = None,
        }
    }

    /// Checkpoints the authoritative copy, optimizer state included, into `dir`.
    pub async fn save(&self, dir: &Path) -> Result<()> {
        self.store.save(&self.name, dir).await
    }

    /// Restores the authoritative copy from a checkpoint in `dir`.
    ///
    /// # Arguments
    /// * `dir` - The checkpoint directory.
    /// * `keep_meta` - Whether a sparse table keeps its row ages.
    pub async fn load(&self, dir: &Path, keep_meta: bool) -> Result<()> {
        self.store.load(&self.name, dir, keep_meta).await
    }

    /// Drops the working set of a sparse table, the store isn't involved.
    pub fn clear(&mut self) -> Result<()> {
        let sparse = self.sparse_mut()?;
        sparse.batch.clear();
        sparse.rows = Array2::zeros((0, sparse.width));
        sparse.grad = None;
        Ok(())
    }

    /// Removes the rows of a sparse table whose largest magnitude is at most `epsilon`.
    ///
    /// # Returns
    /// The amount of removed rows, or an error before reaching the store if `epsilon` is
    /// negative or this isn't a sparse table.
    pub async fn prune_small(&self, epsilon: f32) -> Result<usize> {
        let epsilon = checks::non_negative("epsilon", epsilon)?;
        self.sparse_ref()?;

        self.store
            .delete_where(&self.name, RowPredicate::Small { epsilon })
            .await
    }

    /// Removes the rows of a sparse table untouched for more than `max_age` versions.
    ///
    /// # Returns
    /// The amount of removed rows, or an error before reaching the store if `max_age` is
    /// zero or this isn't a sparse table.
    pub async fn prune_old(&self, max_age: u64) -> Result<usize> {
        if max_age == 0 {
            return Err(PsErr::invalid("max_age", max_age, "a positive integer"));
        }
        self.sparse_ref()?;

        self.store
            .delete_where(&self.name, RowPredicate::Old { max_age })
            .await
    }

    /// Clears the working set and writes the values of a sparse table into `dir`.
    pub async fn export(&mut self, dir: &Path) -> Result<()> {
        self.clear()?;
        self.store.export(&self.name, dir).await
    }
}

fn kind_err(name: &str, expected: &str) -> PsErr {
    PsErr::State(format!("tensor {name:?} is not {expected}"))
}

fn check_shape(what: &'static str, got: &[usize], expected: &[usize]) -> Result<()> {
    if got != expected {
        return Err(PsErr::SizeMismatch {
            what,
            got: got.iter().product(),
            expected: expected.iter().product(),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use ndarray::{ArrayD, IxDyn, array};
    use tempfile::tempdir;

    use super::*;
    use crate::{
        initialization::ConstInit,
        optimization::{Ema, Sgd},
        store::MemoryStore,
    };

    fn sgd() -> Arc<dyn Updater> {
        Arc::new(Sgd::new(1.0).unwrap())
    }

    fn one() -> Arc<dyn Initializer> {
        Arc::new(ConstInit::one())
    }

    fn embedding(store: &StoreHandle) -> DistributedTensor {
        DistributedTensor::sparse("emb", 2, 3, "user", store.clone(), one(), sgd()).unwrap()
    }

    #[test]
    fn names_are_validated() {
        let store = StoreHandle::in_memory();
        let err = DistributedTensor::dense("fc..w", &[2], DenseRole::Parameter, store, one(), sgd())
            .unwrap_err();
        assert!(matches!(err, PsErr::InvalidName { .. }));
    }

    #[tokio::test]
    async fn dense_parameter_lifecycle() {
        let store = StoreHandle::in_memory();
        let mut w = DistributedTensor::dense("fc.weight", &[2, 2], DenseRole::Parameter, store, one(), sgd())
            .unwrap();

        w.init().await.unwrap();
        w.pull().await.unwrap();
        assert!(w.value().unwrap().iter().all(|&v| v == 1.0));

        w.push(false, true).await.unwrap();
        w.pull().await.unwrap();
        assert!(w.value().unwrap().iter().all(|&v| v == 1.0));

        let grad = ArrayD::from_elem(IxDyn(&[2, 2]), 0.25);
        w.accumulate_grad(grad.view()).unwrap();
        w.accumulate_grad(grad.view()).unwrap();
        w.push(false, true).await.unwrap();
        w.zero_grad();
        assert!(w.grad().unwrap().is_none());

        w.pull().await.unwrap();
        assert!(w.value().unwrap().iter().all(|&v| v == 0.5));
    }

    #[tokio::test]
    async fn buffers_push_their_value_through_the_updater() {
        let store = StoreHandle::in_memory();
        let mut mean = DistributedTensor::dense(
            "bn.running_mean",
            &[1],
            DenseRole::Buffer,
            store,
            Arc::new(ConstInit::new(2.0)),
            Arc::new(Ema::default()),
        )
        .unwrap();

        mean.init().await.unwrap();
        mean.set_value(ArrayD::from_elem(IxDyn(&[1]), 4.0).view()).unwrap();
        mean.push(false, true).await.unwrap();
        mean.pull().await.unwrap();

        let value = mean.value().unwrap().sum();
        assert!((value - 2.2).abs() < 1e-6);
    }

    #[tokio::test]
    async fn sparse_push_carries_only_the_working_set() {
        let store = StoreHandle::in_memory();
        let mut emb = embedding(&store);
        emb.init().await.unwrap();

        emb.set_working_set(IndexBatch::from_keys(&[4, 8, 4])).unwrap();
        emb.pull().await.unwrap();
        assert_eq!(emb.embed().unwrap().nrows(), 3);

        let grads = array![[0.25f32, 0.25], [1.0, 1.0], [0.25, 0.25]];
        emb.accumulate_sparse_grad(grads.view()).unwrap();
        assert_eq!(emb.sparse_grad().unwrap().unwrap(), array![[0.5f32, 0.5], [1.0, 1.0]]);

        emb.push(false, true).await.unwrap();
        emb.pull().await.unwrap();
        assert_eq!(emb.rows().unwrap(), array![[0.5f32, 0.5], [0.0, 0.0]]);

        emb.set_working_set(IndexBatch::from_keys(&[15])).unwrap();
        emb.pull().await.unwrap();
        assert_eq!(emb.rows().unwrap(), array![[1f32, 1.]]);
    }

    #[tokio::test]
    async fn invalid_prune_arguments_fail_before_the_store() {
        let store = StoreHandle::in_memory();
        // Never initialized, so reaching the store would fail with UnknownTensor.
        let emb = embedding(&store);

        let err = emb.prune_small(-1e-3).await.unwrap_err();
        assert!(matches!(err, PsErr::InvalidArgument { what: "epsilon", .. }));

        let err = emb.prune_old(0).await.unwrap_err();
        assert!(matches!(err, PsErr::InvalidArgument { what: "max_age", .. }));

        let err = emb.prune_old(3).await.unwrap_err();
        assert!(matches!(err, PsErr::UnknownTensor { .. }));
    }

    #[tokio::test]
    async fn sparse_only_operations_reject_dense_tensors() {
        let store = StoreHandle::in_memory();
        let mut w = DistributedTensor::dense("w", &[3], DenseRole::Parameter, store, one(), sgd()).unwrap();

        assert!(matches!(w.clear(), Err(PsErr::State(_))));
        assert!(matches!(w.prune_small(0.).await, Err(PsErr::State(_))));
        assert!(w.accumulate_sparse_grad(array![[1f32]].view()).is_err());
    }

    /// Pushes a zero gradient for `keys`, only advancing their ages.
    async fn touch(emb: &mut DistributedTensor, keys: &[u64]) {
        emb.set_working_set(IndexBatch::from_keys(keys)).unwrap();
        emb.push(false, false).await.unwrap();
    }

    async fn restored(dir: &Path, keep_meta: bool) -> (Arc<MemoryStore>, DistributedTensor) {
        let store = Arc::new(MemoryStore::new());
        let emb = embedding(&StoreHandle::shared(Arc::clone(&store)));
        emb.init().await.unwrap();
        emb.load(dir, keep_meta).await.unwrap();
        (store, emb)
    }

    #[tokio::test]
    async fn sparse_round_trip_keeps_values_and_ages() {
        let dir = tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let mut emb = embedding(&StoreHandle::shared(Arc::clone(&store)));
        emb.init().await.unwrap();

        emb.set_working_set(IndexBatch::from_keys(&[1, 2, 3])).unwrap();
        emb.pull().await.unwrap();
        emb.accumulate_sparse_grad(array![[0.1f32, 0.2], [0.3, 0.4], [0.5, 0.6]].view())
            .unwrap();
        emb.push(false, true).await.unwrap();
        touch(&mut emb, &[1]).await;

        let before = store.sparse_snapshot("emb").unwrap();
        assert_eq!(before.version, 2);
        emb.save(dir.path()).await.unwrap();

        let (kept, mut emb) = restored(dir.path(), true).await;
        assert_eq!(kept.sparse_snapshot("emb").unwrap(), before);

        // Keys 2 and 3 were last touched two versions ago.
        touch(&mut emb, &[1]).await;
        assert_eq!(emb.prune_old(1).await.unwrap(), 2);

        let (reset, mut emb) = restored(dir.path(), false).await;
        let record = reset.sparse_snapshot("emb").unwrap();
        assert_eq!(record.version, 0);
        assert!(record.rows.iter().all(|(_, row)| row.last_touched == 0));
        assert_eq!(
            record.rows.iter().map(|(_, row)| &row.values).collect::<Vec<_>>(),
            before.rows.iter().map(|(_, row)| &row.values).collect::<Vec<_>>()
        );

        touch(&mut emb, &[1]).await;
        assert_eq!(emb.prune_old(1).await.unwrap(), 0);
    }
}
