use std::{collections::HashMap, path::Path, sync::Arc};

use futures::future;
use log::debug;

use super::{EmbeddingDecl, Module, ModuleKind, TensorDecl};
use crate::{
    error::{PsErr, Result},
    initialization::{ConstInit, Initializer},
    optimization::{Ema, Updater},
    store::StoreHandle,
    tensor::{DenseRole, DistributedTensor, IndexBatchManager, SparseBatch},
};

/// The strategies given to tensors that don't declare their own.
#[derive(Debug, Clone)]
pub struct Defaults {
    pub initializer: Arc<dyn Initializer>,
    pub updater: Arc<dyn Updater>,
    pub partition_count: usize,
}

/// Every tensor of a wrapped graph, in discovery order.
///
/// Embedding tables come first, then dense parameters, then batch normalization buffers.
/// Collective operations fan out one request per tensor and join them, the first failure
/// aborts the join and is reported as a failure of the whole phase.
#[derive(Debug)]
pub struct Registry {
    tensors: Vec<DistributedTensor>,
    positions: HashMap<String, usize>,
    batches: IndexBatchManager,
}

impl Registry {
    /// Walks `module` once and builds its registry.
    ///
    /// # Arguments
    /// * `module` - The computation graph.
    /// * `store` - The store every tensor synchronizes against.
    /// * `defaults` - The strategies of tensors without their own.
    ///
    /// # Returns
    /// A new `Registry` or a configuration error if the graph contains a cross-replica batch
    /// normalization, a batch normalization with a single running statistic, an invalid name
    /// or the same name twice.
    pub fn discover<M: Module + ?Sized>(
        module: &M,
        store: &StoreHandle,
        defaults: &Defaults,
    ) -> Result<Self> {
        let mut registry = Self {
            tensors: Vec::new(),
            positions: HashMap::new(),
            batches: IndexBatchManager::new(),
        };

        let modules = module.modules();
        let mut parameters = module.parameters();
        let mut buffers = Vec::new();

        for decl in &modules {
            match &decl.kind {
                ModuleKind::SyncBatchNorm => {
                    return Err(PsErr::UnsupportedModule {
                        name: decl.name.clone(),
                        reason: "cross-replica batch normalization can't be decomposed into \
                                 independent tensor updates"
                            .to_string(),
                    });
                }
                ModuleKind::BatchNorm {
                    running_mean,
                    running_var,
                } => {
                    let (mean, var) = match (running_mean, running_var) {
                        (Some(mean), Some(var)) => (mean, var),
                        (None, None) => continue,
                        _ => {
                            return Err(PsErr::UnsupportedModule {
                                name: decl.name.clone(),
                                reason: "running_mean and running_var must be both set or \
                                         both unset"
                                    .to_string(),
                            });
                        }
                    };

                    buffers.push(with_defaults(mean.clone(), ConstInit::zero()));
                    buffers.push(with_defaults(var.clone(), ConstInit::one()));
                    affine_defaults(&mut parameters, &decl.name);
                }
                ModuleKind::Embedding(embedding) => {
                    registry.insert_embedding(&decl.name, embedding, store, defaults)?;
                }
                ModuleKind::Other => {}
            }
        }

        for decl in parameters {
            let tensor = DistributedTensor::dense(
                &decl.name,
                &decl.shape,
                DenseRole::Parameter,
                store.clone(),
                decl.initializer.unwrap_or_else(|| Arc::clone(&defaults.initializer)),
                decl.updater.unwrap_or_else(|| Arc::clone(&defaults.updater)),
            )?;
            registry.insert(tensor)?;
        }

        for decl in buffers {
            let tensor = DistributedTensor::dense(
                &decl.name,
                &decl.shape,
                DenseRole::Buffer,
                store.clone(),
                decl.initializer.unwrap_or_else(|| Arc::clone(&defaults.initializer)),
                decl.updater.unwrap_or_else(|| Arc::new(Ema::default())),
            )?;
            registry.insert(tensor)?;
        }

        debug!(
            tensors = registry.len(), sparse = registry.sparse_count();
            "discovered the tensors of {}", module.class_name()
        );

        Ok(registry)
    }

    fn insert_embedding(
        &mut self,
        name: &str,
        decl: &EmbeddingDecl,
        store: &StoreHandle,
        defaults: &Defaults,
    ) -> Result<()> {
        let tensor = DistributedTensor::sparse(
            name,
            decl.width,
            decl.partition_count.unwrap_or(defaults.partition_count),
            &decl.input,
            store.clone(),
            decl.initializer
                .clone()
                .unwrap_or_else(|| Arc::clone(&defaults.initializer)),
            decl.updater
                .clone()
                .unwrap_or_else(|| Arc::clone(&defaults.updater)),
        )?;

        self.batches.register(&decl.input);
        self.insert(tensor)
    }

    fn insert(&mut self, tensor: DistributedTensor) -> Result<()> {
        if self.positions.contains_key(tensor.name()) {
            return Err(PsErr::DuplicateTensor {
                name: tensor.name().to_string(),
            });
        }

        self.positions
            .insert(tensor.name().to_string(), self.tensors.len());
        self.tensors.push(tensor);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// The amount of embedding tables.
    pub fn sparse_count(&self) -> usize {
        self.tensors.iter().filter(|t| t.is_sparse()).count()
    }

    pub fn get(&self, name: &str) -> Option<&DistributedTensor> {
        self.positions.get(name).map(|&i| &self.tensors[i])
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut DistributedTensor> {
        self.positions.get(name).map(|&i| &mut self.tensors[i])
    }

    /// Like `get_mut`, but failing with an `UnknownTensor` error.
    pub fn tensor_mut(&mut self, name: &str) -> Result<&mut DistributedTensor> {
        self.get_mut(name).ok_or_else(|| PsErr::UnknownTensor {
            name: name.to_string(),
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &DistributedTensor> {
        self.tensors.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut DistributedTensor> {
        self.tensors.iter_mut()
    }

    /// The embedding tables, in discovery order.
    pub fn sparse(&self) -> impl Iterator<Item = &DistributedTensor> {
        self.tensors.iter().filter(|t| t.is_sparse())
    }

    pub fn batches(&self) -> &IndexBatchManager {
        &self.batches
    }

    /// Clears the index batches and builds the working set of every embedding table.
    ///
    /// # Arguments
    /// * `batch` - The raw keys of the new batch, one column per sparse input.
    pub fn combine(&mut self, batch: &SparseBatch) -> Result<()> {
        self.batches.clear();

        for tensor in self.tensors.iter_mut().filter(|t| t.is_sparse()) {
            let input = tensor.input()?.to_string();
            let index_batch = self.batches.combine(&input, batch)?.clone();
            tensor.set_working_set(index_batch)?;
        }

        Ok(())
    }

    /// Registers every tensor in the store unless it already exists there.
    pub async fn init_all(&self) -> Result<()> {
        future::try_join_all(self.tensors.iter().map(|t| t.init()))
            .await
            .map_err(|e| e.collective("init"))?;

        Ok(())
    }

    /// Pulls the authoritative values.
    ///
    /// # Arguments
    /// * `training` - Whether the graph is in training mode.
    /// * `force` - Pull dense tensors even in evaluation mode, where they are redundant.
    pub async fn pull_all(&mut self, training: bool, force: bool) -> Result<()> {
        let pulls = self
            .tensors
            .iter_mut()
            .filter(|t| force || training || t.is_sparse())
            .map(|t| t.pull());

        future::try_join_all(pulls)
            .await
            .map_err(|e| e.collective("pull"))?;

        Ok(())
    }

    /// Pushes every local gradient, or every local value.
    pub async fn push_all(&mut self, is_value: bool, skip_no_grad: bool) -> Result<()> {
        let pushes = self
            .tensors
            .iter_mut()
            .map(|t| t.push(is_value, skip_no_grad));

        future::try_join_all(pushes)
            .await
            .map_err(|e| e.collective("push"))?;

        Ok(())
    }

    pub fn zero_grad_all(&mut self) {
        self.tensors.iter_mut().for_each(|t| t.zero_grad());
    }

    /// Drops the working set of every embedding table.
    pub fn clear_all(&mut self) -> Result<()> {
        self.batches.clear();

        self.tensors
            .iter_mut()
            .filter(|t| t.is_sparse())
            .try_for_each(|t| t.clear())
    }

    pub async fn save_all(&self, dir: &Path) -> Result<()> {
        future::try_join_all(self.tensors.iter().map(|t| t.save(dir)))
            .await
            .map_err(|e| e.collective("save"))?;

        Ok(())
    }

    pub async fn load_all(&self, dir: &Path, keep_meta: bool) -> Result<()> {
        future::try_join_all(self.tensors.iter().map(|t| t.load(dir, keep_meta)))
            .await
            .map_err(|e| e.collective("load"))?;

        Ok(())
    }

    /// Prunes the small rows of every embedding table.
    ///
    /// # Returns
    /// The total amount of removed rows.
    pub async fn prune_small_all(&self, epsilon: f32) -> Result<usize> {
        let removed = future::try_join_all(self.sparse().map(|t| t.prune_small(epsilon)))
            .await
            .map_err(|e| e.collective("prune_small"))?;

        Ok(removed.into_iter().sum())
    }

    /// Prunes the old rows of every embedding table.
    ///
    /// # Returns
    /// The total amount of removed rows.
    pub async fn prune_old_all(&self, max_age: u64) -> Result<usize> {
        let removed = future::try_join_all(self.sparse().map(|t| t.prune_old(max_age)))
            .await
            .map_err(|e| e.collective("prune_old"))?;

        Ok(removed.into_iter().sum())
    }

    /// Exports every embedding table into `<data_dir>/<name>.msm`.
    pub async fn export_sparse(&mut self, data_dir: &Path) -> Result<()> {
        let exports = self
            .tensors
            .iter_mut()
            .filter(|t| t.is_sparse())
            .map(|t| {
                let dir = data_dir.join(format!("{}.msm", t.name()));
                async move { t.export(&dir).await }
            });

        future::try_join_all(exports)
            .await
            .map_err(|e| e.collective("export"))?;

        Ok(())
    }
}

fn with_defaults(mut decl: TensorDecl, initializer: ConstInit) -> TensorDecl {
    if decl.initializer.is_none() {
        decl.initializer = Some(Arc::new(initializer));
    }

    if decl.updater.is_none() {
        decl.updater = Some(Arc::new(Ema::default()));
    }

    decl
}

/// Starts the affine weight of a batch normalization at one and its bias at zero.
fn affine_defaults(parameters: &mut [TensorDecl], module: &str) {
    let weight = format!("{module}.weight");
    let bias = format!("{module}.bias");

    for decl in parameters.iter_mut().filter(|d| d.initializer.is_none()) {
        if decl.name == weight {
            decl.initializer = Some(Arc::new(ConstInit::one()));
        } else if decl.name == bias {
            decl.initializer = Some(Arc::new(ConstInit::zero()));
        }
    }
}
