use std::{
    any,
    path::{Path, PathBuf},
};

use log::{info, warn};
use tokio::fs;

use super::{
    Defaults, Module, Registry,
    export::{self, ExportMeta, META_VERSION, SparseTensorEntry},
};
use crate::{
    checks,
    coordination::Agent,
    error::{PsErr, Result},
    names,
    store::StoreHandle,
    tensor::SparseBatch,
};

/// Wraps a computation graph so every tensor it owns is kept in the store.
///
/// Collective phases must be entered by every rank of the agent's group, in the same order,
/// they rendezvous at barriers and rank 0 alone performs single-writer work.
pub struct Model<A, M> {
    agent: A,
    module: M,
    store: StoreHandle,
    registry: Registry,
    experiment_name: Option<String>,
    model_version: Option<String>,
}

impl<A: Agent, M: Module> Model<A, M> {
    /// Creates a new `Model` and discovers the tensors of `module`.
    ///
    /// # Arguments
    /// * `agent` - This worker's view of the group.
    /// * `module` - The computation graph.
    /// * `store` - The authoritative store.
    /// * `defaults` - The strategies of tensors without their own.
    ///
    /// # Returns
    /// A new `Model` or a configuration error from the discovery.
    pub fn new(agent: A, module: M, store: StoreHandle, defaults: &Defaults) -> Result<Self> {
        let registry = Registry::discover(&module, &store, defaults)?;

        Ok(Self {
            agent,
            module,
            store,
            registry,
            experiment_name: None,
            model_version: None,
        })
    }

    pub fn agent(&self) -> &A {
        &self.agent
    }

    pub fn module(&self) -> &M {
        &self.module
    }

    pub fn module_mut(&mut self) -> &mut M {
        &mut self.module
    }

    pub fn store(&self) -> &StoreHandle {
        &self.store
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    pub fn experiment_name(&self) -> Option<&str> {
        self.experiment_name.as_deref()
    }

    /// Sets the experiment name, only once.
    ///
    /// # Arguments
    /// * `name` - A valid qualified name, surrounding whitespace is ignored.
    ///
    /// # Returns
    /// An `InvalidName` error, or a state error if the name was already set.
    pub fn set_experiment_name(&mut self, name: &str) -> Result<()> {
        let name = names::checked_qualified_name(name)?;

        if let Some(current) = &self.experiment_name {
            return Err(PsErr::State(format!(
                "can not reset experiment_name {current:?} to {name:?}"
            )));
        }

        self.experiment_name = Some(name);
        Ok(())
    }

    pub fn model_version(&self) -> Option<&str> {
        self.model_version.as_deref()
    }

    /// Sets the model version, only once.
    ///
    /// # Returns
    /// A state error if the version was already set.
    pub fn set_model_version(&mut self, version: &str) -> Result<()> {
        let version = version.trim().to_string();

        if let Some(current) = &self.model_version {
            return Err(PsErr::State(format!(
                "can not reset model_version {current:?} to {version:?}"
            )));
        }

        self.model_version = Some(version);
        Ok(())
    }

    pub fn is_training(&self) -> bool {
        self.module.is_training()
    }

    pub fn train(&mut self) {
        if !self.is_training() {
            self.module.set_training(true);
        }
    }

    pub fn eval(&mut self) {
        if self.is_training() {
            self.module.set_training(false);
        }
    }

    fn is_leader(&self) -> bool {
        self.agent.rank() == 0
    }

    /// Registers every tensor in the store, then fetches their values.
    pub async fn initialize(&mut self) -> Result<()> {
        info!(rank = self.agent.rank(); "initializing {} tensors", self.registry.len());

        self.agent.barrier().await;
        let created = self.registry.init_all().await;
        self.agent.barrier().await;
        created?;

        self.registry.pull_all(self.is_training(), true).await
    }

    /// Runs a forward pass over a batch.
    ///
    /// The working sets of the embedding tables are rebuilt from `batch`, then the tensors
    /// are pulled, dense ones only in training mode, and `forward` runs over the graph.
    ///
    /// # Arguments
    /// * `batch` - The raw keys of every sparse input, empty for dense models.
    /// * `forward` - The computation, it reads the pulled values and accumulates gradients.
    ///
    /// # Returns
    /// Whatever `forward` returns, or the failure of the combine or pull steps.
    pub async fn call<F, R>(&mut self, batch: &SparseBatch, forward: F) -> Result<R>
    where
        F: FnOnce(&mut M, &mut Registry) -> R,
    {
        self.registry.combine(batch)?;
        self.registry.pull_all(self.is_training(), false).await?;
        Ok(forward(&mut self.module, &mut self.registry))
    }

    /// Pushes the local gradients, or the local values, of every tensor.
    ///
    /// # Arguments
    /// * `is_value` - Overwrite the authoritative values instead of updating them.
    /// * `skip_no_grad` - Don't push tensors without a local gradient.
    pub async fn push(&mut self, is_value: bool, skip_no_grad: bool) -> Result<()> {
        self.registry.push_all(is_value, skip_no_grad).await
    }

    /// Drops every local gradient.
    pub fn zero_grad(&mut self) {
        self.registry.zero_grad_all();
    }

    /// Materializes a consistent snapshot of every tensor on every rank.
    pub async fn sync(&mut self) -> Result<()> {
        info!(rank = self.agent.rank(); "syncing");

        self.agent.barrier().await;
        let pulled = self.registry.pull_all(self.is_training(), true).await;
        self.agent.barrier().await;
        pulled
    }

    /// Exports the graph, its metadata and its embedding tables.
    ///
    /// # Arguments
    /// * `path` - A `.ptm` file, or a directory to write `<experiment_name>.ptm` into.
    ///
    /// # Returns
    /// The path of the exported graph, or an error before any I/O if the experiment name is
    /// unset, the path is malformed or the model is still in training mode.
    pub async fn export(&mut self, path: &str) -> Result<PathBuf> {
        let Some(experiment_name) = self.experiment_name.clone() else {
            return Err(PsErr::State(format!(
                "experiment_name is not set; can not export to {:?}",
                path.trim()
            )));
        };

        let path = export::resolve_export_path(path, &experiment_name)?;

        if self.is_training() {
            return Err(PsErr::State(
                "model is in training mode, can not export it; call eval to set it in \
                 evaluation mode explicitly"
                    .to_string(),
            ));
        }

        self.agent.barrier().await;
        let outcome = match self.registry.pull_all(false, true).await {
            Ok(()) if self.is_leader() => self.write_export(&path, &experiment_name).await,
            other => other,
        };
        self.agent.barrier().await;
        outcome?;

        Ok(path)
    }

    /// Builds the metadata document of an export written to `path`.
    pub fn export_meta(&self, path: &Path, experiment_name: &str) -> Result<ExportMeta> {
        let module_file = file_name(path)?;

        let (sparse_data_dir, sparse_tensors) = if self.registry.sparse_count() > 0 {
            let tensors = self
                .registry
                .sparse()
                .map(|t| -> Result<SparseTensorEntry> {
                    Ok(SparseTensorEntry {
                        name: t.name().to_string(),
                        data_dir: format!("{}.msm", t.name()),
                        partition_count: self.store.partition_count(t.name())?,
                    })
                })
                .collect::<Result<Vec<_>>>()?;

            (Some(format!("{module_file}.msd")), Some(tensors))
        } else {
            (None, None)
        };

        Ok(ExportMeta {
            meta_version: META_VERSION,
            agent_class: any::type_name::<A>().to_string(),
            model_class: any::type_name::<Self>().to_string(),
            model_version: self
                .model_version
                .clone()
                .unwrap_or_else(export::default_model_version),
            module_class: self.module.class_name(),
            module_file,
            experiment_name: experiment_name.to_string(),
            sparse_data_dir,
            sparse_tensors,
        })
    }

    async fn write_export(&mut self, path: &Path, experiment_name: &str) -> Result<()> {
        let meta = self.export_meta(path, experiment_name)?.to_json()?;

        if self.registry.sparse_count() > 0 {
            let data_dir = export::with_suffix(path, ".msd");
            self.registry.export_sparse(&data_dir).await?;
        }

        let graph = self.module.serialize(&meta)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        fs::write(path, graph).await?;
        fs::write(export::with_suffix(path, ".json"), format!("{meta}\n")).await?;

        info!("exported {experiment_name} to {}", path.display());
        Ok(())
    }

    /// Removes the embedding rows whose largest magnitude is at most `epsilon`.
    ///
    /// # Returns
    /// An error before any barrier if `epsilon` is negative or the model has no embedding
    /// tables.
    pub async fn prune_small(&mut self, epsilon: f32) -> Result<()> {
        let epsilon = checks::non_negative("epsilon", epsilon)?;
        self.check_sparse("prune_small")?;

        self.agent.barrier().await;
        let outcome = if self.is_leader() {
            self.registry.prune_small_all(epsilon).await
        } else {
            Ok(0)
        };
        self.agent.barrier().await;

        let removed = outcome?;
        info!(rank = self.agent.rank(), removed = removed; "pruned rows with magnitude <= {epsilon}");
        Ok(())
    }

    /// Removes the embedding rows untouched for more than `max_age` versions.
    ///
    /// # Returns
    /// An error before any barrier if `max_age` is zero or the model has no embedding tables.
    pub async fn prune_old(&mut self, max_age: u64) -> Result<()> {
        if max_age == 0 {
            return Err(PsErr::invalid("max_age", max_age, "a positive integer"));
        }
        self.check_sparse("prune_old")?;

        self.agent.barrier().await;
        let outcome = if self.is_leader() {
            self.registry.prune_old_all(max_age).await
        } else {
            Ok(0)
        };
        self.agent.barrier().await;

        let removed = outcome?;
        info!(rank = self.agent.rank(), removed = removed; "pruned rows older than {max_age} versions");
        Ok(())
    }

    fn check_sparse(&self, phase: &str) -> Result<()> {
        if self.registry.sparse_count() == 0 {
            return Err(PsErr::State(format!(
                "{phase} needs embedding tables, the model has none"
            )));
        }

        Ok(())
    }

    /// Checkpoints every tensor into `dir`.
    pub async fn save(&mut self, dir: &Path) -> Result<()> {
        self.agent.barrier().await;
        let outcome = if self.is_leader() {
            self.registry.save_all(dir).await
        } else {
            Ok(())
        };
        self.agent.barrier().await;
        outcome?;

        info!(rank = self.agent.rank(); "saved checkpoint to {}", dir.display());
        Ok(())
    }

    /// Restores every tensor from a checkpoint in `dir`, then fetches their values.
    ///
    /// # Arguments
    /// * `dir` - The checkpoint directory.
    /// * `keep_meta` - Whether the embedding tables keep their row ages.
    pub async fn load(&mut self, dir: &Path, keep_meta: bool) -> Result<()> {
        self.agent.barrier().await;
        let outcome = if self.is_leader() {
            self.registry.load_all(dir, keep_meta).await
        } else {
            Ok(())
        };
        self.agent.barrier().await;

        if let Err(e) = outcome {
            warn!(rank = self.agent.rank(); "checkpoint {} couldn't be loaded", dir.display());
            return Err(e);
        }

        self.registry.pull_all(self.is_training(), true).await
    }
}

fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| PsErr::invalid("path", path.display(), "a path naming a file"))
}
