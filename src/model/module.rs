use std::{any, sync::Arc};

use crate::{error::Result, initialization::Initializer, optimization::Updater};

/// A dense tensor owned by the computation graph.
///
/// Strategies left unset are assigned by the registry when the model is wrapped.
#[derive(Debug, Clone)]
pub struct TensorDecl {
    pub name: String,
    pub shape: Vec<usize>,
    pub initializer: Option<Arc<dyn Initializer>>,
    pub updater: Option<Arc<dyn Updater>>,
}

impl TensorDecl {
    pub fn new(name: impl Into<String>, shape: &[usize]) -> Self {
        Self {
            name: name.into(),
            shape: shape.to_vec(),
            initializer: None,
            updater: None,
        }
    }

    pub fn with_initializer(mut self, initializer: Arc<dyn Initializer>) -> Self {
        self.initializer = Some(initializer);
        self
    }

    pub fn with_updater(mut self, updater: Arc<dyn Updater>) -> Self {
        self.updater = Some(updater);
        self
    }
}

/// An embedding operator, backed by a sparse table named after the module.
#[derive(Debug, Clone)]
pub struct EmbeddingDecl {
    pub width: usize,
    /// The sparse input column the operator reads its keys from.
    pub input: String,
    pub partition_count: Option<usize>,
    pub initializer: Option<Arc<dyn Initializer>>,
    pub updater: Option<Arc<dyn Updater>>,
}

impl EmbeddingDecl {
    pub fn new(width: usize, input: impl Into<String>) -> Self {
        Self {
            width,
            input: input.into(),
            partition_count: None,
            initializer: None,
            updater: None,
        }
    }

    pub fn with_partition_count(mut self, partition_count: usize) -> Self {
        self.partition_count = Some(partition_count);
        self
    }

    pub fn with_initializer(mut self, initializer: Arc<dyn Initializer>) -> Self {
        self.initializer = Some(initializer);
        self
    }

    pub fn with_updater(mut self, updater: Arc<dyn Updater>) -> Self {
        self.updater = Some(updater);
        self
    }
}

/// The kinds of sub-modules the registry treats specially.
#[derive(Debug, Clone)]
pub enum ModuleKind {
    /// Batch normalization, its affine `weight` and `bias` are listed among the parameters.
    BatchNorm {
        running_mean: Option<TensorDecl>,
        running_var: Option<TensorDecl>,
    },
    /// Cross-replica batch normalization, it can't be driven through independent tensors.
    SyncBatchNorm,
    Embedding(EmbeddingDecl),
    Other,
}

/// A named sub-module of the computation graph.
#[derive(Debug, Clone)]
pub struct ModuleDecl {
    pub name: String,
    pub kind: ModuleKind,
}

impl ModuleDecl {
    pub fn new(name: impl Into<String>, kind: ModuleKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// The computation graph a model wraps.
///
/// The forward and backward computations stay with the graph, the registry only reads
/// which tensors it owns, once, and toggles its mode.
pub trait Module: Send + Sync {
    /// A fully qualified identifier of the graph's type.
    fn class_name(&self) -> String {
        any::type_name::<Self>().to_string()
    }

    /// Every trainable dense parameter, batch normalization weights and biases included.
    fn parameters(&self) -> Vec<TensorDecl>;

    /// Every sub-module, the plain ones may be omitted.
    fn modules(&self) -> Vec<ModuleDecl>;

    fn is_training(&self) -> bool;

    fn set_training(&mut self, training: bool);

    /// Serializes the graph with the export metadata embedded.
    ///
    /// # Arguments
    /// * `meta` - The JSON metadata document of the export.
    fn serialize(&self, meta: &str) -> Result<Vec<u8>>;
}
