#![allow(dead_code)]

use std::sync::Arc;

use orchestra_ps::{
    Defaults, Module, Result,
    initialization::ConstInit,
    model::{EmbeddingDecl, ModuleDecl, ModuleKind, TensorDecl},
    optimization::Sgd,
};

/// A graph declared piece by piece.
#[derive(Debug, Clone, Default)]
pub struct TestModule {
    pub parameters: Vec<TensorDecl>,
    pub modules: Vec<ModuleDecl>,
    pub training: bool,
}

impl TestModule {
    pub fn new() -> Self {
        Self {
            training: true,
            ..Default::default()
        }
    }

    pub fn dense(mut self, name: &str, shape: &[usize]) -> Self {
        self.parameters.push(TensorDecl::new(name, shape));
        self
    }

    pub fn embedding(mut self, name: &str, width: usize, input: &str) -> Self {
        self.modules.push(ModuleDecl::new(
            name,
            ModuleKind::Embedding(EmbeddingDecl::new(width, input)),
        ));
        self
    }

    pub fn module(mut self, name: &str, kind: ModuleKind) -> Self {
        self.modules.push(ModuleDecl::new(name, kind));
        self
    }
}

impl Module for TestModule {
    fn parameters(&self) -> Vec<TensorDecl> {
        self.parameters.clone()
    }

    fn modules(&self) -> Vec<ModuleDecl> {
        self.modules.clone()
    }

    fn is_training(&self) -> bool {
        self.training
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn serialize(&self, meta: &str) -> Result<Vec<u8>> {
        Ok(meta.as_bytes().to_vec())
    }
}

/// Tensors start at one and move by exactly their gradient.
pub fn unit_defaults(partition_count: usize) -> Defaults {
    Defaults {
        initializer: Arc::new(ConstInit::one()),
        updater: Arc::new(Sgd::new(1.).unwrap()),
        partition_count,
    }
}
