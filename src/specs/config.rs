use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::fs;

use super::{InitializerSpec, UpdaterSpec};
use crate::error::Result;

/// The specification of a wrapped model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default)]
    pub experiment_name: Option<String>,
    #[serde(default)]
    pub model_version: Option<String>,
    /// The updater of tensors that don't declare their own.
    pub updater: UpdaterSpec,
    /// The initializer of tensors that don't declare their own.
    #[serde(default)]
    pub initializer: InitializerSpec,
    #[serde(default)]
    pub seed: Option<u64>,
    /// The partition count of embedding tables that don't declare their own.
    #[serde(default = "default_partition_count")]
    pub partition_count: usize,
}

fn default_partition_count() -> usize {
    8
}

impl ModelConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Reads a JSON config file.
    pub async fn load(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path).await?;
        Self::from_json(&json)
    }
}
