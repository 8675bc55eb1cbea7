use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::fs;

use crate::error::Result;

/// Everything needed to restore a dense tensor bit for bit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenseRecord {
    pub shape: Vec<usize>,
    pub values: Vec<f32>,
    pub state: Option<Vec<f32>>,
}

/// A single row of a sparse table, as kept in memory and in checkpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SparseRow {
    pub values: Vec<f32>,
    pub state: Vec<f32>,
    pub last_touched: u64,
}

/// Everything needed to restore a sparse table, rows sorted by key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SparseRecord {
    pub width: usize,
    pub version: u64,
    pub rows: Vec<(u64, SparseRow)>,
}

/// The values of one exported partition, rows sorted by key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportedPartition {
    pub width: usize,
    pub rows: Vec<(u64, Vec<f32>)>,
}

/// The file a tensor is checkpointed to inside `dir`.
pub fn checkpoint_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.ckpt"))
}

/// The file a partition of an exported table is written to inside `dir`.
pub fn partition_path(dir: &Path, partition: usize) -> PathBuf {
    dir.join(format!("part-{partition:05}.bin"))
}

/// Encodes `record` with bincode and writes it to `path`, creating its parent directories.
pub async fn write_record<T: Serialize>(path: &Path, record: &T) -> Result<()> {
    let bytes = bincode::serialize(record)?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    fs::write(path, bytes).await?;
    Ok(())
}

/// Reads and decodes a bincode record from `path`.
pub async fn read_record<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = fs::read(path).await?;
    Ok(bincode::deserialize(&bytes)?)
}
