use std::{
    ffi::OsString,
    path::{Path, PathBuf},
};

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{PsErr, Result};

/// The version of the metadata document layout.
pub const META_VERSION: u32 = 1;

/// The extension of an exported graph.
pub const MODEL_EXTENSION: &str = "ptm";

/// An entry of the sparse manifest of an export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SparseTensorEntry {
    pub name: String,
    pub data_dir: String,
    pub partition_count: usize,
}

/// The JSON document written next to an exported graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportMeta {
    pub meta_version: u32,
    pub agent_class: String,
    pub model_class: String,
    pub model_version: String,
    pub module_class: String,
    pub module_file: String,
    pub experiment_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sparse_data_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sparse_tensors: Option<Vec<SparseTensorEntry>>,
}

impl ExportMeta {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Resolves where an export is written.
///
/// Paths ending in `.ptm` are kept, paths ending in `/` or without an extension are taken
/// as directories holding `<experiment_name>.ptm`.
///
/// # Arguments
/// * `path` - The requested path.
/// * `experiment_name` - The name of the experiment being exported.
///
/// # Returns
/// The path of the exported graph or an error if `path` is empty or has another extension.
pub fn resolve_export_path(path: &str, experiment_name: &str) -> Result<PathBuf> {
    let path = path.trim();
    let file_name = format!("{experiment_name}.{MODEL_EXTENSION}");

    if path.is_empty() {
        return Err(PsErr::invalid("path", "\"\"", "a non-empty path"));
    }

    if path.ends_with(&format!(".{MODEL_EXTENSION}")) {
        return Ok(PathBuf::from(path));
    }

    if path.ends_with('/') {
        return Ok(PathBuf::from(format!("{path}{file_name}")));
    }

    if Path::new(path).extension().is_none() {
        return Ok(Path::new(path).join(file_name));
    }

    Err(PsErr::invalid(
        "path",
        format!("{path:?}"),
        "a file path ending with .ptm or a directory path",
    ))
}

/// Appends `suffix` to the file name of `path`, `model.ptm` becoming `model.ptm.json`.
pub fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut path: OsString = path.as_os_str().to_owned();
    path.push(suffix);
    PathBuf::from(path)
}

/// The model version used when none is set, the current hour at UTC+8 as `%Y%m%d%H`.
pub fn default_model_version() -> String {
    (Utc::now() + Duration::hours(8))
        .format("%Y%m%d%H")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn export_paths() {
        assert_eq!(
            resolve_export_path(" out/ctr.ptm ", "exp").unwrap(),
            PathBuf::from("out/ctr.ptm")
        );
        assert_eq!(
            resolve_export_path("out/", "exp").unwrap(),
            PathBuf::from("out/exp.ptm")
        );
        assert_eq!(
            resolve_export_path("out/models", "exp").unwrap(),
            PathBuf::from("out/models/exp.ptm")
        );
        assert!(resolve_export_path("out/model.onnx", "exp").is_err());
        assert!(resolve_export_path("  ", "exp").is_err());
    }

    #[test]
    fn sibling_files() {
        let path = Path::new("out/exp.ptm");
        assert_eq!(with_suffix(path, ".json"), PathBuf::from("out/exp.ptm.json"));
        assert_eq!(with_suffix(path, ".msd"), PathBuf::from("out/exp.ptm.msd"));
    }

    #[test]
    fn model_version_is_hour_granular() {
        let version = default_model_version();
        assert_eq!(version.len(), 10);
        assert!(version.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn dense_metadata_omits_the_sparse_manifest() {
        let meta = ExportMeta {
            meta_version: META_VERSION,
            agent_class: "a".into(),
            model_class: "m".into(),
            model_version: "2024010100".into(),
            module_class: "g".into(),
            module_file: "exp.ptm".into(),
            experiment_name: "exp".into(),
            sparse_data_dir: None,
            sparse_tensors: None,
        };

        let json = meta.to_json().unwrap();
        assert!(!json.contains("sparse"));
        assert_eq!(serde_json::from_str::<ExportMeta>(&json).unwrap(), meta);
    }
}
