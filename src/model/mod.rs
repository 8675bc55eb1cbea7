mod export;
mod model;
mod module;
mod registry;

pub use export::{
    ExportMeta, META_VERSION, MODEL_EXTENSION, SparseTensorEntry, default_model_version,
    resolve_export_path, with_suffix,
};
pub use model::Model;
pub use module::{EmbeddingDecl, Module, ModuleDecl, ModuleKind, TensorDecl};
pub use registry::{Defaults, Registry};
