mod distributed;
mod index_batch;

pub use distributed::{DenseRole, DistributedTensor, TensorKind};
pub use index_batch::{IndexBatch, IndexBatchManager, SparseBatch};
