mod checkpoint;
mod dense;
mod handle;
mod memory;
mod remote;
mod sparse;

pub use checkpoint::{DenseRecord, ExportedPartition, SparseRecord, SparseRow, partition_path, read_record};
pub use handle::StoreHandle;
pub use memory::MemoryStore;
pub use remote::{RemoteStore, RowPredicate};
