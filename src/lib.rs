pub mod checks;
pub mod coordination;
pub mod error;
pub mod initialization;
pub mod model;
pub mod names;
pub mod optimization;
pub mod shape;
pub mod specs;
pub mod store;
pub mod tensor;

pub use coordination::{Agent, BarrierAgent};
pub use error::{PsErr, Result};
pub use model::{Defaults, Model, Module};
pub use specs::{ModelConfig, StrategyBuilder};
pub use store::{MemoryStore, RemoteStore, StoreHandle};
pub use tensor::{DistributedTensor, SparseBatch};
