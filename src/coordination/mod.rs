mod agent;
mod barrier;

pub use agent::{Agent, LocalAgent};
pub use barrier::BarrierAgent;
