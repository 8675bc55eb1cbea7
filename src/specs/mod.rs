mod builder;
mod config;
mod initializer;
mod updater;

pub use builder::StrategyBuilder;
pub use config::ModelConfig;
pub use initializer::InitializerSpec;
pub use updater::UpdaterSpec;
