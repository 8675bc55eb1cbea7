mod constant;
mod initializer;
mod random;
mod xavier;

pub use constant::ConstInit;
pub use initializer::{Initializer, SharedRng, shared_rng};
pub use random::NormalInit;
pub use xavier::{Activation, XavierDistribution, XavierInit, fans};
