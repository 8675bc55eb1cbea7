mod adagrad;
mod adam;
mod ema;
mod ftrl;
mod sgd;
mod updater;

pub use adagrad::AdaGrad;
pub use adam::Adam;
pub use ema::Ema;
pub use ftrl::Ftrl;
pub use sgd::Sgd;
pub use updater::Updater;
