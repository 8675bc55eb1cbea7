use std::{fmt, sync::Arc};

use ndarray::{ArrayViewMut2, ArrayViewMutD};
use parking_lot::Mutex;
use rand::{SeedableRng, rngs::StdRng};

use crate::error::Result;

/// A random number generator shared between initializers, cloning it doesn't fork the stream.
pub type SharedRng = Arc<Mutex<StdRng>>;

/// Creates a new `SharedRng` given (or not) a seed.
///
/// # Arguments
/// * `seed` - An optional seed for the rng.
///
/// # Returns
/// A clonable random number generator with interior mutability.
pub fn shared_rng(seed: Option<u64>) -> SharedRng {
    let rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    };

    Arc::new(Mutex::new(rng))
}

/// Generates the first values of a tensor.
///
/// The store calls it once per dense tensor when it's created and once per sparse key the
/// first time the key is observed, always before any update is applied.
pub trait Initializer: fmt::Debug + Send + Sync {
    /// Fills a freshly allocated dense tensor.
    ///
    /// # Arguments
    /// * `name` - The qualified name of the tensor.
    /// * `data` - The tensor in its declared shape.
    ///
    /// # Returns
    /// An error if a distribution can't be built for this tensor.
    fn initialize_dense(&self, name: &str, data: ArrayViewMutD<'_, f32>) -> Result<()>;

    /// Fills the rows of newly observed keys of a sparse table.
    ///
    /// # Arguments
    /// * `name` - The qualified name of the table.
    /// * `data` - One row per key.
    /// * `keys` - The keys being created.
    ///
    /// # Returns
    /// An error if a distribution can't be built for this table.
    fn initialize_sparse(&self, name: &str, data: ArrayViewMut2<'_, f32>, keys: &[u64])
    -> Result<()>;
}

/// Whether `name` refers to a bias, those start at zero under the name aware initializers.
pub(super) fn is_bias(name: &str) -> bool {
    name.ends_with("bias")
}
