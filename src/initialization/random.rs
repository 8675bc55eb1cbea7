use ndarray::{ArrayViewMut2, ArrayViewMutD};
use rand_distr::{Distribution, Normal};

use super::{Initializer, SharedRng, initializer::is_bias};
use crate::{checks, error::Result};

/// Fills every element of `data` sampling from `distribution`.
pub(super) fn fill<'a, I, D>(rng: &SharedRng, distribution: &D, data: I)
where
    I: IntoIterator<Item = &'a mut f32>,
    D: Distribution<f32>,
{
    let mut rng = rng.lock();
    data.into_iter()
        .for_each(|v| *v = distribution.sample(&mut *rng));
}

/// Zeroes biases and samples everything else from a normal distribution.
#[derive(Debug, Clone)]
pub struct NormalInit {
    rng: SharedRng,
    mean: f32,
    variance: f32,
    distribution: Normal<f32>,
}

impl NormalInit {
    /// Creates a new `NormalInit` initializer.
    ///
    /// # Arguments
    /// * `rng` - A random number generator.
    /// * `mean` - The mean of the distribution.
    /// * `variance` - The spread of the distribution, must be positive and finite.
    ///
    /// # Returns
    /// A new `NormalInit` instance or an error if `mean` or `variance` are out of range.
    pub fn new(rng: SharedRng, mean: f32, variance: f32) -> Result<Self> {
        let mean = checks::finite("mean", mean)?;
        let variance = checks::positive("variance", variance)?;

        Ok(Self {
            rng,
            mean,
            variance,
            distribution: Normal::new(mean, variance)?,
        })
    }

    /// The initializer used when nothing else is configured: biases at zero, unit normal noise elsewhere.
    ///
    /// # Arguments
    /// * `rng` - A random number generator.
    ///
    /// # Returns
    /// A new `NormalInit` instance.
    pub fn standard(rng: SharedRng) -> Self {
        Self {
            rng,
            mean: 0.,
            variance: 1.,
            // SAFETY: A unit normal always has a valid mean and spread.
            distribution: Normal::new(0., 1.).unwrap(),
        }
    }

    pub fn mean(&self) -> f32 {
        self.mean
    }

    pub fn variance(&self) -> f32 {
        self.variance
    }
}

impl Initializer for NormalInit {
    fn initialize_dense(&self, name: &str, mut data: ArrayViewMutD<'_, f32>) -> Result<()> {
        if is_bias(name) {
            data.fill(0.);
        } else {
            fill(&self.rng, &self.distribution, data.iter_mut());
        }

        Ok(())
    }

    fn initialize_sparse(
        &self,
        name: &str,
        mut data: ArrayViewMut2<'_, f32>,
        _keys: &[u64],
    ) -> Result<()> {
        if is_bias(name) {
            data.fill(0.);
        } else {
            fill(&self.rng, &self.distribution, data.iter_mut());
        }

        Ok(())
    }
}
