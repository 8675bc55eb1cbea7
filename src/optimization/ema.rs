use ndarray::{ArrayView2, ArrayViewMut2, Zip};

use super::{
    Updater,
    updater::{check_dense, check_sparse},
};
use crate::{checks, error::Result};

/// Exponential moving average of the pushed values.
///
/// Meant for running statistics like batch normalization's mean and variance, where the
/// pushed "gradient" is the statistic observed on the worker's last batch.
#[derive(Debug, Clone, Copy)]
pub struct Ema {
    momentum: f32,
}

impl Ema {
    /// Creates a new `Ema` updater.
    ///
    /// # Arguments
    /// * `momentum` - The weight of the incoming value, in `(0, 1)`.
    ///
    /// # Returns
    /// A new `Ema` instance or an error if `momentum` is out of range.
    pub fn new(momentum: f32) -> Result<Self> {
        Ok(Self {
            momentum: checks::open_unit("momentum", momentum)?,
        })
    }

    pub fn momentum(&self) -> f32 {
        self.momentum
    }
}

impl Default for Ema {
    fn default() -> Self {
        Self { momentum: 0.1 }
    }
}

impl Updater for Ema {
    fn states_per_param(&self) -> usize {
        0
    }

    fn update_dense(
        &self,
        _name: &str,
        mut param: ArrayViewMut2<'_, f32>,
        grad: ArrayView2<'_, f32>,
        _state: Option<ArrayViewMut2<'_, f32>>,
    ) -> Result<()> {
        check_dense(&param, &grad)?;

        let mu = self.momentum;
        Zip::from(&mut param)
            .and(&grad)
            .for_each(|p, &g| *p = (1. - mu) * *p + mu * g);

        Ok(())
    }

    fn update_sparse(
        &self,
        _name: &str,
        mut param: ArrayViewMut2<'_, f32>,
        grad: ArrayView2<'_, f32>,
        _state: Option<ArrayViewMut2<'_, f32>>,
        indices: &[usize],
        keys: &[u64],
    ) -> Result<()> {
        check_sparse(&param, &grad, indices, keys)?;

        let mu = self.momentum;
        for (&i, g) in indices.iter().zip(grad.rows()) {
            Zip::from(param.row_mut(i))
                .and(g)
                .for_each(|p, &g| *p = (1. - mu) * *p + mu * g);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    #[test]
    fn blends_the_running_value() {
        let ema = Ema::new(0.1).unwrap();
        let mut param = array![[2.0f32]];
        let grad = array![[4.0f32]];

        ema.update_dense("bn.running_mean", param.view_mut(), grad.view(), None)
            .unwrap();

        assert!((param[[0, 0]] - 2.2).abs() < 1e-6);
    }

    #[test]
    fn momentum_must_be_strictly_inside_the_unit_interval() {
        assert!(Ema::new(0.0).is_err());
        assert!(Ema::new(1.0).is_err());
        assert!(Ema::new(-0.5).is_err());
        assert!(Ema::new(0.5).is_ok());
    }
}
