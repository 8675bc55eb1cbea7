use ndarray::{ArrayView2, ArrayViewMut2, Zip};

use super::{
    Updater,
    updater::{check_dense, check_sparse, checked_state, split_pair},
};
use crate::{checks, error::Result};

/// Follow the regularized leader, proximal variant.
///
/// Keeps the `n` (squared gradient sum) and `z` accumulators per parameter and recomputes
/// the parameter from them on every step, producing exact zeros while `|z| <= l1`.
#[derive(Debug, Clone, Copy)]
pub struct Ftrl {
    l1: f32,
    l2: f32,
    alpha: f32,
    beta: f32,
}

impl Ftrl {
    /// Creates a new `Ftrl` updater.
    ///
    /// # Arguments
    /// * `l1` - The l1 regularization strength, non-negative.
    /// * `l2` - The l2 regularization strength, non-negative.
    /// * `alpha` - The per-coordinate learning rate scale, positive.
    /// * `beta` - The smoothing term of the adaptive learning rate, non-negative.
    ///
    /// # Returns
    /// A new `Ftrl` instance or an error if any hyper-parameter is out of range.
    pub fn new(l1: f32, l2: f32, alpha: f32, beta: f32) -> Result<Self> {
        Ok(Self {
            l1: checks::non_negative("l1", l1)?,
            l2: checks::non_negative("l2", l2)?,
            alpha: checks::positive("alpha", alpha)?,
            beta: checks::non_negative("beta", beta)?,
        })
    }

    fn step(&self, p: &mut f32, g: f32, n: &mut f32, z: &mut f32) {
        let Self {
            l1,
            l2,
            alpha,
            beta,
        } = *self;

        let g2 = g * g;
        let sigma = ((*n + g2).sqrt() - n.sqrt()) / alpha;
        *z += g - sigma * *p;
        *n += g2;

        *p = if z.abs() <= l1 {
            0.
        } else {
            -(*z - z.signum() * l1) / ((beta + n.sqrt()) / alpha + l2)
        };
    }
}

impl Updater for Ftrl {
    fn states_per_param(&self) -> usize {
        2
    }

    fn update_dense(
        &self,
        _name: &str,
        mut param: ArrayViewMut2<'_, f32>,
        grad: ArrayView2<'_, f32>,
        state: Option<ArrayViewMut2<'_, f32>>,
    ) -> Result<()> {
        check_dense(&param, &grad)?;
        let state = checked_state(state, param.dim(), 2)?;
        let (mut n, mut z) = split_pair(state);

        Zip::from(&mut param)
            .and(&grad)
            .and(&mut n)
            .and(&mut z)
            .for_each(|p, &g, n, z| self.step(p, g, n, z));

        Ok(())
    }

    fn update_sparse(
        &self,
        _name: &str,
        mut param: ArrayViewMut2<'_, f32>,
        grad: ArrayView2<'_, f32>,
        state: Option<ArrayViewMut2<'_, f32>>,
        indices: &[usize],
        keys: &[u64],
    ) -> Result<()> {
        check_sparse(&param, &grad, indices, keys)?;
        let state = checked_state(state, param.dim(), 2)?;
        let (mut n, mut z) = split_pair(state);

        for (&i, g) in indices.iter().zip(grad.rows()) {
            Zip::from(param.row_mut(i))
                .and(g)
                .and(n.row_mut(i))
                .and(z.row_mut(i))
                .for_each(|p, &g, n, z| self.step(p, g, n, z));
        }

        Ok(())
    }
}
