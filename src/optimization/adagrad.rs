use ndarray::{ArrayView2, ArrayViewMut2, Zip};

use super::{
    Updater,
    updater::{check_dense, check_sparse, checked_state},
};
use crate::{checks, error::Result};

/// AdaGrad with an optional l2 penalty folded into the gradient.
///
/// Keeps a running sum of squared gradients per parameter.
#[derive(Debug, Clone, Copy)]
pub struct AdaGrad {
    learning_rate: f32,
    float_stable_eps: f32,
    l2: f32,
}

impl AdaGrad {
    /// Creates a new `AdaGrad` updater.
    ///
    /// # Arguments
    /// * `learning_rate` - The small coefficient that modulates the amount of training per update.
    /// * `float_stable_eps` - Added to the square sum before taking its root.
    /// * `l2` - The weight decay coefficient.
    ///
    /// # Returns
    /// A new `AdaGrad` instance or an error if any hyper-parameter is out of range.
    pub fn new(learning_rate: f32, float_stable_eps: f32, l2: f32) -> Result<Self> {
        Ok(Self {
            learning_rate: checks::positive("learning_rate", learning_rate)?,
            float_stable_eps: checks::non_negative("float_stable_eps", float_stable_eps)?,
            l2: checks::non_negative("l2", l2)?,
        })
    }

    fn step(&self, p: &mut f32, g: f32, square_sum: &mut f32) {
        let g = g + self.l2 * *p;
        *square_sum += g * g;
        *p -= self.learning_rate * g / (*square_sum + self.float_stable_eps).sqrt();
    }
}

impl Updater for AdaGrad {
    fn states_per_param(&self) -> usize {
        1
    }

    fn update_dense(
        &self,
        _name: &str,
        mut param: ArrayViewMut2<'_, f32>,
        grad: ArrayView2<'_, f32>,
        state: Option<ArrayViewMut2<'_, f32>>,
    ) -> Result<()> {
        check_dense(&param, &grad)?;
        let mut square_sum = checked_state(state, param.dim(), 1)?;

        Zip::from(&mut param)
            .and(&grad)
            .and(&mut square_sum)
            .for_each(|p, &g, s| self.step(p, g, s));

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
        let mut square_sum = checked_state(state, param.dim(), 1)?;

        for (&i, g) in indices.iter().zip(grad.rows()) {
            Zip::from(param.row_mut(i))
                .and(g)
                .and(square_sum.row_mut(i))
                .for_each(|p, &g, s| self.step(p, g, s));
        }

        Ok(())
    }
}
