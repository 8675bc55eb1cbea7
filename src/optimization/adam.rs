use ndarray::{ArrayView2, ArrayViewMut2, Zip};

use super::{
    Updater,
    updater::{check_dense, check_sparse, checked_state, split_pair},
};
use crate::{checks, error::Result};

/// Adam without bias correction.
///
/// The first and second moments are used as is, there's no division by `1 - beta^t`.
#[derive(Debug, Clone, Copy)]
pub struct Adam {
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
}

impl Adam {
    /// Creates a new `Adam` updater.
    ///
    /// # Arguments
    /// * `learning_rate` - The small coefficient that modulates the amount of training per update.
    /// * `beta1`, `beta2` - Decay rates of the first and second moments, in `[0, 1)`.
    /// * `epsilon` - Added to the root of the second moment.
    ///
    /// # Returns
    /// A new `Adam` instance or an error if any hyper-parameter is out of range.
    pub fn new(learning_rate: f32, beta1: f32, beta2: f32, epsilon: f32) -> Result<Self> {
        Ok(Self {
            learning_rate: checks::positive("learning_rate", learning_rate)?,
            beta1: checks::decay_rate("beta1", beta1)?,
            beta2: checks::decay_rate("beta2", beta2)?,
            epsilon: checks::non_negative("epsilon", epsilon)?,
        })
    }

    fn step(&self, p: &mut f32, g: f32, m: &mut f32, v: &mut f32) {
        let Self {
            learning_rate: lr,
            beta1: b1,
            beta2: b2,
            epsilon: eps,
        } = *self;

        *m = b1 * *m + (1. - b1) * g;
        *v = b2 * *v + (1. - b2) * g * g;
        *p -= lr * *m / (v.sqrt() + eps);
    }
}

impl Updater for Adam {
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
        let (mut m, mut v) = split_pair(state);

        Zip::from(&mut param)
            .and(&grad)
            .and(&mut m)
            .and(&mut v)
            .for_each(|p, &g, m, v| self.step(p, g, m, v));

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
        let (mut m, mut v) = split_pair(state);

        for (&i, g) in indices.iter().zip(grad.rows()) {
            Zip::from(param.row_mut(i))
                .and(g)
                .and(m.row_mut(i))
                .and(v.row_mut(i))
                .for_each(|p, &g, m, v| self.step(p, g, m, v));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    #[test]
    fn first_step_has_no_bias_correction() {
        let adam = Adam::new(0.1, 0.9, 0.999, 0.0).unwrap();
        let mut param = array![[1.0f32]];
        let mut state = array![[0.0f32, 0.0]];
        let grad = array![[1.0f32]];

        adam.update_dense("w", param.view_mut(), grad.view(), Some(state.view_mut()))
            .unwrap();

        let m = 0.1f32;
        let v = 0.001f32;
        assert!((state[[0, 0]] - m).abs() < 1e-7);
        assert!((state[[0, 1]] - v).abs() < 1e-7);

        // A bias corrected Adam would step by the full learning rate here.
        let expected = 1.0 - 0.1 * m / v.sqrt();
        assert!((param[[0, 0]] - expected).abs() < 1e-4);
        assert!((param[[0, 0]] - 0.9).abs() > 1e-2);
    }

    #[test]
    fn moments_live_in_separate_halves_of_the_state() {
        let adam = Adam::new(0.1, 0.5, 0.5, 1e-8).unwrap();
        let mut param = array![[0.0f32, 0.0]];
        let mut state = array![[0.0f32, 0.0, 0.0, 0.0]];
        let grad = array![[2.0f32, -4.0]];

        adam.update_dense("w", param.view_mut(), grad.view(), Some(state.view_mut()))
            .unwrap();

        assert_eq!(state, array![[1.0, -2.0, 2.0, 8.0]]);
    }

    #[test]
    fn rejects_out_of_range_betas() {
        assert!(Adam::new(0.1, 1.0, 0.999, 1e-8).is_err());
        assert!(Adam::new(0.1, 0.9, -0.1, 1e-8).is_err());
        assert!(Adam::new(0.1, 0.9, 0.999, -1e-8).is_err());
        assert!(Adam::new(-0.1, 0.9, 0.999, 1e-8).is_err());
    }
}
