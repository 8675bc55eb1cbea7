use ndarray::{ArrayView2, ArrayViewMut2, Zip};

use super::{
    Updater,
    updater::{check_dense, check_sparse},
};
use crate::{checks, error::Result};

/// Plain stochastic gradient descent, keeps no state.
#[derive(Debug, Clone, Copy)]
pub struct Sgd {
    learning_rate: f32,
}

impl Sgd {
    /// Creates a new `Sgd` updater.
    ///
    /// # Arguments
    /// * `learning_rate` - The small coefficient that modulates the amount of training per update.
    ///
    /// # Returns
    /// A new `Sgd` instance or an error if `learning_rate` isn't positive and finite.
    pub fn new(learning_rate: f32) -> Result<Self> {
        Ok(Self {
            learning_rate: checks::positive("learning_rate", learning_rate)?,
        })
    }

    pub fn learning_rate(&self) -> f32 {
        self.learning_rate
    }
}

impl Updater for Sgd {
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

        let lr = self.learning_rate;
        Zip::from(&mut param).and(&grad).for_each(|p, &g| *p -= lr * g);
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

        let lr = self.learning_rate;
        for (&i, g) in indices.iter().zip(grad.rows()) {
            Zip::from(param.row_mut(i)).and(g).for_each(|p, &g| *p -= lr * g);
        }

        Ok(())
    }
}
