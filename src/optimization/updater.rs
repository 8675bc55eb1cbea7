use std::fmt;

use ndarray::{ArrayView2, ArrayViewMut2, Axis};

use crate::{
    error::{PsErr, Result},
    shape,
};

/// Defines the rule the store uses to turn gradients into new parameter values.
///
/// Dense updates see the whole tensor as a matrix together with its full-shape state.
/// Sparse updates see a gathered slice of table rows and only touch the rows addressed
/// by `indices`, so their cost scales with the batch and not with the table.
pub trait Updater: fmt::Debug + Send + Sync {
    /// How many auxiliary values this updater keeps per parameter.
    fn states_per_param(&self) -> usize;

    /// Updates every value of a dense tensor.
    ///
    /// # Arguments
    /// * `name` - The qualified name of the tensor.
    /// * `param` - The tensor viewed as a matrix.
    /// * `grad` - The gradient, same shape as `param`.
    /// * `state` - The auxiliary state, `None` for stateless updaters.
    ///
    /// # Returns
    /// A `SizeMismatch` error, without touching anything, if the shapes don't line up.
    fn update_dense(
        &self,
        name: &str,
        param: ArrayViewMut2<'_, f32>,
        grad: ArrayView2<'_, f32>,
        state: Option<ArrayViewMut2<'_, f32>>,
    ) -> Result<()>;

    /// Updates the rows of a gathered sparse slice addressed by `indices`.
    ///
    /// # Arguments
    /// * `name` - The qualified name of the table.
    /// * `param` - The gathered rows.
    /// * `grad` - One gradient row per entry of `indices`.
    /// * `state` - The auxiliary state rows, `None` for stateless updaters.
    /// * `indices` - The positions in `param` to update.
    /// * `keys` - The table key of each updated row.
    ///
    /// # Returns
    /// A `SizeMismatch` error, without touching anything, if the shapes don't line up.
    fn update_sparse(
        &self,
        name: &str,
        param: ArrayViewMut2<'_, f32>,
        grad: ArrayView2<'_, f32>,
        state: Option<ArrayViewMut2<'_, f32>>,
        indices: &[usize],
        keys: &[u64],
    ) -> Result<()>;

    /// Derives the state shape from an already normalized data shape.
    ///
    /// # Returns
    /// `None` for stateless updaters, otherwise `data_shape` with its last axis multiplied.
    fn state_shape(&self, data_shape: &[usize]) -> Option<Vec<usize>> {
        let num = self.states_per_param();

        if num == 0 {
            return None;
        }

        let mut state_shape = data_shape.to_vec();
        if let Some(last) = state_shape.last_mut() {
            *last *= num;
        }

        Some(state_shape)
    }

    /// The state shape for a dense tensor of `shape`.
    fn dense_state_shape(&self, shape: &[usize]) -> Option<Vec<usize>> {
        self.state_shape(&shape::dense_data_shape(shape))
    }

    /// The state shape of a single row of a sparse table `width` values wide.
    fn sparse_state_shape(&self, width: usize) -> Option<Vec<usize>> {
        self.state_shape(&[width])
    }
}

/// Checks that a dense gradient matches its parameter.
pub(super) fn check_dense(param: &ArrayViewMut2<'_, f32>, grad: &ArrayView2<'_, f32>) -> Result<()> {
    if param.dim() != grad.dim() {
        return Err(PsErr::SizeMismatch {
            what: "dense gradient",
            got: grad.len(),
            expected: param.len(),
        });
    }

    Ok(())
}

/// Checks that a sparse gradient, its indices and its keys all describe the same rows.
pub(super) fn check_sparse(
    param: &ArrayViewMut2<'_, f32>,
    grad: &ArrayView2<'_, f32>,
    indices: &[usize],
    keys: &[u64],
) -> Result<()> {
    if grad.ncols() != param.ncols() {
        return Err(PsErr::SizeMismatch {
            what: "sparse gradient width",
            got: grad.ncols(),
            expected: param.ncols(),
        });
    }

    if grad.nrows() != indices.len() {
        return Err(PsErr::SizeMismatch {
            what: "sparse gradient rows",
            got: grad.nrows(),
            expected: indices.len(),
        });
    }

    if keys.len() != indices.len() {
        return Err(PsErr::SizeMismatch {
            what: "sparse keys",
            got: keys.len(),
            expected: indices.len(),
        });
    }

    if let Some(&index) = indices.iter().find(|&&i| i >= param.nrows()) {
        return Err(PsErr::invalid(
            "index",
            index,
            "a position inside the gathered slice",
        ));
    }

    Ok(())
}

/// Checks the state against the parameter matrix it belongs to.
///
/// # Arguments
/// * `state` - The state handed to the updater.
/// * `dim` - The `(rows, cols)` of the parameter matrix.
/// * `num` - The updater's states per parameter.
///
/// # Returns
/// The state itself or a `SizeMismatch` error if it's missing or misshapen.
pub(super) fn checked_state<'a>(
    state: Option<ArrayViewMut2<'a, f32>>,
    (rows, cols): (usize, usize),
    num: usize,
) -> Result<ArrayViewMut2<'a, f32>> {
    let expected = rows * cols * num;

    match state {
        Some(state) if state.dim() == (rows, cols * num) => Ok(state),
        Some(state) => Err(PsErr::SizeMismatch {
            what: "updater state",
            got: state.len(),
            expected,
        }),
        None => Err(PsErr::SizeMismatch {
            what: "updater state",
            got: 0,
            expected,
        }),
    }
}

/// Splits a two slot state along its last axis.
pub(super) fn split_pair(state: ArrayViewMut2<'_, f32>) -> (ArrayViewMut2<'_, f32>, ArrayViewMut2<'_, f32>) {
    let half = state.ncols() / 2;
    state.split_at(Axis(1), half)
}

#[cfg(test)]
mod tests {
    use ndarray::Array2;

    use super::*;
    use crate::optimization::{AdaGrad, Adam, Ema, Ftrl, Sgd};

    fn all_updaters() -> Vec<Box<dyn Updater>> {
        vec![
            Box::new(Sgd::new(0.1).unwrap()),
            Box::new(AdaGrad::new(0.1, 1e-6, 0.01).unwrap()),
            Box::new(Adam::new(0.01, 0.9, 0.999, 1e-8).unwrap()),
            Box::new(Ftrl::new(0.1, 1.0, 0.5, 1.0).unwrap()),
            Box::new(Ema::new(0.25).unwrap()),
        ]
    }

    #[test]
    fn state_shape_multiplies_last_axis() {
        let adagrad = AdaGrad::new(0.1, 0., 0.).unwrap();
        let adam = Adam::new(0.1, 0.9, 0.999, 1e-8).unwrap();

        assert_eq!(adagrad.dense_state_shape(&[4, 3]), Some(vec![4, 3]));
        assert_eq!(adam.dense_state_shape(&[4, 3]), Some(vec![4, 6]));
        assert_eq!(adam.dense_state_shape(&[5]), Some(vec![5, 2]));
        assert_eq!(adagrad.sparse_state_shape(8), Some(vec![8]));
        assert_eq!(adam.sparse_state_shape(8), Some(vec![16]));
        assert_eq!(Sgd::new(0.1).unwrap().dense_state_shape(&[4, 3]), None);
    }

    #[test]
    fn state_last_axis_is_divisible_by_slots() {
        for updater in all_updaters() {
            let num = updater.states_per_param();
            if let Some(shape) = updater.dense_state_shape(&[3, 7]) {
                assert_eq!(shape.last().unwrap() % num, 0);
                assert_eq!(*shape.last().unwrap(), 7 * num);
            }
            if let Some(shape) = updater.sparse_state_shape(7) {
                assert_eq!(shape, [7 * num]);
            }
        }
    }

    #[test]
    fn dense_and_sparse_paths_agree_over_the_whole_table() {
        const ROWS: usize = 3;
        const COLS: usize = 4;

        let init = Array2::from_shape_fn((ROWS, COLS), |(r, c)| 0.3 * r as f32 - 0.2 * c as f32 + 0.1);
        let grad = Array2::from_shape_fn((ROWS, COLS), |(r, c)| (r as f32 + 1.) * 0.5 - c as f32);
        let indices: Vec<usize> = (0..ROWS).collect();
        let keys: Vec<u64> = (0..ROWS as u64).map(|k| k * 31 + 7).collect();

        for updater in all_updaters() {
            let num = updater.states_per_param();
            let mut dense = init.clone();
            let mut sparse = init.clone();
            let mut dense_state = Array2::from_elem((ROWS, COLS * num), 0.05);
            let mut sparse_state = dense_state.clone();

            for _ in 0..3 {
                let state = (num > 0).then(|| dense_state.view_mut());
                updater
                    .update_dense("t", dense.view_mut(), grad.view(), state)
                    .unwrap();

                let state = (num > 0).then(|| sparse_state.view_mut());
                updater
                    .update_sparse("t", sparse.view_mut(), grad.view(), state, &indices, &keys)
                    .unwrap();
            }

            for (d, s) in dense.iter().zip(&sparse) {
                assert!((d - s).abs() <= 1e-6, "{updater:?}: {d} != {s}");
            }
            for (d, s) in dense_state.iter().zip(&sparse_state) {
                assert!((d - s).abs() <= 1e-6, "{updater:?}: {d} != {s}");
            }
        }
    }

    #[test]
    fn sparse_update_leaves_other_rows_untouched() {
        let mut param = Array2::from_elem((4, 2), 1.0);
        let grad = Array2::from_elem((1, 2), 1.0);

        Sgd::new(0.5)
            .unwrap()
            .update_sparse("t", param.view_mut(), grad.view(), None, &[2], &[42])
            .unwrap();

        assert_eq!(param.row(2).to_vec(), [0.5, 0.5]);
        for r in [0, 1, 3] {
            assert_eq!(param.row(r).to_vec(), [1.0, 1.0]);
        }
    }

    #[test]
    fn mismatched_shapes_fail_without_writing() {
        let adam = Adam::new(0.1, 0.9, 0.999, 1e-8).unwrap();
        let mut param = Array2::from_elem((2, 2), 1.0);
        let mut state = Array2::zeros((2, 2));
        let grad = Array2::from_elem((2, 2), 1.0);

        let err = adam
            .update_dense("t", param.view_mut(), grad.view(), Some(state.view_mut()))
            .unwrap_err();
        assert!(matches!(err, PsErr::SizeMismatch { .. }));
        assert!(param.iter().all(|&p| p == 1.0));

        let err = adam
            .update_sparse("t", param.view_mut(), grad.view(), None, &[0, 5], &[1, 2])
            .unwrap_err();
        assert!(matches!(err, PsErr::InvalidArgument { .. }));
        assert!(param.iter().all(|&p| p == 1.0));
    }
}
