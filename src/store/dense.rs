use std::sync::Arc;

use ndarray::{Array2, ArrayD, ArrayViewD, IxDyn};
use parking_lot::Mutex;

use super::checkpoint::DenseRecord;
use crate::{
    error::{PsErr, Result},
    initialization::Initializer,
    optimization::Updater,
    shape,
};

#[derive(Debug)]
struct DenseData {
    values: Array2<f32>,
    state: Option<Array2<f32>>,
}

/// The authoritative copy of a dense tensor, kept as the matrix its updater sees.
#[derive(Debug)]
pub struct DenseSlot {
    name: String,
    shape: Vec<usize>,
    updater: Arc<dyn Updater>,
    data: Mutex<DenseData>,
}

impl DenseSlot {
    /// Creates a new `DenseSlot` and initializes its value.
    ///
    /// # Arguments
    /// * `name` - The qualified name of the tensor.
    /// * `shape` - The declared shape.
    /// * `initializer` - Fills the value in its declared shape.
    /// * `updater` - The update rule, it decides the size of the state.
    ///
    /// # Returns
    /// A new `DenseSlot` or the initializer's error.
    pub fn new(
        name: &str,
        shape: &[usize],
        initializer: &dyn Initializer,
        updater: Arc<dyn Updater>,
    ) -> Result<Self> {
        let mut natural = ArrayD::zeros(IxDyn(shape));
        initializer.initialize_dense(name, natural.view_mut())?;

        let (rows, cols) = shape::matrix_dims(shape);
        let values = natural.into_shape_with_order((rows, cols))?;
        let state = match updater.states_per_param() {
            0 => None,
            num => Some(Array2::zeros((rows, cols * num))),
        };

        Ok(Self {
            name: name.to_string(),
            shape: shape.to_vec(),
            updater,
            data: Mutex::new(DenseData { values, state }),
        })
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn check_shape(&self, what: &'static str, got: &[usize]) -> Result<()> {
        if got != self.shape.as_slice() {
            return Err(PsErr::SizeMismatch {
                what,
                got: shape::numel(got),
                expected: shape::numel(&self.shape),
            });
        }

        Ok(())
    }

    /// Copies the value out in its declared shape.
    pub fn get(&self) -> Result<ArrayD<f32>> {
        let values = self.data.lock().values.clone();
        Ok(values.into_shape_with_order(IxDyn(&self.shape))?)
    }

    /// Overwrites the value, the state is left as is.
    pub fn set(&self, value: ArrayViewD<'_, f32>) -> Result<()> {
        self.check_shape("dense value", value.shape())?;
        let value = value.to_shape(shape::matrix_dims(&self.shape))?;

        self.data.lock().values.assign(&value);
        Ok(())
    }

    /// Runs the updater over the whole tensor.
    pub fn apply_update(&self, grad: ArrayViewD<'_, f32>) -> Result<()> {
        self.check_shape("dense gradient", grad.shape())?;
        let grad = grad.to_shape(shape::matrix_dims(&self.shape))?;

        let mut data = self.data.lock();
        let DenseData { values, state } = &mut *data;

        self.updater.update_dense(
            &self.name,
            values.view_mut(),
            grad.view(),
            state.as_mut().map(|s| s.view_mut()),
        )
    }

    /// Takes a consistent copy of the value and state.
    pub fn snapshot(&self) -> DenseRecord {
        let data = self.data.lock();

        DenseRecord {
            shape: self.shape.clone(),
            values: data.values.iter().copied().collect(),
            state: data.state.as_ref().map(|s| s.iter().copied().collect()),
        }
    }

    /// Replaces the value and state with the ones of a checkpoint.
    ///
    /// # Returns
    /// A `SizeMismatch` error, leaving the slot untouched, if the record doesn't fit.
    pub fn restore(&self, record: DenseRecord) -> Result<()> {
        self.check_shape("dense checkpoint", &record.shape)?;

        let mut data = self.data.lock();
        let dim = data.values.dim();

        let state = match (&data.state, record.state) {
            (Some(current), Some(state)) => Some(Array2::from_shape_vec(current.dim(), state)?),
            (None, None) => None,
            (current, state) => {
                return Err(PsErr::SizeMismatch {
                    what: "dense checkpoint state",
                    got: state.map_or(0, |s| s.len()),
                    expected: current.as_ref().map_or(0, |s| s.len()),
                });
            }
        };

        data.values = Array2::from_shape_vec(dim, record.values)?;
        data.state = state;
        Ok(())
    }
}
