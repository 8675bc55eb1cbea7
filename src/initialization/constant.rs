use ndarray::{ArrayViewMut2, ArrayViewMutD};

use super::Initializer;
use crate::error::Result;

/// An initializer that always generates the same value, regardless of the tensor's name.
#[derive(Debug, Clone, Copy)]
pub struct ConstInit {
    value: f32,
}

impl ConstInit {
    /// Creates a new `ConstInit` initializer.
    ///
    /// # Arguments
    /// * `value` - The value to always generate.
    ///
    /// # Returns
    /// A new `ConstInit` instance.
    pub fn new(value: f32) -> Self {
        Self { value }
    }

    pub fn zero() -> Self {
        Self::new(0.)
    }

    pub fn one() -> Self {
        Self::new(1.)
    }
}

impl Initializer for ConstInit {
    fn initialize_dense(&self, _name: &str, mut data: ArrayViewMutD<'_, f32>) -> Result<()> {
        data.fill(self.value);
        Ok(())
    }

    fn initialize_sparse(
        &self,
        _name: &str,
        mut data: ArrayViewMut2<'_, f32>,
        _keys: &[u64],
    ) -> Result<()> {
        data.fill(self.value);
        Ok(())
    }
}
