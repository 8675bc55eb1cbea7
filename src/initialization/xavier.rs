use std::{fmt, str::FromStr};

use ndarray::{ArrayViewMut2, ArrayViewMutD};
use rand_distr::{Normal, Uniform};

use super::{SharedRng, random::fill};
use crate::{
    error::{PsErr, Result},
    initialization::Initializer,
};

/// The non-linearity following the initialized layer, it decides the gain.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Activation {
    Linear,
    Conv,
    Sigmoid,
    Tanh,
    Relu,
    LeakyRelu,
    Selu,
}

impl Activation {
    /// The recommended scaling for this activation.
    pub fn gain(self) -> f32 {
        match self {
            Self::Linear | Self::Conv | Self::Sigmoid => 1.,
            Self::Tanh => 5. / 3.,
            Self::Relu => 2f32.sqrt(),
            Self::LeakyRelu => (2. / (1. + 0.01f32.powi(2))).sqrt(),
            Self::Selu => 3. / 4.,
        }
    }
}

impl FromStr for Activation {
    type Err = PsErr;

    fn from_str(s: &str) -> Result<Self> {
        let activation = match s {
            "linear" => Self::Linear,
            "conv1d" | "conv2d" | "conv3d" | "conv_transpose1d" | "conv_transpose2d"
            | "conv_transpose3d" => Self::Conv,
            "sigmoid" => Self::Sigmoid,
            "tanh" => Self::Tanh,
            "relu" => Self::Relu,
            "leaky_relu" => Self::LeakyRelu,
            "selu" => Self::Selu,
            other => {
                return Err(PsErr::invalid(
                    "activation",
                    format!("{other:?}"),
                    "one of linear, conv*, sigmoid, tanh, relu, leaky_relu, selu",
                ));
            }
        };

        Ok(activation)
    }
}

/// The family of distribution Xavier samples from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum XavierDistribution {
    Uniform,
    Normal,
}

impl FromStr for XavierDistribution {
    type Err = PsErr;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "uniform" => Ok(Self::Uniform),
            "normal" => Ok(Self::Normal),
            other => Err(PsErr::invalid(
                "distribution",
                format!("{other:?}"),
                "one of 'uniform', 'normal'",
            )),
        }
    }
}

impl fmt::Display for XavierDistribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uniform => f.write_str("uniform"),
            Self::Normal => f.write_str("normal"),
        }
    }
}

/// Glorot initialization, scaled by the gain of the following activation.
#[derive(Debug, Clone)]
pub struct XavierInit {
    rng: SharedRng,
    activation: Activation,
    distribution: XavierDistribution,
}

impl XavierInit {
    /// Creates a new `XavierInit` initializer.
    ///
    /// # Arguments
    /// * `rng` - A random number generator.
    /// * `activation` - The name of the activation, for example `relu` or `tanh`.
    /// * `distribution` - Either `uniform` or `normal`.
    ///
    /// # Returns
    /// A new `XavierInit` instance or an error if either name isn't recognized.
    pub fn new(rng: SharedRng, activation: &str, distribution: &str) -> Result<Self> {
        Ok(Self {
            rng,
            activation: activation.parse()?,
            distribution: distribution.parse()?,
        })
    }

    pub fn activation(&self) -> Activation {
        self.activation
    }

    pub fn distribution(&self) -> XavierDistribution {
        self.distribution
    }

    /// Fills `data` given the fans of the tensor it belongs to.
    fn sample<'a, I>(&self, fan_in: usize, fan_out: usize, data: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a mut f32>,
    {
        let fans = (fan_in + fan_out) as f32;
        let gain = self.activation.gain();

        match self.distribution {
            XavierDistribution::Uniform => {
                let bound = gain * (6. / fans).sqrt();
                let distribution = Uniform::new_inclusive(-bound, bound)?;
                fill(&self.rng, &distribution, data);
            }
            XavierDistribution::Normal => {
                let std = gain * (2. / fans).sqrt();
                let distribution = Normal::new(0., std)?;
                fill(&self.rng, &distribution, data);
            }
        }

        Ok(())
    }
}

/// Computes `(fan_in, fan_out)` from a natural tensor shape.
///
/// Axis 0 holds the outputs, axis 1 the inputs and every other axis is a receptive field.
///
/// # Returns
/// The fans or an error if the shape has less than two axes or is empty.
pub fn fans(shape: &[usize]) -> Result<(usize, usize)> {
    let [fan_out, fan_in, receptive @ ..] = shape else {
        return Err(PsErr::invalid(
            "xavier shape",
            format!("{shape:?}"),
            "a shape with at least two axes",
        ));
    };

    let receptive: usize = receptive.iter().product();
    let (fan_in, fan_out) = (fan_in * receptive, fan_out * receptive);

    if fan_in + fan_out == 0 {
        return Err(PsErr::invalid(
            "xavier shape",
            format!("{shape:?}"),
            "a non-empty shape",
        ));
    }

    Ok((fan_in, fan_out))
}

impl Initializer for XavierInit {
    fn initialize_dense(&self, _name: &str, mut data: ArrayViewMutD<'_, f32>) -> Result<()> {
        let (fan_in, fan_out) = fans(data.shape())?;
        self.sample(fan_in, fan_out, data.iter_mut())
    }

    fn initialize_sparse(
        &self,
        _name: &str,
        mut data: ArrayViewMut2<'_, f32>,
        _keys: &[u64],
    ) -> Result<()> {
        // Every row is a `(1, width)` tensor on its own, so a key's values don't depend on the batch.
        let (fan_in, fan_out) = fans(&[1, data.ncols()])?;
        self.sample(fan_in, fan_out, data.iter_mut())
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{Array2, ArrayD, IxDyn};

    use super::*;
    use crate::initialization::shared_rng;

    #[test]
    fn gains() {
        assert_eq!("linear".parse::<Activation>().unwrap().gain(), 1.);
        assert_eq!("conv2d".parse::<Activation>().unwrap().gain(), 1.);
        assert_eq!("tanh".parse::<Activation>().unwrap().gain(), 5. / 3.);
        assert_eq!("relu".parse::<Activation>().unwrap().gain(), 2f32.sqrt());
        assert_eq!("selu".parse::<Activation>().unwrap().gain(), 0.75);
        let leaky = "leaky_relu".parse::<Activation>().unwrap().gain();
        assert!((leaky - 1.41407).abs() < 1e-4);
    }

    #[test]
    fn rejects_unknown_names() {
        let err = XavierInit::new(shared_rng(None), "relu", "gaussian").unwrap_err();
        assert!(err.to_string().contains("gaussian"));
        assert!(XavierInit::new(shared_rng(None), "swish", "uniform").is_err());
    }

    #[test]
    fn fans_fold_receptive_field() {
        assert_eq!(fans(&[16, 8]).unwrap(), (8, 16));
        assert_eq!(fans(&[16, 8, 3, 3]).unwrap(), (72, 144));
        assert!(fans(&[16]).is_err());
    }

    #[test]
    fn uniform_stays_within_bound() {
        let init = XavierInit::new(shared_rng(Some(1)), "relu", "uniform").unwrap();
        let mut data = ArrayD::zeros(IxDyn(&[32, 16]));

        init.initialize_dense("fc.weight", data.view_mut()).unwrap();

        let bound = 2f32.sqrt() * (6f32 / 48.).sqrt();
        assert!(data.iter().all(|v| v.abs() <= bound));
        assert!(data.iter().any(|&v| v != 0.));
    }

    #[test]
    fn sparse_rows_use_the_row_shape() {
        let init = XavierInit::new(shared_rng(Some(1)), "linear", "uniform").unwrap();
        let mut rows = Array2::zeros((100, 8));

        init.initialize_sparse("emb", rows.view_mut(), &[0; 100])
            .unwrap();

        let bound = (6f32 / 9.).sqrt();
        assert!(rows.iter().all(|v| v.abs() <= bound));
    }

    #[test]
    fn one_dimensional_dense_fails() {
        let init = XavierInit::new(shared_rng(None), "relu", "normal").unwrap();
        let mut bias = ArrayD::zeros(IxDyn(&[4]));
        assert!(init.initialize_dense("fc.bias", bias.view_mut()).is_err());
    }
}
