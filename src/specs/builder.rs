use std::sync::Arc;

use log::debug;

use super::{InitializerSpec, ModelConfig, UpdaterSpec};
use crate::{
    coordination::Agent,
    error::{PsErr, Result},
    initialization::{ConstInit, Initializer, NormalInit, SharedRng, XavierInit, shared_rng},
    model::{Defaults, Model, Module},
    optimization::{AdaGrad, Adam, Ema, Ftrl, Sgd, Updater},
};

/// Resolves specifications into strategy objects.
///
/// Every initializer built by the same builder draws from one shared random number
/// generator, so a seeded builder reproduces the same initial values.
#[derive(Debug, Clone)]
pub struct StrategyBuilder {
    rng: SharedRng,
}

impl StrategyBuilder {
    /// Creates a new `StrategyBuilder`.
    ///
    /// # Arguments
    /// * `seed` - An optional seed for the initializers' random number generator.
    pub fn new(seed: Option<u64>) -> Self {
        Self {
            rng: shared_rng(seed),
        }
    }

    pub fn rng(&self) -> &SharedRng {
        &self.rng
    }

    /// Builds an updater following a spec.
    ///
    /// # Arguments
    /// * `spec` - The specification of the updater.
    ///
    /// # Returns
    /// A new updater or an `InvalidArgument` error if a hyper-parameter is out of range.
    pub fn updater(&self, spec: &UpdaterSpec) -> Result<Arc<dyn Updater>> {
        let updater: Arc<dyn Updater> = match *spec {
            UpdaterSpec::Sgd { learning_rate } => Arc::new(Sgd::new(learning_rate)?),
            UpdaterSpec::AdaGrad {
                learning_rate,
                float_stable_eps,
                l2,
            } => Arc::new(AdaGrad::new(learning_rate, float_stable_eps, l2)?),
            UpdaterSpec::Adam {
                learning_rate,
                beta1,
                beta2,
                epsilon,
            } => Arc::new(Adam::new(learning_rate, beta1, beta2, epsilon)?),
            UpdaterSpec::Ftrl {
                l1,
                l2,
                alpha,
                beta,
            } => Arc::new(Ftrl::new(l1, l2, alpha, beta)?),
            UpdaterSpec::Ema { momentum } => Arc::new(Ema::new(momentum)?),
        };

        Ok(updater)
    }

    /// Builds an initializer following a spec.
    ///
    /// # Arguments
    /// * `spec` - The specification of the initializer.
    ///
    /// # Returns
    /// A new initializer or an error if a parameter, activation or distribution is invalid.
    pub fn initializer(&self, spec: &InitializerSpec) -> Result<Arc<dyn Initializer>> {
        let rng = Arc::clone(&self.rng);

        let initializer: Arc<dyn Initializer> = match spec {
            InitializerSpec::Default => Arc::new(NormalInit::standard(rng)),
            InitializerSpec::Zero => Arc::new(ConstInit::zero()),
            InitializerSpec::One => Arc::new(ConstInit::one()),
            InitializerSpec::Normal { mean, variance } => {
                Arc::new(NormalInit::new(rng, *mean, *variance)?)
            }
            InitializerSpec::Xavier {
                activation,
                distribution,
            } => Arc::new(XavierInit::new(rng, activation, distribution)?),
        };

        Ok(initializer)
    }

    /// Builds the default strategies of a model.
    pub fn defaults(&self, config: &ModelConfig) -> Result<Defaults> {
        if config.partition_count == 0 {
            return Err(PsErr::invalid(
                "partition_count",
                config.partition_count,
                "a positive integer",
            ));
        }

        let defaults = Defaults {
            initializer: self.initializer(&config.initializer)?,
            updater: self.updater(&config.updater)?,
            partition_count: config.partition_count,
        };

        debug!(partition_count = config.partition_count; "built default strategies from {:?} and {:?}", config.initializer, config.updater);
        Ok(defaults)
    }

    /// Applies the experiment name and model version of `config` to `model`.
    pub fn configure<A: Agent, M: Module>(
        &self,
        config: &ModelConfig,
        model: &mut Model<A, M>,
    ) -> Result<()> {
        if let Some(name) = &config.experiment_name {
            model.set_experiment_name(name)?;
        }

        if let Some(version) = &config.model_version {
            model.set_model_version(version)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{ArrayD, IxDyn};

    use super::*;

    fn sample(builder: &StrategyBuilder, spec: &InitializerSpec) -> ArrayD<f32> {
        let mut data = ArrayD::zeros(IxDyn(&[4, 4]));
        builder
            .initializer(spec)
            .unwrap()
            .initialize_dense("fc.weight", data.view_mut())
            .unwrap();
        data
    }

    #[test]
    fn seeded_builders_reproduce_initial_values() {
        let spec = InitializerSpec::Xavier {
            activation: "tanh".to_string(),
            distribution: "normal".to_string(),
        };

        let a = sample(&StrategyBuilder::new(Some(3)), &spec);
        let b = sample(&StrategyBuilder::new(Some(3)), &spec);

        assert_eq!(a, b);
        assert!(a.iter().any(|&v| v != 0.));
    }

    #[test]
    fn invalid_hyper_parameters_are_rejected() {
        let builder = StrategyBuilder::new(Some(0));

        assert!(builder.updater(&UpdaterSpec::Sgd { learning_rate: 0. }).is_err());
        assert!(builder.updater(&UpdaterSpec::Ema { momentum: 1. }).is_err());
        assert!(
            builder
                .updater(&UpdaterSpec::Adam {
                    learning_rate: 0.1,
                    beta1: 1.,
                    beta2: 0.999,
                    epsilon: 1e-8
                })
                .is_err()
        );
        assert!(
            builder
                .initializer(&InitializerSpec::Normal {
                    mean: 0.,
                    variance: -1.
                })
                .is_err()
        );
        assert!(
            builder
                .initializer(&InitializerSpec::Xavier {
                    activation: "swish".to_string(),
                    distribution: "uniform".to_string()
                })
                .is_err()
        );
    }

    #[test]
    fn zero_partitions_are_rejected() {
        let mut config =
            ModelConfig::from_json(r#"{"updater": {"sgd": {"learning_rate": 0.1}}}"#).unwrap();
        let builder = StrategyBuilder::new(None);

        assert_eq!(builder.defaults(&config).unwrap().partition_count, 8);

        config.partition_count = 0;
        assert!(matches!(
            builder.defaults(&config),
            Err(PsErr::InvalidArgument { .. })
        ));
    }
}
