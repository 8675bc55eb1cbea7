use serde::{Deserialize, Serialize};

/// The specification for the `Updater` trait.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdaterSpec {
    Sgd {
        learning_rate: f32,
    },
    #[serde(rename = "adagrad")]
    AdaGrad {
        learning_rate: f32,
        #[serde(default)]
        float_stable_eps: f32,
        #[serde(default)]
        l2: f32,
    },
    Adam {
        learning_rate: f32,
        #[serde(default = "default_beta1")]
        beta1: f32,
        #[serde(default = "default_beta2")]
        beta2: f32,
        #[serde(default = "default_epsilon")]
        epsilon: f32,
    },
    Ftrl {
        #[serde(default = "default_l1")]
        l1: f32,
        #[serde(default = "default_ftrl_l2")]
        l2: f32,
        #[serde(default = "default_alpha")]
        alpha: f32,
        #[serde(default = "default_beta")]
        beta: f32,
    },
    Ema {
        #[serde(default = "default_momentum")]
        momentum: f32,
    },
}

fn default_beta1() -> f32 {
    0.9
}

fn default_beta2() -> f32 {
    0.999
}

fn default_epsilon() -> f32 {
    1e-8
}

fn default_l1() -> f32 {
    1.
}

fn default_ftrl_l2() -> f32 {
    120.
}

fn default_alpha() -> f32 {
    0.5
}

fn default_beta() -> f32 {
    1.
}

fn default_momentum() -> f32 {
    0.1
}
