use serde::{Deserialize, Serialize};

/// The specification for the `Initializer` trait.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitializerSpec {
    /// Zero biases, unit normal noise elsewhere.
    #[default]
    Default,
    Zero,
    One,
    Normal {
        #[serde(default)]
        mean: f32,
        variance: f32,
    },
    Xavier {
        #[serde(default = "default_activation")]
        activation: String,
        #[serde(default = "default_distribution")]
        distribution: String,
    },
}

fn default_activation() -> String {
    "linear".to_string()
}

fn default_distribution() -> String {
    "uniform".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_unit_and_struct_variants() {
        let spec: InitializerSpec = serde_json::from_str(r#""zero""#).unwrap();
        assert_eq!(spec, InitializerSpec::Zero);

        let spec: InitializerSpec = serde_json::from_str(r#"{"xavier": {"activation": "relu"}}"#).unwrap();
        assert_eq!(
            spec,
            InitializerSpec::Xavier {
                activation: "relu".to_string(),
                distribution: "uniform".to_string()
            }
        );

        let spec: InitializerSpec = serde_json::from_str(r#"{"normal": {"variance": 0.5}}"#).unwrap();
        assert_eq!(
            spec,
            InitializerSpec::Normal {
                mean: 0.,
                variance: 0.5
            }
        );
    }
}
