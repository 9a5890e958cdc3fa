//! Typed configuration for the model builder
//!
//! Each configuration can be built directly or parsed from a flat mapping of string keys to
//! string values (e.g. `width=50`). Keys are matched case-insensitively, unknown keys are
//! ignored and missing keys fall back to the defaults.

use std::{
    fmt::{self, Display},
    str::FromStr,
};

use thiserror::Error;

use crate::activations::Activation;

/// Errors raised while resolving a configuration, always before anything is built
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("Optimiser '{0}' not currently available, expected one of: adam, sgd")]
    UnsupportedOptimizer(String),
    #[error("Unrecognised objective '{0}'")]
    UnknownObjective(String),
    #[error("Unrecognised activation '{0}'")]
    UnknownActivation(String),
    #[error("Invalid value '{value}' for '{key}'")]
    InvalidValue { key: String, value: String },
    #[error("Dropout probability must be in [0, 1), got {0}")]
    DropoutOutOfRange(f32),
    #[error("Unrecognised optimiser argument '{0}'")]
    UnknownOptimizerArg(String),
}

/// The task a network is trained for, selects the output activation and the default loss
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Objective {
    BinaryClassification,
    MulticlassClassification,
    Regression,
}

impl Objective {
    pub fn is_classification(&self) -> bool {
        !matches!(self, Objective::Regression)
    }
}

impl FromStr for Objective {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalised = s.trim().to_lowercase().replace(['-', '_'], " ");
        let normalised = normalised.split_whitespace().collect::<Vec<_>>().join(" ");
        match normalised.as_str() {
            "regression" | "regressor" => Ok(Objective::Regression),
            "classification" | "classifier" | "binary" | "binary classification"
            | "binary classifier" => Ok(Objective::BinaryClassification),
            "multiclass" | "multi class" | "multiclass classification"
            | "multi class classification" | "multiclass classifier"
            | "multi class classifier" => Ok(Objective::MulticlassClassification),
            _ => Err(ConfigError::UnknownObjective(s.to_string())),
        }
    }
}

impl Display for Objective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Objective::BinaryClassification => write!(f, "binary classification"),
            Objective::MulticlassClassification => write!(f, "multiclass classification"),
            Objective::Regression => write!(f, "regression"),
        }
    }
}

/// Architecture hyperparameters
#[derive(Debug, Clone, PartialEq)]
pub struct ModelConfig {
    /// Number of neurons in every hidden layer
    pub width: usize,
    /// Number of hidden layers, including the head
    pub depth: usize,
    /// Dropout probability, 0 disables dropout
    pub dropout: f32,
    pub batch_norm: bool,
    pub activation: Activation,
    /// Residual skip connections in the body
    pub residual: bool,
    /// Dense (concatenating) connections in the body
    pub dense: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            width: 100,
            depth: 4,
            dropout: 0.0,
            batch_norm: false,
            activation: Activation::ReLU,
            residual: false,
            dense: false,
        }
    }
}

impl ModelConfig {
    /// Parses a flat mapping, recognised keys are `width`, `depth`, `do`, `bn`, `act`, `res`
    /// and `dense`
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::default();
        for (key, value) in pairs {
            let key = key.as_ref().to_lowercase();
            let value = value.as_ref();
            match key.as_str() {
                "width" => config.width = parse_value(&key, value)?,
                "depth" => config.depth = parse_value(&key, value)?,
                "do" => config.dropout = parse_value(&key, value)?,
                "bn" => config.batch_norm = parse_bool(&key, value)?,
                "act" => config.activation = value.parse()?,
                "res" => config.residual = parse_bool(&key, value)?,
                "dense" => config.dense = parse_bool(&key, value)?,
                _ => log::debug!("Ignoring unknown model argument '{}'", key),
            }
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(ConfigError::DropoutOutOfRange(self.dropout));
        }
        Ok(())
    }
}

/// Supported optimisers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OptimizerKind {
    #[default]
    Adam,
    Sgd,
}

impl FromStr for OptimizerKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "adam" => Ok(OptimizerKind::Adam),
            "sgd" => Ok(OptimizerKind::Sgd),
            _ => Err(ConfigError::UnsupportedOptimizer(s.to_string())),
        }
    }
}

impl Display for OptimizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptimizerKind::Adam => write!(f, "adam"),
            OptimizerKind::Sgd => write!(f, "sgd"),
        }
    }
}

/// Optimiser kind and its hyperparameters. Hyperparameters irrelevant to the selected kind
/// are carried but unused (e.g. `momentum` for Adam)
#[derive(Debug, Clone, PartialEq)]
pub struct OptimizerConfig {
    pub kind: OptimizerKind,
    pub lr: f32,
    /// SGD momentum
    pub momentum: f32,
    /// Adam decay rate for the first moment
    pub beta1: f32,
    /// Adam decay rate for the second moment
    pub beta2: f32,
    pub eps: f32,
    /// L2 penalty added to the gradients
    pub weight_decay: f32,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            kind: OptimizerKind::Adam,
            lr: 1e-3,
            momentum: 0.0,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.0,
        }
    }
}

impl OptimizerConfig {
    /// Parses a flat mapping, `opt` selects the optimiser and the remaining keys (`lr`,
    /// `momentum`, `beta1`, `beta2`, `eps`, `weight_decay`) set its hyperparameters. Any other
    /// key is an error
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::default();
        for (key, value) in pairs {
            let key = key.as_ref().to_lowercase();
            let value = value.as_ref();
            match key.as_str() {
                "opt" => config.kind = value.parse()?,
                "lr" => config.lr = parse_value(&key, value)?,
                "momentum" => config.momentum = parse_value(&key, value)?,
                "beta1" => config.beta1 = parse_value(&key, value)?,
                "beta2" => config.beta2 = parse_value(&key, value)?,
                "eps" => config.eps = parse_value(&key, value)?,
                "weight_decay" => config.weight_decay = parse_value(&key, value)?,
                _ => return Err(ConfigError::UnknownOptimizerArg(key)),
            }
        }
        Ok(config)
    }
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_objective_parsing() {
        assert_eq!(
            "Multiclass Classifier".parse::<Objective>(),
            Ok(Objective::MulticlassClassification)
        );
        assert_eq!(
            "multi-class_classification".parse::<Objective>(),
            Ok(Objective::MulticlassClassification)
        );
        assert_eq!(
            "classifier".parse::<Objective>(),
            Ok(Objective::BinaryClassification)
        );
        assert_eq!(" REGRESSION ".parse::<Objective>(), Ok(Objective::Regression));
        assert_eq!(
            "clustering".parse::<Objective>(),
            Err(ConfigError::UnknownObjective("clustering".to_string()))
        );
    }

    #[test]
    fn test_model_config_defaults() {
        let empty: [(&str, &str); 0] = [];
        let config = ModelConfig::from_pairs(empty).unwrap();
        assert_eq!(config, ModelConfig::default());
        assert_eq!(config.width, 100);
        assert_eq!(config.depth, 4);
        assert_eq!(config.dropout, 0.0);
        assert!(!config.batch_norm);
        assert_eq!(config.activation, Activation::ReLU);
        assert!(!config.residual);
        assert!(!config.dense);
    }

    #[test]
    fn test_model_config_keys_case_insensitive_and_unknown_ignored() {
        let config = ModelConfig::from_pairs([
            ("WIDTH", "32"),
            ("Depth", "2"),
            ("do", "0.1"),
            ("BN", "true"),
            ("act", "SELU"),
            ("res", "1"),
            ("colour", "blue"),
        ])
        .unwrap();
        assert_eq!(config.width, 32);
        assert_eq!(config.depth, 2);
        assert_eq!(config.dropout, 0.1);
        assert!(config.batch_norm);
        assert_eq!(config.activation, Activation::SELU);
        assert!(config.residual);
        assert!(!config.dense);
    }

    #[test]
    fn test_model_config_errors() {
        assert_eq!(
            ModelConfig::from_pairs([("width", "wide")]),
            Err(ConfigError::InvalidValue {
                key: "width".to_string(),
                value: "wide".to_string()
            })
        );
        assert_eq!(
            ModelConfig::from_pairs([("act", "gelu")]),
            Err(ConfigError::UnknownActivation("gelu".to_string()))
        );
        assert_eq!(
            ModelConfig::from_pairs([("do", "1.5")]),
            Err(ConfigError::DropoutOutOfRange(1.5))
        );
    }

    #[test]
    fn test_optimizer_config() {
        let config =
            OptimizerConfig::from_pairs([("OPT", "sgd"), ("lr", "0.1"), ("Momentum", "0.9")])
                .unwrap();
        assert_eq!(config.kind, OptimizerKind::Sgd);
        assert_eq!(config.lr, 0.1);
        assert_eq!(config.momentum, 0.9);

        let empty: [(&str, &str); 0] = [];
        let config = OptimizerConfig::from_pairs(empty).unwrap();
        assert_eq!(config, OptimizerConfig::default());
        assert_eq!(config.kind, OptimizerKind::Adam);
    }

    #[test]
    fn test_unsupported_optimizer() {
        assert_eq!(
            OptimizerConfig::from_pairs([("opt", "rmsprop")]),
            Err(ConfigError::UnsupportedOptimizer("rmsprop".to_string()))
        );
    }

    #[test]
    fn test_unknown_optimizer_arg() {
        assert_eq!(
            OptimizerConfig::from_pairs([("learning_rate", "0.5"), ("nesterov", "true")]),
            Err(ConfigError::UnknownOptimizerArg("learning_rate".to_string()))
        );
        assert_eq!(
            OptimizerConfig::from_pairs([("Nesterov", "true")]),
            Err(ConfigError::UnknownOptimizerArg("nesterov".to_string()))
        );
    }
}
