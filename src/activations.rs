//! Activation functions and the lookup mapping an [`Activation`] to its module

use std::{
    fmt::{self, Display},
    str::FromStr,
    sync::atomic::{self, AtomicUsize},
};

use crate::{
    config::ConfigError,
    nn::{Module, NNError},
    values::Value,
};

/// SELU constants from <https://arxiv.org/abs/1706.02515>
const SELU_ALPHA: f32 = 1.673_263_2;
const SELU_SCALE: f32 = 1.050_701;

/// Supported activations, `Linear` is the identity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    ReLU,
    SELU,
    Sigmoid,
    Tanh,
    Swish,
    Softmax,
    LogSoftmax,
    Linear,
}

impl FromStr for Activation {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "relu" => Ok(Activation::ReLU),
            "selu" => Ok(Activation::SELU),
            "sigmoid" => Ok(Activation::Sigmoid),
            "tanh" => Ok(Activation::Tanh),
            "swish" => Ok(Activation::Swish),
            "softmax" => Ok(Activation::Softmax),
            "logsoftmax" => Ok(Activation::LogSoftmax),
            "linear" | "identity" => Ok(Activation::Linear),
            _ => Err(ConfigError::UnknownActivation(s.to_string())),
        }
    }
}

impl Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Activation::ReLU => write!(f, "relu"),
            Activation::SELU => write!(f, "selu"),
            Activation::Sigmoid => write!(f, "sigmoid"),
            Activation::Tanh => write!(f, "tanh"),
            Activation::Swish => write!(f, "swish"),
            Activation::Softmax => write!(f, "softmax"),
            Activation::LogSoftmax => write!(f, "logsoftmax"),
            Activation::Linear => write!(f, "linear"),
        }
    }
}

/// Builds the module for an activation
pub trait ActivationLookup {
    fn lookup(&self, activation: Activation) -> Box<dyn Module>;
}

impl<F> ActivationLookup for F
where
    F: Fn(Activation) -> Box<dyn Module>,
{
    fn lookup(&self, activation: Activation) -> Box<dyn Module> {
        self(activation)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultActivations;

impl ActivationLookup for DefaultActivations {
    fn lookup(&self, activation: Activation) -> Box<dyn Module> {
        match activation {
            Activation::ReLU => Box::new(ReLU::new()),
            Activation::SELU => Box::new(SELU),
            Activation::Sigmoid => Box::new(Sigmoid),
            Activation::Tanh => Box::new(Tanh),
            Activation::Swish => Box::new(Swish),
            Activation::Softmax => Box::new(Softmax),
            Activation::LogSoftmax => Box::new(LogSoftmax),
            Activation::Linear => Box::new(Identity),
        }
    }
}

/// Applies ReLU to a set of values, works for arbitrary number of inputs
#[derive(Default)]
pub struct ReLU {
    n_dead_neurons: AtomicUsize,
}

impl ReLU {
    pub fn new() -> Self {
        Self {
            n_dead_neurons: AtomicUsize::new(0),
        }
    }

    /// Returns the number of dead neurons in the layer (used for debugging)
    pub fn n_dead_neurons(&self) -> usize {
        self.n_dead_neurons.load(atomic::Ordering::Relaxed)
    }
}

impl Module for ReLU {
    fn parameters(&self) -> Vec<Value> {
        vec![]
    }

    /// Takes the element-wise ReLU of the input values
    fn forward(&self, inputs: &[Value]) -> Result<Vec<Value>, NNError> {
        let n_dead_neurons = inputs.iter().filter(|v| v.data() <= 0.0).count();
        self.n_dead_neurons
            .store(n_dead_neurons, atomic::Ordering::Relaxed);
        Ok(inputs.iter().map(|v| v.relu()).collect())
    }

    fn name(&self) -> &'static str {
        "ReLU"
    }
}

/// Scaled exponential linear unit
pub struct SELU;

impl Module for SELU {
    fn parameters(&self) -> Vec<Value> {
        vec![]
    }

    fn forward(&self, inputs: &[Value]) -> Result<Vec<Value>, NNError> {
        Ok(inputs
            .iter()
            .map(|v| {
                if v.data() > 0.0 {
                    v.scale(SELU_SCALE)
                } else {
                    (&v.exp() - &Value::new(1.0)).scale(SELU_SCALE * SELU_ALPHA)
                }
            })
            .collect())
    }

    fn name(&self) -> &'static str {
        "SELU"
    }
}

pub struct Sigmoid;

impl Module for Sigmoid {
    fn parameters(&self) -> Vec<Value> {
        vec![]
    }

    fn forward(&self, inputs: &[Value]) -> Result<Vec<Value>, NNError> {
        Ok(inputs.iter().map(|v| v.sigmoid()).collect())
    }

    fn name(&self) -> &'static str {
        "Sigmoid"
    }
}

pub struct Tanh;

impl Module for Tanh {
    fn parameters(&self) -> Vec<Value> {
        vec![]
    }

    fn forward(&self, inputs: &[Value]) -> Result<Vec<Value>, NNError> {
        Ok(inputs.iter().map(|v| v.tanh()).collect())
    }

    fn name(&self) -> &'static str {
        "Tanh"
    }
}

/// `x * sigmoid(x)`
pub struct Swish;

impl Module for Swish {
    fn parameters(&self) -> Vec<Value> {
        vec![]
    }

    fn forward(&self, inputs: &[Value]) -> Result<Vec<Value>, NNError> {
        Ok(inputs.iter().map(|v| v * &v.sigmoid()).collect())
    }

    fn name(&self) -> &'static str {
        "Swish"
    }
}

/// Applies softmax to a set of values
pub struct Softmax;

impl Module for Softmax {
    fn parameters(&self) -> Vec<Value> {
        vec![]
    }

    fn forward(&self, inputs: &[Value]) -> Result<Vec<Value>, NNError> {
        // shifting by the max is a constant offset, it leaves the result and gradients unchanged
        let shifted = shift_by_max(inputs);
        let exps = shifted.iter().map(|v| v.exp()).collect::<Vec<_>>();
        let exp_sum = exps.iter().cloned().sum::<Value>();
        Ok(exps.iter().map(|e| e / &exp_sum).collect())
    }

    fn name(&self) -> &'static str {
        "Softmax"
    }
}

/// `x_i - ln(sum_j exp(x_j))`, the log of softmax computed without taking the log of a
/// possibly underflowing probability
pub struct LogSoftmax;

impl Module for LogSoftmax {
    fn parameters(&self) -> Vec<Value> {
        vec![]
    }

    fn forward(&self, inputs: &[Value]) -> Result<Vec<Value>, NNError> {
        let shifted = shift_by_max(inputs);
        let log_sum_exp = shifted.iter().map(|v| v.exp()).sum::<Value>().ln();
        Ok(shifted.iter().map(|v| v - &log_sum_exp).collect())
    }

    fn name(&self) -> &'static str {
        "LogSoftmax"
    }
}

/// Passes inputs through unchanged
pub struct Identity;

impl Module for Identity {
    fn parameters(&self) -> Vec<Value> {
        vec![]
    }

    fn forward(&self, inputs: &[Value]) -> Result<Vec<Value>, NNError> {
        Ok(inputs.to_vec())
    }

    fn name(&self) -> &'static str {
        "Identity"
    }
}

fn shift_by_max(inputs: &[Value]) -> Vec<Value> {
    let max = inputs
        .iter()
        .map(|v| v.data())
        .fold(f32::NEG_INFINITY, f32::max);
    if !max.is_finite() {
        return inputs.to_vec();
    }
    let max = Value::new(max);
    inputs.iter().map(|v| v - &max).collect()
}
