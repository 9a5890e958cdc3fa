//! Loss function(s)

use std::fmt::{self, Display};

use clap::ValueEnum;

use crate::values::Value;

/// Probabilities are clamped into `[EPS, 1 - EPS]` before taking logs
const EPS: f32 = 1e-7;

/// Mean Squared Error Loss between two vectors of values
pub struct MSELoss;

impl MSELoss {
    pub fn call<T, U>(y_pred: &[T], y_true: &[U]) -> Value
    where
        T: AsRef<Value>,
        U: AsRef<Value>,
    {
        let loss = y_pred
            .iter()
            .zip(y_true.iter())
            .map(|(a, b)| (a.as_ref() - b.as_ref()).pow(&Value::new(2.0)))
            .sum::<Value>();
        loss / Value::new(y_pred.len() as f32)
    }
}

/// Binary Cross Entropy between predicted probabilities and targets in `[0, 1]`
pub struct BCELoss;

impl BCELoss {
    pub fn call<T, U>(y_pred: &[T], y_true: &[U]) -> Value
    where
        T: AsRef<Value>,
        U: AsRef<Value>,
    {
        let one = Value::new(1.0);
        let loss = y_pred
            .iter()
            .zip(y_true.iter())
            .map(|(p, t)| {
                let p = p.as_ref().clamp(EPS, 1.0 - EPS);
                let t = t.as_ref();
                &(t * &p.ln()) + &(&(&one - t) * &(&one - &p).ln())
            })
            .sum::<Value>();
        -&(loss / Value::new(y_pred.len() as f32))
    }
}

/// Negative Log Likelihood of log-probabilities against a one hot encoded target
pub struct NLLLoss;

impl NLLLoss {
    pub fn call<T, U>(log_probs: &[T], y_true: &[U]) -> Value
    where
        T: AsRef<Value>,
        U: AsRef<Value>,
    {
        let likelihood = log_probs
            .iter()
            .zip(y_true.iter())
            .map(|(p, t)| p.as_ref() * t.as_ref())
            .sum::<Value>();
        -&likelihood
    }
}

/// Selects one of the losses, chosen from the objective or given explicitly
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Loss {
    /// Mean squared error, for regression
    Mse,
    /// Binary cross entropy, expects sigmoid outputs
    Bce,
    /// Negative log likelihood, expects log-softmax outputs
    Nll,
}

impl Loss {
    /// Loss of a single sample
    pub fn call<T, U>(&self, y_pred: &[T], y_true: &[U]) -> Value
    where
        T: AsRef<Value>,
        U: AsRef<Value>,
    {
        match self {
            Loss::Mse => MSELoss::call(y_pred, y_true),
            Loss::Bce => BCELoss::call(y_pred, y_true),
            Loss::Nll => NLLLoss::call(y_pred, y_true),
        }
    }

    /// Mean loss over a batch of samples
    pub fn batch_mean<T, U>(&self, y_pred: &[Vec<T>], y_true: &[Vec<U>]) -> Value
    where
        T: AsRef<Value>,
        U: AsRef<Value>,
    {
        let total = y_pred
            .iter()
            .zip(y_true.iter())
            .map(|(p, t)| self.call(p, t))
            .sum::<Value>();
        total / Value::new(y_pred.len().max(1) as f32)
    }
}

impl Display for Loss {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Loss::Mse => write!(f, "mse"),
            Loss::Bce => write!(f, "bce"),
            Loss::Nll => write!(f, "nll"),
        }
    }
}
