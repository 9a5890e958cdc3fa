//! Components to build a neural network

use std::{
    cell::RefCell,
    sync::atomic::{self, AtomicUsize},
};

use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64Mcg;
use thiserror::Error;

use crate::{init::Init, values::Value};

/// Errors for the neural network
#[derive(Debug, Error)]
pub enum NNError {
    #[error("Input size mismatch: expected {expected}, got {got}")]
    InputSizeMismatch { expected: usize, got: usize },
}

/// Represents the torch.nn.Module. NNs should implement this trait.
/// <https://github.com/pytorch/pytorch/blob/v2.6.0/torch/nn/modules/module.py#L402>
pub trait Module {
    fn zero_grad(&mut self) {
        for p in self.parameters().iter_mut() {
            p.zero_grad();
        }
    }

    fn parameters(&self) -> Vec<Value>;
    fn forward(&self, inputs: &[Value]) -> Result<Vec<Value>, NNError>;

    /// Forward pass over a mini batch. Only layers which look across samples (batch norm)
    /// need to override this
    fn forward_batch(&self, batch: &[Vec<Value>]) -> Result<Vec<Vec<Value>>, NNError> {
        batch.iter().map(|inputs| self.forward(inputs)).collect()
    }

    /// Switches between training and evaluation behaviour (dropout, batch statistics)
    fn set_training(&mut self, _training: bool) {}

    /// Short name of the layer type, e.g. `Linear`
    fn name(&self) -> &'static str;
}

/// A single neuron in a layer of a NN
pub struct Neuron {
    /// weights of the neuron
    pub weights: Vec<Value>,
    /// bias of the neuron
    pub bias: Value,
}

impl Neuron {
    fn from_weights(weights: Vec<f32>, bias: f32) -> Self {
        Self {
            weights: weights.into_iter().map(Value::new).collect(),
            bias: Value::new(bias),
        }
    }

    // Testing utility for a deterministic and simple neuron
    #[cfg(test)]
    fn new_ones(n_inputs: usize) -> Self {
        Self::from_weights(vec![1.0; n_inputs], 1.0)
    }

    pub fn parameters(&self) -> Vec<Value> {
        self.weights
            .iter()
            .chain(std::iter::once(&self.bias))
            .cloned()
            .collect()
    }

    pub fn forward(&self, inputs: &[Value]) -> Result<Value, NNError> {
        if inputs.len() != self.weights.len() {
            return Err(NNError::InputSizeMismatch {
                expected: self.weights.len(),
                got: inputs.len(),
            });
        }
        let output = self
            .weights
            .iter()
            .zip(inputs.iter())
            .map(|(w, i)| w * i)
            .sum::<Value>();
        let output = &output + &self.bias;
        Ok(output)
    }
}

/// Fully connected layer, `y = Wx + b`
pub struct Linear {
    neurons: Vec<Neuron>,
    n_inputs: usize,
    n_output_nans: AtomicUsize,
}

impl Linear {
    /// Creates a new layer with weights drawn from `init` and zero biases
    pub fn with_init<R: Rng + ?Sized>(
        n_inputs: usize,
        n_outputs: usize,
        init: Init,
        rng: &mut R,
    ) -> Self {
        let neurons = init
            .sample(n_inputs, n_outputs, rng)
            .into_iter()
            .map(|weights| Neuron::from_weights(weights, 0.0))
            .collect();
        Self::from_neurons(neurons, n_inputs)
    }

    fn from_neurons(neurons: Vec<Neuron>, n_inputs: usize) -> Self {
        Self {
            neurons,
            n_inputs,
            n_output_nans: AtomicUsize::new(0),
        }
    }

    #[cfg(test)]
    pub(crate) fn new_ones(n_inputs: usize, n_outputs: usize) -> Self {
        let neurons = (0..n_outputs).map(|_| Neuron::new_ones(n_inputs)).collect();
        Self::from_neurons(neurons, n_inputs)
    }

    pub fn fan_in(&self) -> usize {
        self.n_inputs
    }

    pub fn fan_out(&self) -> usize {
        self.neurons.len()
    }

    /// Number of NaN outputs in the last forward pass (used for debugging)
    pub fn n_output_nans(&self) -> usize {
        self.n_output_nans.load(atomic::Ordering::Relaxed)
    }
}

impl Module for Linear {
    /// Returns all the parameters in the layer
    fn parameters(&self) -> Vec<Value> {
        self.neurons.iter().flat_map(|n| n.parameters()).collect()
    }

    fn forward(&self, inputs: &[Value]) -> Result<Vec<Value>, NNError> {
        let outputs = self
            .neurons
            .iter()
            .map(|n| n.forward(inputs))
            .collect::<Result<Vec<_>, _>>()?;
        let n_output_nans = outputs.iter().filter(|v| v.data().is_nan()).count();
        self.n_output_nans
            .store(n_output_nans, atomic::Ordering::Relaxed);
        if log::log_enabled!(log::Level::Debug) {
            let n_parameters_nans = self
                .parameters()
                .iter()
                .filter(|v| v.data().is_nan())
                .count();
            log::debug!(
                "n_output_nans: {}, n_parameters_nans: {}",
                n_output_nans,
                n_parameters_nans
            );
        }
        Ok(outputs)
    }

    fn name(&self) -> &'static str {
        "Linear"
    }
}

/// Chains modules, feeding each output into the next
#[derive(Default)]
pub struct Sequential {
    layers: Vec<Box<dyn Module>>,
}

impl Sequential {
    pub fn new() -> Self {
        Self { layers: Vec::new() }
    }

    pub fn push(&mut self, layer: Box<dyn Module>) {
        self.layers.push(layer);
    }

    /// Moves all layers of `other` to the end of this sequence
    pub fn append(&mut self, other: Sequential) {
        self.layers.extend(other.layers);
    }

    pub fn layers(&self) -> &[Box<dyn Module>] {
        &self.layers
    }

    /// Names of the contained layers in order
    pub fn layer_names(&self) -> Vec<&'static str> {
        self.layers.iter().map(|l| l.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

impl Module for Sequential {
    fn parameters(&self) -> Vec<Value> {
        self.layers.iter().flat_map(|l| l.parameters()).collect()
    }

    fn forward(&self, inputs: &[Value]) -> Result<Vec<Value>, NNError> {
        let mut x = inputs.to_vec();
        for layer in self.layers.iter() {
            x = layer.forward(&x)?;
        }
        Ok(x)
    }

    fn forward_batch(&self, batch: &[Vec<Value>]) -> Result<Vec<Vec<Value>>, NNError> {
        let mut x = batch.to_vec();
        for layer in self.layers.iter() {
            x = layer.forward_batch(&x)?;
        }
        Ok(x)
    }

    fn set_training(&mut self, training: bool) {
        for layer in self.layers.iter_mut() {
            layer.set_training(training);
        }
    }

    fn name(&self) -> &'static str {
        "Sequential"
    }
}

/// Zeroes inputs with probability `p` during training and rescales the survivors by `1 / (1 - p)`
pub struct Dropout {
    p: f32,
    training: bool,
    rng: RefCell<Pcg64Mcg>,
}

impl Dropout {
    /// The mask generator is seeded from `rng`
    pub fn new<R: Rng + ?Sized>(p: f32, rng: &mut R) -> Self {
        Self {
            p,
            training: true,
            rng: RefCell::new(Pcg64Mcg::seed_from_u64(rng.random())),
        }
    }
}

impl Module for Dropout {
    fn parameters(&self) -> Vec<Value> {
        vec![]
    }

    fn forward(&self, inputs: &[Value]) -> Result<Vec<Value>, NNError> {
        if !self.training || self.p == 0.0 {
            return Ok(inputs.to_vec());
        }
        let keep_prob = 1.0 - self.p;
        let mut rng = self.rng.borrow_mut();
        Ok(inputs
            .iter()
            .map(|v| {
                if rng.random::<f32>() < keep_prob {
                    v.scale(1.0 / keep_prob)
                } else {
                    v.scale(0.0)
                }
            })
            .collect())
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn name(&self) -> &'static str {
        "Dropout"
    }
}

/// Negative saturation value of SELU, `-scale * alpha`
const SELU_NEG_SATURATION: f32 = -1.758_099_3;

/// Dropout for self-normalising (SELU) networks
///
/// Dropped inputs are set to SELU's negative saturation value instead of zero, followed by an
/// affine correction so that zero mean and unit variance inputs keep their mean and variance.
/// <https://arxiv.org/abs/1706.02515>
pub struct AlphaDropout {
    p: f32,
    training: bool,
    rng: RefCell<Pcg64Mcg>,
}

impl AlphaDropout {
    pub fn new<R: Rng + ?Sized>(p: f32, rng: &mut R) -> Self {
        Self {
            p,
            training: true,
            rng: RefCell::new(Pcg64Mcg::seed_from_u64(rng.random())),
        }
    }

    /// Affine correction `(a, b)` applied after masking
    fn affine(&self) -> (f32, f32) {
        let alpha = SELU_NEG_SATURATION;
        let q = 1.0 - self.p;
        let a = 1.0 / (q * (1.0 + self.p * alpha * alpha)).sqrt();
        let b = -a * alpha * self.p;
        (a, b)
    }
}

impl Module for AlphaDropout {
    fn parameters(&self) -> Vec<Value> {
        vec![]
    }

    fn forward(&self, inputs: &[Value]) -> Result<Vec<Value>, NNError> {
        if !self.training || self.p == 0.0 {
            return Ok(inputs.to_vec());
        }
        let keep_prob = 1.0 - self.p;
        let (a, b) = self.affine();
        let mut rng = self.rng.borrow_mut();
        Ok(inputs
            .iter()
            .map(|v| {
                if rng.random::<f32>() < keep_prob {
                    &v.scale(a) + &Value::new(b)
                } else {
                    Value::new(a * SELU_NEG_SATURATION + b)
                }
            })
            .collect())
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn name(&self) -> &'static str {
        "AlphaDropout"
    }
}

/// Batch normalisation over the features of flat inputs
///
/// In training mode mini batches are normalised with their own statistics and the running
/// statistics are updated. Single samples, and every input in evaluation mode, use the
/// running statistics.
pub struct BatchNorm1d {
    num_features: usize,
    eps: f32,
    momentum: f32,
    training: bool,
    gamma: Vec<Value>,
    beta: Vec<Value>,
    running_mean: RefCell<Vec<f32>>,
    running_var: RefCell<Vec<f32>>,
}

impl BatchNorm1d {
    pub fn new(num_features: usize) -> Self {
        Self {
            num_features,
            eps: 1e-5,
            momentum: 0.1,
            training: true,
            gamma: (0..num_features).map(|_| Value::new(1.0)).collect(),
            beta: (0..num_features).map(|_| Value::new(0.0)).collect(),
            running_mean: RefCell::new(vec![0.0; num_features]),
            running_var: RefCell::new(vec![1.0; num_features]),
        }
    }

    pub fn running_mean(&self) -> Vec<f32> {
        self.running_mean.borrow().clone()
    }

    pub fn running_var(&self) -> Vec<f32> {
        self.running_var.borrow().clone()
    }

    fn check_size(&self, inputs: &[Value]) -> Result<(), NNError> {
        if inputs.len() != self.num_features {
            return Err(NNError::InputSizeMismatch {
                expected: self.num_features,
                got: inputs.len(),
            });
        }
        Ok(())
    }

    fn normalise(&self, x: &Value, mean: &Value, var: &Value, feature: usize) -> Value {
        let std = (var + &Value::new(self.eps)).pow(&Value::new(0.5));
        let x_hat = &(x - mean) / &std;
        &(&x_hat * &self.gamma[feature]) + &self.beta[feature]
    }
}

impl Module for BatchNorm1d {
    fn parameters(&self) -> Vec<Value> {
        self.gamma.iter().chain(self.beta.iter()).cloned().collect()
    }

    fn forward(&self, inputs: &[Value]) -> Result<Vec<Value>, NNError> {
        self.check_size(inputs)?;
        let running_mean = self.running_mean.borrow();
        let running_var = self.running_var.borrow();
        Ok(inputs
            .iter()
            .enumerate()
            .map(|(j, x)| {
                self.normalise(
                    x,
                    &Value::new(running_mean[j]),
                    &Value::new(running_var[j]),
                    j,
                )
            })
            .collect())
    }

    fn forward_batch(&self, batch: &[Vec<Value>]) -> Result<Vec<Vec<Value>>, NNError> {
        if !self.training || batch.len() < 2 {
            return batch.iter().map(|inputs| self.forward(inputs)).collect();
        }
        for inputs in batch.iter() {
            self.check_size(inputs)?;
        }
        let n = batch.len() as f32;
        let mut outputs = vec![Vec::with_capacity(self.num_features); batch.len()];
        for j in 0..self.num_features {
            let mean = batch.iter().map(|x| x[j].clone()).sum::<Value>() / Value::new(n);
            let var = batch
                .iter()
                .map(|x| (&x[j] - &mean).pow(&Value::new(2.0)))
                .sum::<Value>()
                / Value::new(n);

            {
                let mut running_mean = self.running_mean.borrow_mut();
                let mut running_var = self.running_var.borrow_mut();
                let m = self.momentum;
                running_mean[j] = (1.0 - m) * running_mean[j] + m * mean.data();
                // running variance tracks the unbiased estimate
                running_var[j] = (1.0 - m) * running_var[j] + m * var.data() * n / (n - 1.0);
            }

            for (i, x) in batch.iter().enumerate() {
                outputs[i].push(self.normalise(&x[j], &mean, &var, j));
            }
        }
        Ok(outputs)
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn name(&self) -> &'static str {
        "BatchNorm1d"
    }
}

#[cfg(test)]
mod tests {
    use crate::assert_eq_float;

    use super::*;

    fn rng() -> Pcg64Mcg {
        Pcg64Mcg::seed_from_u64(3)
    }

    fn values(data: &[f32]) -> Vec<Value> {
        data.iter().map(|&v| Value::new(v)).collect()
    }

    #[test]
    fn test_layer_forward() {
        let layer = Linear::new_ones(2, 3);
        let inputs = vec![Value::new(1.0), Value::new(2.0)];
        let outputs = layer.forward(&inputs).unwrap();
        assert_eq!(outputs.len(), 3);
        assert_eq!(outputs[0].data(), 4.0);
        assert_eq!(outputs[1].data(), 4.0);
        assert_eq!(outputs[2].data(), 4.0);
        assert_eq!(layer.n_output_nans(), 0);
    }

    #[test]
    fn test_dim_mismatch() {
        let layer = Linear::new_ones(2, 3);
        let inputs = vec![Value::new(1.0)];
        let outputs = layer.forward(&inputs).unwrap_err();
        assert!(matches!(
            outputs,
            NNError::InputSizeMismatch {
                expected: 2,
                got: 1
            }
        ));
    }

    #[test]
    fn test_linear_shape_and_zero_bias() {
        let layer = Linear::with_init(4, 3, Init::GlorotNormal, &mut rng());
        assert_eq!(layer.fan_in(), 4);
        assert_eq!(layer.fan_out(), 3);
        assert_eq!(layer.parameters().len(), 3 * (4 + 1));
        assert!(layer.parameters().iter().any(|p| p.data() != 0.0));

        let outputs = layer.forward(&values(&[0.0; 4])).unwrap();
        assert!(outputs.iter().all(|v| v.data() == 0.0));
    }

    #[test]
    fn test_sequential_chains_layers() {
        let mut seq = Sequential::new();
        seq.push(Box::new(Linear::new_ones(2, 3)));
        seq.push(Box::new(Linear::new_ones(3, 1)));
        assert_eq!(seq.layer_names(), vec!["Linear", "Linear"]);
        assert_eq!(seq.parameters().len(), 3 * 3 + 4);

        // (1 + 2 + 1) = 4 per hidden unit, 3 * 4 + 1 = 13
        let outputs = seq.forward(&values(&[1.0, 2.0])).unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].data(), 13.0);

        let batch = vec![values(&[1.0, 2.0]), values(&[0.0, 0.0])];
        let outputs = seq.forward_batch(&batch).unwrap();
        assert_eq!(outputs[0][0].data(), 13.0);
        assert_eq!(outputs[1][0].data(), 4.0);
    }

    #[test]
    fn test_dropout_train_and_eval() {
        let mut dropout = Dropout::new(0.5, &mut rng());
        let inputs = values(&[1.0; 1000]);
        let outputs = dropout.forward(&inputs).unwrap();
        assert!(outputs.iter().all(|v| v.data() == 0.0 || v.data() == 2.0));
        let n_dropped = outputs.iter().filter(|v| v.data() == 0.0).count();
        assert!(n_dropped > 350 && n_dropped < 650);

        dropout.set_training(false);
        let outputs = dropout.forward(&inputs).unwrap();
        assert!(outputs.iter().all(|v| v.data() == 1.0));
    }

    #[test]
    fn test_dropout_masks_follow_seed() {
        let inputs = values(&[1.0; 64]);
        let mask = |seed: u64| {
            let dropout = Dropout::new(0.5, &mut Pcg64Mcg::seed_from_u64(seed));
            dropout
                .forward(&inputs)
                .unwrap()
                .iter()
                .map(|v| v.data())
                .collect::<Vec<_>>()
        };
        assert_eq!(mask(9), mask(9));
        assert_ne!(mask(9), mask(10));
    }

    #[test]
    fn test_alpha_dropout_preserves_moments() {
        use rand_distr::{Distribution, StandardNormal};

        let dropout = AlphaDropout::new(0.2, &mut rng());
        let mut rng = rng();
        let data = (0..20000)
            .map(|_| StandardNormal.sample(&mut rng))
            .collect::<Vec<f32>>();
        let outputs = dropout.forward(&values(&data)).unwrap();
        let n = outputs.len() as f32;
        let mean = outputs.iter().map(|v| v.data()).sum::<f32>() / n;
        let var = outputs
            .iter()
            .map(|v| (v.data() - mean).powi(2))
            .sum::<f32>()
            / n;
        assert!(mean.abs() < 0.05, "mean {}", mean);
        assert!((var - 1.0).abs() < 0.05, "var {}", var);
    }

    #[test]
    fn test_alpha_dropout_gradient_flows_through_kept_units() {
        let dropout = AlphaDropout::new(0.5, &mut rng());
        let (a, _) = dropout.affine();
        let x = Value::new(1.0);
        let outputs = dropout.forward(std::slice::from_ref(&x)).unwrap();
        outputs[0].backward();
        assert!(x.grad() == 0.0 || (x.grad() - a).abs() < 1e-6);
    }

    #[test]
    fn test_batch_norm_batch_statistics() {
        let bn = BatchNorm1d::new(2);
        let batch = vec![values(&[1.0, 10.0]), values(&[3.0, 10.0])];
        let outputs = bn.forward_batch(&batch).unwrap();
        // feature 0: mean 2, var 1
        assert_eq_float!(outputs[0][0].data(), -1.0 / (1.0f32 + 1e-5).sqrt());
        assert_eq_float!(outputs[1][0].data(), 1.0 / (1.0f32 + 1e-5).sqrt());
        // feature 1: constant
        assert_eq_float!(outputs[0][1].data(), 0.0);

        // running stats move 10% toward the batch, variance unbiased
        assert_eq_float!(bn.running_mean()[0], 0.2);
        assert_eq_float!(bn.running_mean()[1], 1.0);
        assert_eq_float!(bn.running_var()[0], 0.9 + 0.1 * 2.0);
    }

    #[test]
    fn test_batch_norm_eval_uses_running_stats() {
        let mut bn = BatchNorm1d::new(1);
        bn.set_training(false);
        let batch = vec![values(&[1.0]), values(&[3.0])];
        let outputs = bn.forward_batch(&batch).unwrap();
        assert_eq_float!(outputs[0][0].data(), 1.0 / (1.0f32 + 1e-5).sqrt());
        assert_eq_float!(bn.running_mean()[0], 0.0);
        assert_eq!(bn.parameters().len(), 2);
    }
}
