//! Assembles a feed forward network, its optimiser and its loss from configuration
//!
//! The network is made of three stages: a head mapping the inputs to the hidden width, a body
//! of configurable depth produced by a [`BodyBuilder`], and a tail mapping to the outputs with
//! an activation chosen by the objective.

use std::cell::RefCell;

use rand::SeedableRng;
use rand_pcg::Pcg64Mcg;

use crate::{
    activations::{Activation, ActivationLookup, DefaultActivations},
    blocks::{Body, BodyBuilder, BodySpec, DenseBlock, FullyConnectedBuilder},
    config::{ConfigError, ModelConfig, Objective, OptimizerConfig, OptimizerKind},
    init::{DefaultInit, InitLookup},
    loss::Loss,
    nn::{Module, NNError, Sequential},
    optim::{Adam, Optim, SGD},
    values::Value,
};

/// A network built by [`ModelBuilder`]: head, body and tail applied in order
pub struct Network {
    pub head: Sequential,
    pub body: Box<dyn Body>,
    pub tail: Sequential,
    n_in: usize,
}

impl Network {
    /// Weights of the head's linear layer as a `width x n_in` matrix
    pub fn head_weights(&self) -> Vec<Vec<f32>> {
        let Some(linear) = self.head.layers().first() else {
            return vec![];
        };
        // neurons are laid out as their weights followed by their bias
        linear
            .parameters()
            .chunks(self.n_in + 1)
            .map(|neuron| neuron[..self.n_in].iter().map(|w| w.data()).collect())
            .collect()
    }

    /// One line description of the stages, for logging
    pub fn summary(&self) -> String {
        format!(
            "head: {:?}, body: {} (out {}), tail: {:?}, {} parameters",
            self.head.layer_names(),
            self.body.name(),
            self.body.out_size(),
            self.tail.layer_names(),
            self.parameters().len()
        )
    }
}

impl Module for Network {
    fn parameters(&self) -> Vec<Value> {
        self.head
            .parameters()
            .into_iter()
            .chain(self.body.parameters())
            .chain(self.tail.parameters())
            .collect()
    }

    fn forward(&self, inputs: &[Value]) -> Result<Vec<Value>, NNError> {
        let x = self.head.forward(inputs)?;
        let x = self.body.forward(&x)?;
        self.tail.forward(&x)
    }

    fn forward_batch(&self, batch: &[Vec<Value>]) -> Result<Vec<Vec<Value>>, NNError> {
        let x = self.head.forward_batch(batch)?;
        let x = self.body.forward_batch(&x)?;
        self.tail.forward_batch(&x)
    }

    fn set_training(&mut self, training: bool) {
        self.head.set_training(training);
        self.body.set_training(training);
        self.tail.set_training(training);
    }

    fn name(&self) -> &'static str {
        "Network"
    }
}

/// Default loss for an objective: NLL for multiclass classification with several outputs, BCE
/// for any other classification and MSE for regression
pub fn resolve_loss(objective: Objective, n_out: usize) -> Loss {
    match objective {
        Objective::MulticlassClassification if n_out > 1 => Loss::Nll,
        Objective::MulticlassClassification | Objective::BinaryClassification => Loss::Bce,
        Objective::Regression => Loss::Mse,
    }
}

/// Builds `(network, optimiser, loss)` triples from an objective, the input and output sizes and
/// the model and optimiser configurations
pub struct ModelBuilder {
    objective: Objective,
    n_in: usize,
    n_out: usize,
    model_config: ModelConfig,
    opt_config: OptimizerConfig,
    loss: Loss,
    body: Box<dyn BodyBuilder>,
    init: Box<dyn InitLookup>,
    acts: Box<dyn ActivationLookup>,
    /// Source of initial weights and dropout masks
    rng: RefCell<Pcg64Mcg>,
}

impl ModelBuilder {
    /// An explicit `loss` takes precedence over the one derived from the objective
    pub fn new(
        objective: Objective,
        n_in: usize,
        n_out: usize,
        model_config: ModelConfig,
        opt_config: OptimizerConfig,
        loss: Option<Loss>,
    ) -> Result<Self, ConfigError> {
        model_config.validate()?;
        let loss = loss.unwrap_or_else(|| resolve_loss(objective, n_out));
        log::debug!(
            "Model builder for {} ({} -> {}): {:?}, {:?}, loss {}",
            objective,
            n_in,
            n_out,
            model_config,
            opt_config,
            loss
        );
        Ok(Self {
            objective,
            n_in,
            n_out,
            model_config,
            opt_config,
            loss,
            body: Box::new(FullyConnectedBuilder),
            init: Box::new(DefaultInit),
            acts: Box::new(DefaultActivations),
            rng: RefCell::new(Pcg64Mcg::seed_from_u64(rand::random())),
        })
    }

    /// Builds from an objective label and flat key/value configurations, see
    /// [`ModelConfig::from_pairs`] and [`OptimizerConfig::from_pairs`]
    pub fn from_pairs<I, J, K, V>(
        objective: &str,
        n_in: usize,
        n_out: usize,
        model_args: I,
        opt_args: J,
        loss: Option<Loss>,
    ) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        J: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let objective = objective.parse()?;
        let model_config = ModelConfig::from_pairs(model_args)?;
        let opt_config = OptimizerConfig::from_pairs(opt_args)?;
        Self::new(objective, n_in, n_out, model_config, opt_config, loss)
    }

    /// Makes built networks reproducible: builders with the same seed and configuration
    /// produce identical weights and dropout masks
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = RefCell::new(Pcg64Mcg::seed_from_u64(seed));
        self
    }

    pub fn with_body(mut self, body: impl BodyBuilder + 'static) -> Self {
        self.body = Box::new(body);
        self
    }

    pub fn with_init_lookup(mut self, init: impl InitLookup + 'static) -> Self {
        self.init = Box::new(init);
        self
    }

    pub fn with_activation_lookup(mut self, acts: impl ActivationLookup + 'static) -> Self {
        self.acts = Box::new(acts);
        self
    }

    pub fn objective(&self) -> Objective {
        self.objective
    }

    pub fn loss(&self) -> Loss {
        self.loss
    }

    pub fn model_config(&self) -> &ModelConfig {
        &self.model_config
    }

    pub fn opt_config(&self) -> &OptimizerConfig {
        &self.opt_config
    }

    /// Linear layer, activation and, unless it is the output layer, the configured batch norm
    /// and dropout
    pub fn dense_block(
        &self,
        fan_in: usize,
        fan_out: usize,
        activation: Activation,
        output_layer: bool,
    ) -> Sequential {
        DenseBlock {
            fan_in,
            fan_out,
            activation,
            batch_norm: self.model_config.batch_norm,
            dropout: self.model_config.dropout,
            output_layer,
        }
        .build(
            self.init.as_ref(),
            self.acts.as_ref(),
            &mut *self.rng.borrow_mut(),
        )
    }

    pub fn head(&self) -> Sequential {
        self.dense_block(
            self.n_in,
            self.model_config.width,
            self.model_config.activation,
            false,
        )
    }

    pub fn body(&self, depth: usize) -> Box<dyn Body> {
        let spec = BodySpec {
            depth,
            width: self.model_config.width,
            dropout: self.model_config.dropout,
            batch_norm: self.model_config.batch_norm,
            activation: self.model_config.activation,
            residual: self.model_config.residual,
            dense: self.model_config.dense,
        };
        self.body.build(
            &spec,
            self.init.as_ref(),
            self.acts.as_ref(),
            &mut *self.rng.borrow_mut(),
        )
    }

    pub fn tail(&self, fan_in: usize) -> Sequential {
        let activation = match self.objective {
            Objective::MulticlassClassification => Activation::LogSoftmax,
            Objective::BinaryClassification => Activation::Sigmoid,
            Objective::Regression => Activation::Linear,
        };
        self.dense_block(fan_in, self.n_out, activation, true)
    }

    pub fn build_model(&self) -> Network {
        let head = self.head();
        // the head counts towards the depth
        let body = self.body(self.model_config.depth.saturating_sub(1));
        let tail = self.tail(body.out_size());
        let network = Network {
            head,
            body,
            tail,
            n_in: self.n_in,
        };
        log::debug!("Built network: {}", network.summary());
        network
    }

    pub fn build_optimizer(&self, model: &dyn Module) -> Box<dyn Optim> {
        let config = &self.opt_config;
        let params = model.parameters();
        match config.kind {
            OptimizerKind::Adam => Box::new(Adam::with_params(
                params,
                config.lr,
                config.beta1,
                config.beta2,
                config.eps,
                config.weight_decay,
            )),
            OptimizerKind::Sgd => Box::new(SGD::with_weight_decay(
                params,
                config.lr,
                config.momentum,
                config.weight_decay,
            )),
        }
    }

    /// Sets the learning rate of optimisers built from now on, existing ones keep theirs
    pub fn set_lr(&mut self, lr: f32) {
        self.opt_config.lr = lr;
    }

    pub fn get_model(&self) -> (Network, Box<dyn Optim>, Loss) {
        let model = self.build_model();
        let optim = self.build_optimizer(&model);
        (model, optim, self.loss)
    }
}

#[cfg(test)]
mod tests {
    use rand::RngCore;

    use crate::{blocks::BodySpec, init::Init, nn::Linear};

    use super::*;

    fn builder(objective: Objective, n_out: usize, width: usize) -> ModelBuilder {
        ModelBuilder::new(
            objective,
            3,
            n_out,
            ModelConfig {
                width,
                depth: 2,
                ..ModelConfig::default()
            },
            OptimizerConfig::default(),
            None,
        )
        .unwrap()
    }

    fn values(data: &[f32]) -> Vec<Value> {
        data.iter().map(|&v| Value::new(v)).collect()
    }

    #[test]
    fn test_defaults() {
        let empty: [(&str, &str); 0] = [];
        let builder =
            ModelBuilder::from_pairs("regression", 2, 1, empty, empty, None).unwrap();
        assert_eq!(builder.model_config(), &ModelConfig::default());
        assert_eq!(builder.opt_config().kind, OptimizerKind::Adam);

        let model = builder.build_model();
        // width 100, ReLU, no batch norm, no dropout
        assert_eq!(model.head.layer_names(), vec!["Linear", "ReLU"]);
        assert_eq!(model.head.parameters().len(), 100 * (2 + 1));
        // depth 4 is the head plus three body layers
        assert_eq!(model.body.out_size(), 100);
        assert_eq!(model.body.parameters().len(), 3 * 100 * 101);
        assert_eq!(model.tail.parameters().len(), 101);
        assert_eq!(model.head_weights().len(), 100);
        assert!(model.head_weights().iter().all(|row| row.len() == 2));
    }

    #[test]
    fn test_multiclass() {
        let builder = builder(Objective::MulticlassClassification, 5, 4);
        let (model, _, loss) = builder.get_model();
        assert_eq!(model.tail.layer_names(), vec!["Linear", "LogSoftmax"]);
        assert_eq!(loss, Loss::Nll);

        let outputs = model.forward(&values(&[0.1, 0.2, 0.3])).unwrap();
        assert_eq!(outputs.len(), 5);
        let total = outputs.iter().map(|v| v.data().exp()).sum::<f32>();
        assert!((total - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_multiclass_single_output_falls_back_to_bce() {
        let builder = builder(Objective::MulticlassClassification, 1, 4);
        assert_eq!(builder.loss(), Loss::Bce);
        assert_eq!(
            builder.build_model().tail.layer_names(),
            vec!["Linear", "LogSoftmax"]
        );
    }

    #[test]
    fn test_binary_classification() {
        for n_out in [1, 3] {
            let builder = builder(Objective::BinaryClassification, n_out, 4);
            let (model, _, loss) = builder.get_model();
            assert_eq!(model.tail.layer_names(), vec!["Linear", "Sigmoid"]);
            assert_eq!(loss, Loss::Bce);
            let outputs = model.forward(&values(&[0.1, 0.2, 0.3])).unwrap();
            assert!(outputs.iter().all(|v| v.data() > 0.0 && v.data() < 1.0));
        }
    }

    #[test]
    fn test_regression() {
        let builder = builder(Objective::Regression, 2, 4);
        let (model, _, loss) = builder.get_model();
        assert_eq!(model.tail.layer_names(), vec!["Linear"]);
        assert_eq!(loss, Loss::Mse);
    }

    #[test]
    fn test_loss_override() {
        let builder = ModelBuilder::new(
            Objective::MulticlassClassification,
            3,
            5,
            ModelConfig::default(),
            OptimizerConfig::default(),
            Some(Loss::Mse),
        )
        .unwrap();
        assert_eq!(builder.loss(), Loss::Mse);
    }

    #[test]
    fn test_unsupported_optimizer_fails_before_building() {
        let model_args = [("width", "8")];
        let opt_args = [("opt", "rmsprop")];
        let result = ModelBuilder::from_pairs("regression", 3, 1, model_args, opt_args, None);
        assert!(matches!(
            result,
            Err(ConfigError::UnsupportedOptimizer(ref kind)) if kind == "rmsprop"
        ));
    }

    #[test]
    fn test_unknown_objective() {
        let empty: [(&str, &str); 0] = [];
        let result = ModelBuilder::from_pairs("ranking", 3, 1, empty, empty, None);
        assert!(matches!(result, Err(ConfigError::UnknownObjective(_))));
    }

    #[test]
    fn test_set_lr() {
        let mut builder = builder(Objective::Regression, 1, 4);
        let model = builder.build_model();
        let before = builder.build_optimizer(&model);
        builder.set_lr(0.01);
        let after = builder.build_optimizer(&model);
        assert_eq!(after.lr(), 0.01);
        assert_eq!(before.lr(), 1e-3);
    }

    #[test]
    fn test_sgd_from_pairs() {
        let model_args = [("width", "4"), ("depth", "1")];
        let opt_args = [("opt", "sgd"), ("lr", "0.2"), ("momentum", "0.5")];
        let builder =
            ModelBuilder::from_pairs("Regression", 3, 1, model_args, opt_args, None).unwrap();
        let (model, optim, _) = builder.get_model();
        assert_eq!(optim.lr(), 0.2);
        assert_eq!(builder.opt_config().momentum, 0.5);
        // depth 1 leaves an empty body
        assert!(model.body.parameters().is_empty());
        assert_eq!(model.tail.parameters().len(), 4 + 1);
    }

    #[test]
    fn test_selu_dense_block_uses_alpha_dropout() {
        let builder = ModelBuilder::new(
            Objective::Regression,
            3,
            1,
            ModelConfig {
                dropout: 0.2,
                activation: Activation::SELU,
                ..ModelConfig::default()
            },
            OptimizerConfig::default(),
            None,
        )
        .unwrap();
        let block = builder.dense_block(3, 4, Activation::SELU, false);
        assert_eq!(block.layer_names(), vec!["Linear", "SELU", "AlphaDropout"]);
        let block = builder.dense_block(3, 4, Activation::ReLU, false);
        assert_eq!(block.layer_names(), vec!["Linear", "ReLU", "Dropout"]);
        let block = builder.dense_block(3, 4, Activation::SELU, true);
        assert_eq!(block.layer_names(), vec!["Linear", "SELU"]);
    }

    /// Body whose width differs from the configured one
    struct Bottleneck {
        layer: Linear,
    }

    impl Module for Bottleneck {
        fn parameters(&self) -> Vec<Value> {
            self.layer.parameters()
        }

        fn forward(&self, inputs: &[Value]) -> Result<Vec<Value>, NNError> {
            self.layer.forward(inputs)
        }

        fn name(&self) -> &'static str {
            "Bottleneck"
        }
    }

    impl Body for Bottleneck {
        fn out_size(&self) -> usize {
            self.layer.fan_out()
        }
    }

    struct BottleneckBuilder;

    impl BodyBuilder for BottleneckBuilder {
        fn build(
            &self,
            spec: &BodySpec,
            _init: &dyn InitLookup,
            _acts: &dyn ActivationLookup,
            rng: &mut dyn RngCore,
        ) -> Box<dyn Body> {
            Box::new(Bottleneck {
                layer: Linear::with_init(spec.width, 7, Init::GlorotNormal, rng),
            })
        }
    }

    #[test]
    fn test_tail_uses_body_out_size() {
        let builder = builder(Objective::Regression, 2, 4).with_body(BottleneckBuilder);
        let model = builder.build_model();
        assert_eq!(model.body.name(), "Bottleneck");
        assert_eq!(model.tail.parameters().len(), 2 * (7 + 1));
        let outputs = model.forward(&values(&[1.0, 2.0, 3.0])).unwrap();
        assert_eq!(outputs.len(), 2);
    }

    #[test]
    fn test_custom_lookups() {
        let builder = builder(Objective::Regression, 1, 4)
            .with_init_lookup(|_: Activation, _: usize, _: usize| Init::Normal { std: 0.0 })
            .with_activation_lookup(|_: Activation| -> Box<dyn Module> {
                Box::new(crate::activations::Tanh)
            });
        let model = builder.build_model();
        assert_eq!(model.head.layer_names(), vec!["Linear", "Tanh"]);
        let outputs = model.forward(&values(&[1.0, 2.0, 3.0])).unwrap();
        assert_eq!(outputs[0].data(), 0.0);
    }

    #[test]
    fn test_training_reduces_loss() {
        let builder = ModelBuilder::from_pairs(
            "regression",
            1,
            1,
            [("width", "8"), ("depth", "2"), ("act", "tanh")],
            [("lr", "0.05")],
            None,
        )
        .unwrap();
        let (model, mut optim, loss) = builder.get_model();
        let inputs = (0..16)
            .map(|i| values(&[i as f32 / 8.0 - 1.0]))
            .collect::<Vec<_>>();
        let targets = inputs
            .iter()
            .map(|x| values(&[2.0 * x[0].data() + 0.5]))
            .collect::<Vec<_>>();

        let mut losses = vec![];
        for _ in 0..100 {
            let preds = model.forward_batch(&inputs).unwrap();
            let batch_loss = loss.batch_mean(&preds, &targets);
            batch_loss.backward();
            optim.step();
            optim.zero_grad();
            losses.push(batch_loss.data());
        }
        assert!(losses[99] < losses[0] * 0.25, "{:?}", losses);
    }

    #[test]
    fn test_same_seed_builds_same_network() {
        let builder = |seed: u64| {
            ModelBuilder::from_pairs(
                "binary classification",
                3,
                1,
                [("width", "6"), ("depth", "3"), ("do", "0.2")],
                [("lr", "0.01")],
                None,
            )
            .unwrap()
            .with_seed(seed)
        };
        let (a, b, c) = (
            builder(42).build_model(),
            builder(42).build_model(),
            builder(43).build_model(),
        );
        assert_eq!(a.head_weights(), b.head_weights());
        assert_ne!(a.head_weights(), c.head_weights());
        let params = |n: &Network| n.parameters().iter().map(|p| p.data()).collect::<Vec<_>>();
        assert_eq!(params(&a), params(&b));

        // dropout masks follow the seed as well
        let inputs = values(&[0.4, -1.2, 2.0]);
        assert_eq!(
            a.forward(&inputs).unwrap()[0].data(),
            b.forward(&inputs).unwrap()[0].data()
        );
    }

    #[test]
    fn test_unknown_optimizer_arg_fails_before_building() {
        let model_args = [("width", "8")];
        let opt_args = [("learning_rate", "0.5")];
        let result = ModelBuilder::from_pairs("regression", 3, 1, model_args, opt_args, None);
        assert!(matches!(
            result,
            Err(ConfigError::UnknownOptimizerArg(ref key)) if key == "learning_rate"
        ));
    }
}
