//! Dense blocks and the network body built from them

use rand::RngCore;

use crate::{
    activations::{Activation, ActivationLookup},
    init::InitLookup,
    nn::{AlphaDropout, BatchNorm1d, Dropout, Linear, Module, NNError, Sequential},
    values::Value,
};

/// A single dense transformation: linear layer, activation, then optionally batch norm and
/// dropout when it is not the output layer
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DenseBlock {
    pub fan_in: usize,
    pub fan_out: usize,
    pub activation: Activation,
    pub batch_norm: bool,
    pub dropout: f32,
    pub output_layer: bool,
}

impl DenseBlock {
    /// Weights and dropout masks draw from `rng`
    pub fn build(
        &self,
        init: &dyn InitLookup,
        acts: &dyn ActivationLookup,
        rng: &mut dyn RngCore,
    ) -> Sequential {
        let mut block = Sequential::new();
        let scheme = init.lookup(self.activation, self.fan_in, self.fan_out);
        block.push(Box::new(Linear::with_init(
            self.fan_in,
            self.fan_out,
            scheme,
            rng,
        )));
        if self.activation != Activation::Linear {
            block.push(acts.lookup(self.activation));
        }
        if !self.output_layer {
            if self.batch_norm {
                block.push(Box::new(BatchNorm1d::new(self.fan_out)));
            }
            if self.dropout > 0.0 {
                if self.activation == Activation::SELU {
                    block.push(Box::new(AlphaDropout::new(self.dropout, rng)));
                } else {
                    block.push(Box::new(Dropout::new(self.dropout, rng)));
                }
            }
        }
        log::debug!(
            "Dense block {} -> {} ({:?}): {:?}",
            self.fan_in,
            self.fan_out,
            scheme,
            block.layer_names()
        );
        block
    }
}

/// Everything a body builder is told about the body it should build
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BodySpec {
    /// Number of dense layers
    pub depth: usize,
    /// Width of the input and of every layer
    pub width: usize,
    pub dropout: f32,
    pub batch_norm: bool,
    pub activation: Activation,
    pub residual: bool,
    pub dense: bool,
}

/// The hidden part of a network, sitting between head and tail
pub trait Body: Module {
    /// Number of outputs, the fan in of the tail
    fn out_size(&self) -> usize;
}

/// Builds the body of a network
pub trait BodyBuilder {
    fn build(
        &self,
        spec: &BodySpec,
        init: &dyn InitLookup,
        acts: &dyn ActivationLookup,
        rng: &mut dyn RngCore,
    ) -> Box<dyn Body>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Connectivity {
    Plain,
    /// Identity skip around every pair of blocks after the first
    Residual,
    /// Each block receives the outputs of all previous blocks concatenated with the input
    Dense,
}

/// Stack of dense blocks of constant width
pub struct FullyConnected {
    blocks: Vec<Sequential>,
    /// Re-normalises the sum after each residual addition
    residual_norms: Vec<BatchNorm1d>,
    connectivity: Connectivity,
    width: usize,
}

impl FullyConnected {
    pub fn new(
        spec: &BodySpec,
        init: &dyn InitLookup,
        acts: &dyn ActivationLookup,
        rng: &mut dyn RngCore,
    ) -> Self {
        let connectivity = match (spec.residual, spec.dense) {
            (true, true) => {
                log::warn!("Both residual and dense connections requested, using residual");
                Connectivity::Residual
            }
            (true, false) => Connectivity::Residual,
            (false, true) => Connectivity::Dense,
            (false, false) => Connectivity::Plain,
        };
        let mut block = |fan_in: usize| {
            DenseBlock {
                fan_in,
                fan_out: spec.width,
                activation: spec.activation,
                batch_norm: spec.batch_norm,
                dropout: spec.dropout,
                output_layer: false,
            }
            .build(init, acts, &mut *rng)
        };

        let mut residual_norms = vec![];
        let blocks = match connectivity {
            Connectivity::Plain => (0..spec.depth).map(|_| block(spec.width)).collect(),
            Connectivity::Dense => (0..spec.depth)
                .map(|d| block(spec.width * (d + 1)))
                .collect(),
            Connectivity::Residual if spec.depth == 0 => vec![],
            Connectivity::Residual => {
                let n_pairs = spec.depth / 2;
                let mut blocks = vec![block(spec.width)];
                for _ in 0..n_pairs {
                    let mut pair = block(spec.width);
                    pair.append(block(spec.width));
                    blocks.push(pair);
                    if spec.batch_norm {
                        residual_norms.push(BatchNorm1d::new(spec.width));
                    }
                }
                blocks
            }
        };

        Self {
            blocks,
            residual_norms,
            connectivity,
            width: spec.width,
        }
    }

    pub fn blocks(&self) -> &[Sequential] {
        &self.blocks
    }

    /// Runs the body on a batch, either sample by sample or with batch statistics
    fn propagate(
        &self,
        batch: &[Vec<Value>],
        batched: bool,
    ) -> Result<Vec<Vec<Value>>, NNError> {
        fn apply(
            module: &dyn Module,
            x: &[Vec<Value>],
            batched: bool,
        ) -> Result<Vec<Vec<Value>>, NNError> {
            if batched {
                module.forward_batch(x)
            } else {
                x.iter().map(|inputs| module.forward(inputs)).collect()
            }
        }

        let Some((last, rest)) = self.blocks.split_last() else {
            return Ok(batch.to_vec());
        };
        let mut x = batch.to_vec();
        match self.connectivity {
            Connectivity::Plain => {
                for block in self.blocks.iter() {
                    x = apply(block, &x, batched)?;
                }
            }
            Connectivity::Dense => {
                for block in rest.iter() {
                    let out = apply(block, &x, batched)?;
                    x = out
                        .into_iter()
                        .zip(x)
                        .map(|(mut out, inputs)| {
                            out.extend(inputs);
                            out
                        })
                        .collect();
                }
                x = apply(last, &x, batched)?;
            }
            Connectivity::Residual => {
                x = apply(&self.blocks[0], &x, batched)?;
                for (i, block) in self.blocks.iter().enumerate().skip(1) {
                    let out = apply(block, &x, batched)?;
                    x = out
                        .iter()
                        .zip(x.iter())
                        .map(|(out, inputs)| {
                            out.iter().zip(inputs.iter()).map(|(a, b)| a + b).collect()
                        })
                        .collect();
                    if let Some(norm) = self.residual_norms.get(i - 1) {
                        x = apply(norm, &x, batched)?;
                    }
                }
            }
        }
        Ok(x)
    }
}

impl Module for FullyConnected {
    fn parameters(&self) -> Vec<Value> {
        self.blocks
            .iter()
            .flat_map(|b| b.parameters())
            .chain(self.residual_norms.iter().flat_map(|n| n.parameters()))
            .collect()
    }

    fn forward(&self, inputs: &[Value]) -> Result<Vec<Value>, NNError> {
        let mut outputs = self.propagate(&[inputs.to_vec()], false)?;
        Ok(outputs.pop().unwrap_or_default())
    }

    fn forward_batch(&self, batch: &[Vec<Value>]) -> Result<Vec<Vec<Value>>, NNError> {
        self.propagate(batch, true)
    }

    fn set_training(&mut self, training: bool) {
        for block in self.blocks.iter_mut() {
            block.set_training(training);
        }
        for norm in self.residual_norms.iter_mut() {
            norm.set_training(training);
        }
    }

    fn name(&self) -> &'static str {
        "FullyConnected"
    }
}

impl Body for FullyConnected {
    fn out_size(&self) -> usize {
        self.width
    }
}

/// Builds [`FullyConnected`] bodies
#[derive(Debug, Default, Clone, Copy)]
pub struct FullyConnectedBuilder;

impl BodyBuilder for FullyConnectedBuilder {
    fn build(
        &self,
        spec: &BodySpec,
        init: &dyn InitLookup,
        acts: &dyn ActivationLookup,
        rng: &mut dyn RngCore,
    ) -> Box<dyn Body> {
        Box::new(FullyConnected::new(spec, init, acts, rng))
    }
}
