//! Declarative construction of feed forward networks on a small scalar autograd engine,
//! with model interpretation plots.
//!
//! [`model_builder::ModelBuilder`] turns an objective and flat key/value configurations into a
//! network, an optimizer and a loss. [`interpretation`] charts permutation importance, layer
//! weights and partial dependence of any [`nn::Module`].

pub mod activations;
pub mod backprop_fns;
pub mod blocks;
pub mod config;
pub mod dataloader;
pub mod datasets;
pub mod init;
pub mod interpretation;
pub mod loss;
pub mod model_builder;
pub mod nn;
pub mod optim;
pub mod partial_dependence;
pub mod plot_settings;
pub mod values;
