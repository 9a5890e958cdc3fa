//! Generates toy datasets for classification and regression
//!
//! Every sample carries the two informative coordinates `x` and `y` plus an uninformative
//! `noise` feature, which gives feature importance something to rank last.

use std::{
    cmp::Ordering,
    f32::consts::PI,
    fmt::{self, Display},
};

use clap::ValueEnum;
use rand::Rng;

use crate::config::Objective;

pub const FEATURE_NAMES: [&str; 3] = ["x", "y", "noise"];

/// Toggles between dataset types
#[derive(Debug, ValueEnum, Clone, Copy, PartialEq, Eq)]
pub enum Dataset {
    Line,
    Circle,
    XOR,
    Moon,
    /// Regression target `sin(x) * cos(y)`
    Ripple,
}

impl Display for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dataset::Line => write!(f, "line"),
            Dataset::Circle => write!(f, "circle"),
            Dataset::XOR => write!(f, "xor"),
            Dataset::Moon => write!(f, "moon"),
            Dataset::Ripple => write!(f, "ripple"),
        }
    }
}

impl Dataset {
    pub fn default_objective(&self) -> Objective {
        match self {
            Dataset::Ripple => Objective::Regression,
            _ => Objective::BinaryClassification,
        }
    }
}

/// Generated features with one target per sample, a class index for the classification
/// sets and a real value for regression
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Samples {
    pub data: Vec<Vec<f32>>,
    pub targets: Vec<f32>,
}

impl Samples {
    fn push<R: Rng + ?Sized>(&mut self, rng: &mut R, x: f32, y: f32, target: f32) {
        let noise = rng.random_range(-5.0..5.0);
        self.data.push(vec![x, y, noise]);
        self.targets.push(target);
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

pub fn feature_names() -> Vec<String> {
    FEATURE_NAMES.iter().map(|s| s.to_string()).collect()
}

/// Loads a dataset based on the dataset type
pub fn load_dataset<R: Rng + ?Sized>(dataset: Dataset, class_size: usize, rng: &mut R) -> Samples {
    match dataset {
        Dataset::Line => gen_linear_data(class_size, rng),
        Dataset::Circle => gen_circle_data(class_size, rng),
        Dataset::XOR => gen_xor_data(class_size, rng),
        Dataset::Moon => gen_moon_data(class_size, rng),
        Dataset::Ripple => gen_ripple_data(class_size, rng),
    }
}

/// Generates a simple linearly separable dataset
pub fn gen_linear_data<R: Rng + ?Sized>(class_size: usize, rng: &mut R) -> Samples {
    let mut samples = Samples::default();
    for _ in 0..class_size {
        let x = rng.random_range(-5.0..5.0);
        let y = rng.random_range(-5.0..5.0);
        samples.push(rng, x, y, if x > y { 0.0 } else { 1.0 });
    }
    samples
}

/// Generates a binary classification dataset of two concentric circles
pub fn gen_circle_data<R: Rng + ?Sized>(class_size: usize, rng: &mut R) -> Samples {
    let mut samples = Samples::default();
    for (class, radius) in [(0.0, 3.0f32), (1.0, 5.0)] {
        for _ in 0..class_size {
            let angle = rng.random_range(0.0..2.0 * PI);
            let radius_delta = radius * rng.random_range(-0.25..0.25);
            let x = (radius + radius_delta) * angle.cos();
            let y = (radius + radius_delta) * angle.sin();
            samples.push(rng, x, y, class);
        }
    }
    samples
}

pub fn gen_xor_data<R: Rng + ?Sized>(class_size: usize, rng: &mut R) -> Samples {
    let mut samples = Samples::default();
    for _ in 0..class_size {
        let x = rng.random_range(-5.0..5.0);
        let y = rng.random_range(-5.0..5.0);
        let class = if x > 0.0 && y > 0.0 || x < 0.0 && y < 0.0 {
            0.0
        } else {
            1.0
        };
        samples.push(rng, x, y, class);
    }
    samples
}

/// Generates a moons dataset (two interleaving partial circles) for binary classification
pub fn gen_moon_data<R: Rng + ?Sized>(class_size: usize, rng: &mut R) -> Samples {
    let mut samples = Samples::default();
    let radius = 3.0;

    // First moon
    for _ in 0..class_size {
        let theta = rng.random_range(PI * -1.0 / 4.0..PI * 5.0 / 4.0);
        let x = radius * theta.cos() + rng.random_range(-0.1..0.1);
        let y = radius * theta.sin() + rng.random_range(-0.1..0.1);
        samples.push(rng, x, y, 0.0);
    }

    // Second moon
    for _ in 0..class_size {
        let theta = rng.random_range(PI * -1.0 / 4.0..PI * 5.0 / 4.0);
        let x = radius * theta.cos() + 2.0 + rng.random_range(-0.1..0.1);
        let y = -radius * theta.sin() - 0.2 + rng.random_range(-0.1..0.1);
        samples.push(rng, x, y, 1.0);
    }
    samples
}

/// Generates a smooth regression surface with a little label noise
pub fn gen_ripple_data<R: Rng + ?Sized>(class_size: usize, rng: &mut R) -> Samples {
    let mut samples = Samples::default();
    for _ in 0..class_size {
        let x = rng.random_range(-PI..PI);
        let y = rng.random_range(-PI..PI);
        let target = x.sin() * y.cos() + rng.random_range(-0.05..0.05);
        samples.push(rng, x, y, target);
    }
    samples
}

/// Number of distinct classes, assuming class indices start at 0
pub fn n_classes(targets: &[f32]) -> usize {
    targets
        .iter()
        .map(|&t| t.max(0.0) as usize + 1)
        .max()
        .unwrap_or(0)
}

/// Shapes raw targets for the network output: one hot vectors for multiclass models with
/// several outputs, single values otherwise
pub fn encode_targets(targets: &[f32], objective: Objective, n_out: usize) -> Vec<Vec<f32>> {
    match objective {
        Objective::MulticlassClassification if n_out > 1 => targets
            .iter()
            .map(|&t| {
                let mut one_hot = vec![0.0; n_out];
                if let Some(v) = one_hot.get_mut(t.max(0.0) as usize) {
                    *v = 1.0;
                }
                one_hot
            })
            .collect(),
        _ => targets.iter().map(|&t| vec![t]).collect(),
    }
}

/// Returns the class of a given output by taking the index of the maximum value
pub fn get_class(output: &[f32]) -> usize {
    output
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(Ordering::Equal))
        .map(|(i, _)| i)
        .unwrap_or(0)
}
