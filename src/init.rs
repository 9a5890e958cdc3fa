//! Weight initialisation schemes and the lookup choosing one per activation

use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

use crate::activations::Activation;

/// Normal weight initialisation schemes, each defined by the standard deviation it samples with
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Init {
    /// He/Kaiming normal, `std = sqrt(2 / fan_in)`, for ReLU-like activations
    HeNormal,
    /// LeCun normal, `std = sqrt(1 / fan_in)`, keeps SELU networks self-normalising
    LecunNormal,
    /// Glorot/Xavier normal, `std = sqrt(2 / (fan_in + fan_out))`
    GlorotNormal,
    Normal { std: f32 },
}

impl Init {
    pub fn std(&self, fan_in: usize, fan_out: usize) -> f32 {
        let std = match self {
            Init::HeNormal => (2.0 / fan_in as f32).sqrt(),
            Init::LecunNormal => (1.0 / fan_in as f32).sqrt(),
            Init::GlorotNormal => (2.0 / (fan_in + fan_out) as f32).sqrt(),
            Init::Normal { std } => *std,
        };
        if std.is_finite() { std } else { 0.0 }
    }

    /// Samples a `fan_out x fan_in` weight matrix
    pub fn sample<R: Rng + ?Sized>(
        &self,
        fan_in: usize,
        fan_out: usize,
        rng: &mut R,
    ) -> Vec<Vec<f32>> {
        let std = self.std(fan_in, fan_out);
        (0..fan_out)
            .map(|_| {
                (0..fan_in)
                    .map(|_| {
                        let z: f32 = StandardNormal.sample(rng);
                        std * z
                    })
                    .collect()
            })
            .collect()
    }
}

/// Chooses the initialisation of a layer from the activation that follows it and its fan in/out
pub trait InitLookup {
    fn lookup(&self, activation: Activation, fan_in: usize, fan_out: usize) -> Init;
}

impl<F> InitLookup for F
where
    F: Fn(Activation, usize, usize) -> Init,
{
    fn lookup(&self, activation: Activation, fan_in: usize, fan_out: usize) -> Init {
        self(activation, fan_in, fan_out)
    }
}

/// He for ReLU and Swish, LeCun for SELU, Glorot for everything else
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultInit;

impl InitLookup for DefaultInit {
    fn lookup(&self, activation: Activation, _fan_in: usize, _fan_out: usize) -> Init {
        match activation {
            Activation::ReLU | Activation::Swish => Init::HeNormal,
            Activation::SELU => Init::LecunNormal,
            Activation::Sigmoid
            | Activation::Tanh
            | Activation::Softmax
            | Activation::LogSoftmax
            | Activation::Linear => Init::GlorotNormal,
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_pcg::Pcg64Mcg;

    use crate::assert_eq_float;

    use super::*;

    #[test]
    fn test_std() {
        assert_eq_float!(Init::HeNormal.std(8, 3), 0.5);
        assert_eq_float!(Init::LecunNormal.std(4, 3), 0.5);
        assert_eq_float!(Init::GlorotNormal.std(3, 5), 0.5);
        assert_eq_float!(Init::Normal { std: 0.1 }.std(3, 5), 0.1);
        assert_eq!(Init::HeNormal.std(0, 3), 0.0);
    }

    #[test]
    fn test_sample_shape_and_spread() {
        let mut rng = Pcg64Mcg::seed_from_u64(7);
        let weights = Init::HeNormal.sample(200, 50, &mut rng);
        assert_eq!(weights.len(), 50);
        assert!(weights.iter().all(|row| row.len() == 200));

        let flat = weights.iter().flatten().copied().collect::<Vec<_>>();
        let n = flat.len() as f32;
        let mean = flat.iter().sum::<f32>() / n;
        let var = flat.iter().map(|w| (w - mean).powi(2)).sum::<f32>() / n;
        assert!(mean.abs() < 0.01, "mean {}", mean);
        assert!((var - 0.01).abs() < 0.001, "var {}", var);
    }

    #[test]
    fn test_default_lookup() {
        assert_eq!(DefaultInit.lookup(Activation::ReLU, 10, 10), Init::HeNormal);
        assert_eq!(DefaultInit.lookup(Activation::Swish, 10, 10), Init::HeNormal);
        assert_eq!(DefaultInit.lookup(Activation::SELU, 10, 10), Init::LecunNormal);
        assert_eq!(DefaultInit.lookup(Activation::Sigmoid, 10, 1), Init::GlorotNormal);
        assert_eq!(DefaultInit.lookup(Activation::Linear, 10, 1), Init::GlorotNormal);
    }

    #[test]
    fn test_closure_lookup() {
        let lookup = |_: Activation, fan_in: usize, _: usize| Init::Normal {
            std: 1.0 / fan_in as f32,
        };
        assert_eq!(
            lookup.lookup(Activation::ReLU, 4, 2),
            Init::Normal { std: 0.25 }
        );
    }
}
