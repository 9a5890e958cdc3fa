//! Optimizer(s)

use crate::values::Value;

/// Common interface for optimizers
/// Analogous to the torch.optim.Optimizer interface
/// <https://pytorch.org/docs/stable/optim.html#base-class>
pub trait Optim {
    /// Performs a single optimization step with accumulated gradients
    fn step(&mut self);
    /// Zeros gradients for all parameters
    fn zero_grad(&mut self);
    fn lr(&self) -> f32;
    fn set_lr(&mut self, lr: f32);
}

/// SGD with momentum
pub struct SGD {
    params: Vec<Value>,
    lr: f32,
    momentum: f32,
    weight_decay: f32,
    // velocity per parameter
    velocity: Vec<f32>,
}

impl SGD {
    pub fn new(params: Vec<Value>, lr: f32, momentum: f32) -> Self {
        Self::with_weight_decay(params, lr, momentum, 0.0)
    }

    pub fn with_weight_decay(params: Vec<Value>, lr: f32, momentum: f32, weight_decay: f32) -> Self {
        let velocity = vec![0.0; params.len()];
        Self {
            params,
            lr,
            momentum,
            weight_decay,
            velocity,
        }
    }

    #[cfg(test)]
    fn velocities(&self) -> &[f32] {
        &self.velocity
    }
}

impl Optim for SGD {
    fn step(&mut self) {
        for (idx, param) in self.params.iter_mut().enumerate() {
            let grad = param.grad() + self.weight_decay * param.data();
            // SGD with momentum
            let velocity = self.momentum * self.velocity[idx] - self.lr * grad;
            let new_val = param.data() + velocity;
            self.velocity[idx] = velocity;
            param.set_data(new_val);
        }
    }

    fn zero_grad(&mut self) {
        for param in self.params.iter_mut() {
            param.zero_grad();
        }
    }

    fn lr(&self) -> f32 {
        self.lr
    }

    fn set_lr(&mut self, lr: f32) {
        self.lr = lr;
    }
}

/// Adam (Adaptive Moment Estimation) with L2 weight decay folded into the gradient
/// <https://arxiv.org/abs/1412.6980>
pub struct Adam {
    params: Vec<Value>,
    lr: f32,
    beta1: f32,
    beta2: f32,
    eps: f32,
    weight_decay: f32,
    /// First moment estimates
    m: Vec<f32>,
    /// Second moment estimates
    v: Vec<f32>,
    /// Step counter
    t: i32,
}

impl Adam {
    pub fn new(params: Vec<Value>, lr: f32) -> Self {
        Self::with_params(params, lr, 0.9, 0.999, 1e-8, 0.0)
    }

    pub fn with_params(
        params: Vec<Value>,
        lr: f32,
        beta1: f32,
        beta2: f32,
        eps: f32,
        weight_decay: f32,
    ) -> Self {
        let n = params.len();
        Self {
            params,
            lr,
            beta1,
            beta2,
            eps,
            weight_decay,
            m: vec![0.0; n],
            v: vec![0.0; n],
            t: 0,
        }
    }
}

impl Optim for Adam {
    fn step(&mut self) {
        self.t += 1;
        let bias_correction1 = 1.0 - self.beta1.powi(self.t);
        let bias_correction2 = 1.0 - self.beta2.powi(self.t);
        for (idx, param) in self.params.iter_mut().enumerate() {
            let grad = param.grad() + self.weight_decay * param.data();
            self.m[idx] = self.beta1 * self.m[idx] + (1.0 - self.beta1) * grad;
            self.v[idx] = self.beta2 * self.v[idx] + (1.0 - self.beta2) * grad * grad;
            let m_hat = self.m[idx] / bias_correction1;
            let v_hat = self.v[idx] / bias_correction2;
            let new_val = param.data() - self.lr * m_hat / (v_hat.sqrt() + self.eps);
            param.set_data(new_val);
        }
    }

    fn zero_grad(&mut self) {
        for param in self.params.iter_mut() {
            param.zero_grad();
        }
    }

    fn lr(&self) -> f32 {
        self.lr
    }

    fn set_lr(&mut self, lr: f32) {
        self.lr = lr;
    }
}

#[cfg(test)]
mod tests {
    use crate::assert_eq_float;

    use super::*;

    #[test]
    fn test_sgd_no_momentum() {
        let a = Value::new(1.0);
        let b = Value::new(2.0);
        let c = &a + &b;
        c.backward();

        let mut optim = SGD::new(vec![a.clone(), b.clone(), c.clone()], 0.1, 0.0);
        optim.step();
        assert_eq!(a.grad(), 1.0);
        assert_eq!(b.grad(), 1.0);
        assert_eq!(c.grad(), 1.0);
        assert_eq!(a.data(), 0.9);
        assert_eq!(b.data(), 1.9);
        assert_eq!(c.data(), 2.9);
    }

    #[test]
    fn test_sgd_with_momentum() {
        let a = Value::new(1.0);
        let b = Value::new(2.0);
        let c = &a + &b;
        c.backward();

        let mut optim = SGD::new(vec![a.clone(), b.clone(), c.clone()], 0.1, 0.9);
        optim.step();
        assert_eq!(a.grad(), 1.0);
        assert_eq!(b.grad(), 1.0);
        assert_eq!(c.grad(), 1.0);
        assert_eq!(a.data(), 0.9);
        assert_eq!(b.data(), 1.9);
        assert_eq!(c.data(), 2.9);
        assert_eq!(optim.velocities(), &[-0.1, -0.1, -0.1]);
        optim.step();
        assert_eq!(a.data(), 0.71);
        assert_eq!(b.data(), 1.71);
        assert_eq!(c.data(), 2.71);
        assert_eq!(optim.velocities(), &[-0.19, -0.19, -0.19]);
    }

    #[test]
    fn test_sgd_weight_decay() {
        let a = Value::new(2.0);
        let mut optim = SGD::with_weight_decay(vec![a.clone()], 0.1, 0.0, 0.5);
        // zero gradient, only the decay term pulls the weight: 2 - 0.1 * 0.5 * 2
        optim.step();
        assert_eq_float!(a.data(), 1.9);
    }

    #[test]
    fn test_adam_first_step_moves_by_lr() {
        let a = Value::new(1.0);
        let b = Value::new(2.0);
        let c = &(&a * &b) - &b;
        c.backward();
        // dc/da = 2, dc/db = a - 1 = 0

        let mut optim = Adam::new(vec![a.clone(), b.clone()], 0.1);
        optim.step();
        // bias corrected first step is lr * g / |g|
        assert_eq_float!(a.data(), 0.9);
        assert_eq_float!(b.data(), 2.0);
    }

    #[test]
    fn test_adam_minimises_quadratic() {
        let x = Value::new(3.0);
        let mut optim = Adam::new(vec![x.clone()], 0.1);
        for _ in 0..300 {
            let loss = x.pow(&Value::new(2.0));
            loss.backward();
            optim.step();
            optim.zero_grad();
        }
        assert!(x.data().abs() < 0.05, "x = {}", x.data());
    }

    #[test]
    fn test_set_lr() {
        let mut optim = Adam::new(vec![], 0.1);
        optim.set_lr(0.01);
        assert_eq!(optim.lr(), 0.01);
        let mut optim = SGD::new(vec![], 0.1, 0.0);
        optim.set_lr(0.5);
        assert_eq!(optim.lr(), 0.5);
    }
}
