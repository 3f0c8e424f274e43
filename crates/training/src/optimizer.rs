//! Stochastic gradient descent with step decay
//!
//! One optimizer per sub-model, stepping the parameter tensors the model
//! hands out. Frozen tensors are skipped. The step-decay schedule shrinks
//! the learning rate by `gamma` every `step_size` optimizer steps.

use embedtune_core::{Error, Result};

use crate::model::ParamTensor;

/// Plain SGD with L2 weight decay
#[derive(Debug, Clone)]
pub struct Sgd {
    lr: f32,
    weight_decay: f32,
}

impl Sgd {
    /// Create an optimizer
    pub fn new(lr: f32, weight_decay: f32) -> Result<Self> {
        if lr <= 0.0 {
            return Err(Error::validation("learning rate must be positive"));
        }
        if weight_decay < 0.0 {
            return Err(Error::validation("weight decay must be non-negative"));
        }
        Ok(Sgd { lr, weight_decay })
    }

    /// Current learning rate
    pub fn lr(&self) -> f32 {
        self.lr
    }

    /// Replace the learning rate (driven by the schedule)
    pub fn set_lr(&mut self, lr: f32) {
        self.lr = lr;
    }

    /// Apply one descent step over the given parameter tensors
    pub fn step(&self, params: Vec<&mut ParamTensor>) {
        for tensor in params {
            if tensor.frozen {
                continue;
            }
            for (value, grad) in tensor.values.iter_mut().zip(&tensor.grad) {
                *value -= self.lr * (grad + self.weight_decay * *value);
            }
        }
    }
}

/// Step-decay learning-rate schedule
///
/// `lr(step) = base_lr * gamma ^ floor(step / step_size)`
#[derive(Debug, Clone)]
pub struct StepDecay {
    base_lr: f32,
    step_size: usize,
    gamma: f32,
    steps: usize,
}

impl StepDecay {
    /// Create a schedule
    pub fn new(base_lr: f32, step_size: usize, gamma: f32) -> Result<Self> {
        if step_size == 0 {
            return Err(Error::validation("step_size must be a positive integer"));
        }
        if !(gamma > 0.0 && gamma < 1.0) {
            return Err(Error::validation("gamma must be in the range (0, 1)"));
        }
        Ok(StepDecay {
            base_lr,
            step_size,
            gamma,
            steps: 0,
        })
    }

    /// Advance one step and return the learning rate to use next
    pub fn step(&mut self) -> f32 {
        self.steps += 1;
        self.current_lr()
    }

    /// Learning rate at the current step count
    pub fn current_lr(&self) -> f32 {
        let exponent = (self.steps / self.step_size) as i32;
        self.base_lr * self.gamma.powi(exponent)
    }
}
