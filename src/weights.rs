//! Weight groups: values, momentum increments, gradient accumulators
//!
//! A weight-bearing layer owns one group per weighted input plus one for its
//! biases. Each group carries its own learning rate, weight decay and
//! momentum, and a host-resident shadow of its values and increments. The
//! engine runs in a single compute context, so "device" buffers are the live
//! arrays and the shadows are what checkpointing and the gradient checker
//! read and perturb.

use crate::backend::{self, Matrix};
use crate::pass::Pass;

/// One named weight matrix with its update state.
#[derive(Debug, Clone)]
pub struct WeightGroup {
    pub name: String,
    pub values: Matrix,
    pub increments: Matrix,
    pub grads: Matrix,
    host_values: Matrix,
    host_increments: Matrix,
    pub learning_rate: f32,
    pub weight_decay: f32,
    pub momentum: f32,
}

impl WeightGroup {
    pub fn new(
        name: impl Into<String>,
        values: Matrix,
        learning_rate: f32,
        weight_decay: f32,
        momentum: f32,
    ) -> Self {
        let dim = values.dim();
        WeightGroup {
            name: name.into(),
            host_values: values.clone(),
            values,
            increments: Matrix::zeros(dim),
            grads: backend::empty(),
            host_increments: Matrix::zeros(dim),
            learning_rate,
            weight_decay,
            momentum,
        }
    }

    /// One step of the update rule:
    /// `inc = momentum·inc + lr·(grad/batch − decay·value); value += inc`.
    /// The momentum term is suppressed under `Pass::GradCheck`.
    pub fn update(&mut self, batch_size: usize, pass: Pass) {
        assert!(batch_size > 0, "batch size must be positive");
        assert_eq!(self.grads.dim(), self.values.dim(), "weight gradient not computed");
        let momentum = pass.effective_momentum(self.momentum);
        let step = (&self.grads / batch_size as f32 - &self.values * self.weight_decay)
            * self.learning_rate;
        self.increments = &self.increments * momentum + &step;
        self.values += &self.increments;
    }

    /// Complete transfer of values and increments to the host shadows.
    pub fn copy_to_host(&mut self) {
        self.host_values = self.values.clone();
        self.host_increments = self.increments.clone();
    }

    /// Complete transfer of the host shadows back over the live buffers.
    pub fn copy_to_device(&mut self) {
        self.values = self.host_values.clone();
        self.increments = self.host_increments.clone();
    }

    pub fn host_values(&self) -> &Matrix {
        &self.host_values
    }

    pub fn host_values_mut(&mut self) -> &mut Matrix {
        &mut self.host_values
    }
}
