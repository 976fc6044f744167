//! Fully-connected layer: one weight group per predecessor plus bias

use ndarray::ArrayView2;

use super::Neuron;
use crate::backend::{self, Matrix};
use crate::weights::WeightGroup;

/// Dense layer over any number of weighted inputs.
///
/// `groups` holds one `(in_dim, out_dim)` weight matrix per predecessor in
/// predecessor order, followed by a single `(1, out_dim)` bias group. Forward
/// is `f(Σᵢ inputᵢ · Wᵢ + b)`.
#[derive(Debug)]
pub struct FullyConnectedLayer {
    pub neuron: Neuron,
    pub groups: Vec<WeightGroup>,
}

impl FullyConnectedLayer {
    pub fn new(neuron: Neuron, groups: Vec<WeightGroup>) -> Self {
        assert!(groups.len() >= 2, "fc layer needs at least one weight group and a bias");
        FullyConnectedLayer { neuron, groups }
    }

    pub fn outputs(&self) -> usize {
        self.bias().values.ncols()
    }

    fn bias(&self) -> &WeightGroup {
        self.groups.last().expect("fc layer always has a bias group")
    }

    fn weight_count(&self) -> usize {
        self.groups.len() - 1
    }

    pub fn forward(&mut self, inputs: &[ArrayView2<'_, f32>], acts: &mut Matrix) {
        assert_eq!(inputs.len(), self.weight_count(), "fc input count mismatch");
        for (i, input) in inputs.iter().enumerate() {
            backend::matmul_acc(input, &self.groups[i].values.view(), acts, i == 0);
        }
        *acts += &self.bias().values;
        self.neuron.apply(acts);
    }

    /// Gradient toward predecessor `idx`: `grad · Wᵢᵗ`, honoring the
    /// overwrite/accumulate policy.
    pub fn input_gradient(&self, idx: usize, grad: &Matrix, dst: &mut Matrix, overwrite: bool) {
        backend::matmul_acc(&grad.view(), &self.groups[idx].values.t(), dst, overwrite);
    }

    /// Weight gradient per input (`inputᵢᵗ · grad`) and bias gradient
    /// (column sums of the incoming gradient).
    pub fn weight_gradients(&mut self, inputs: &[ArrayView2<'_, f32>], grad: &Matrix) {
        assert_eq!(inputs.len(), self.weight_count(), "fc input count mismatch");
        for (i, input) in inputs.iter().enumerate() {
            backend::matmul_acc(&input.t(), &grad.view(), &mut self.groups[i].grads, true);
        }
        let bias_grad = backend::col_sums(grad).insert_axis(ndarray::Axis(0));
        let bias = self.groups.last_mut().expect("fc layer always has a bias group");
        bias.grads = bias_grad;
    }
}
