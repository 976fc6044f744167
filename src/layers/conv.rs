//! Convolution layer: filter bank, biases, partial-sum weight gradients

use ndarray::ArrayView2;

use super::Neuron;
use crate::backend::{self, conv_backward_input, conv_backward_weights, conv_forward, ConvGeometry, Matrix};
use crate::weights::WeightGroup;

/// Spatial convolution over a single input.
///
/// `groups[0]` is the filter bank `(channels · filter_size², filters)`;
/// `groups[1]` the biases, `(1, filters)` when shared across positions or
/// `(1, filters · modules_x²)` per position. `partial_sum` bounds the
/// working set of the weight-gradient reduction; the tile buffer it uses is
/// a truncatable transient.
#[derive(Debug)]
pub struct ConvLayer {
    pub geom: ConvGeometry,
    pub neuron: Neuron,
    pub shared_biases: bool,
    pub partial_sum: Option<usize>,
    pub groups: Vec<WeightGroup>,
    partial_buf: Matrix,
}

impl ConvLayer {
    pub fn new(
        geom: ConvGeometry,
        neuron: Neuron,
        shared_biases: bool,
        partial_sum: Option<usize>,
        filters: WeightGroup,
        biases: WeightGroup,
    ) -> Self {
        assert_eq!(
            filters.values.dim(),
            (geom.weight_rows(), geom.filters),
            "filter matrix shape mismatch"
        );
        let bias_cols = if shared_biases { geom.filters } else { geom.output_len() };
        assert_eq!(biases.values.dim(), (1, bias_cols), "bias shape mismatch");
        ConvLayer {
            geom,
            neuron,
            shared_biases,
            partial_sum,
            groups: vec![filters, biases],
            partial_buf: backend::empty(),
        }
    }

    pub fn forward(&mut self, input: &ArrayView2<'_, f32>, acts: &mut Matrix) {
        conv_forward(&self.geom, input, &self.groups[0].values, acts);
        let m2 = self.geom.modules();
        if self.shared_biases {
            // one bias per filter, broadcast over all positions
            for mut row in acts.rows_mut() {
                for f in 0..self.geom.filters {
                    let b = self.groups[1].values[(0, f)];
                    for m in 0..m2 {
                        row[f * m2 + m] += b;
                    }
                }
            }
        } else {
            *acts += &self.groups[1].values;
        }
        self.neuron.apply(acts);
    }

    pub fn input_gradient(&self, grad: &Matrix, dst: &mut Matrix, overwrite: bool) {
        conv_backward_input(&self.geom, &grad.view(), &self.groups[0].values, dst, overwrite);
    }

    pub fn weight_gradients(&mut self, input: &ArrayView2<'_, f32>, grad: &Matrix) {
        conv_backward_weights(
            &self.geom,
            input,
            &grad.view(),
            self.partial_sum,
            &mut self.groups[0].grads,
            &mut self.partial_buf,
        );
        let col_sums = backend::col_sums(grad);
        let m2 = self.geom.modules();
        if self.shared_biases {
            let mut bias_grad = Matrix::zeros((1, self.geom.filters));
            for f in 0..self.geom.filters {
                let mut sum = 0.0;
                for m in 0..m2 {
                    sum += col_sums[f * m2 + m];
                }
                bias_grad[(0, f)] = sum;
            }
            self.groups[1].grads = bias_grad;
        } else {
            self.groups[1].grads = col_sums.insert_axis(ndarray::Axis(0));
        }
    }

    /// Release the tiled partial-sum buffer.
    pub fn truncate_transients(&mut self) {
        self.partial_buf = backend::empty();
    }
}
