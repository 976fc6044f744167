//! Softmax layer with the logistic-cost fused backward shortcut

use ndarray::ArrayView2;

use super::label_index;
use crate::backend::{self, Matrix};

/// Row-wise softmax.
///
/// Forward subtracts the per-case maximum before exponentiating. Backward has
/// two paths, chosen by the graph driver: the generic Jacobian-vector product
/// against the incoming gradient, or — only when this layer's single
/// successor is a logistic-regression cost layer — the fused
/// `(p − onehot) · coeff` shortcut that never divides by near-zero
/// probabilities.
#[derive(Debug, Default)]
pub struct SoftmaxLayer;

impl SoftmaxLayer {
    pub fn new() -> Self {
        SoftmaxLayer
    }

    pub fn forward(&self, input: &ArrayView2<'_, f32>, acts: &mut Matrix) {
        if acts.dim() != input.dim() {
            *acts = Matrix::zeros(input.dim());
        }
        for (row, mut out) in input.rows().into_iter().zip(acts.rows_mut()) {
            let max = row.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
            let mut sum = 0.0;
            for (o, &v) in out.iter_mut().zip(row.iter()) {
                let e = (v - max).exp();
                *o = e;
                sum += e;
            }
            out.mapv_inplace(|v| v / sum);
        }
    }

    /// Generic path: `dxᵢ = pᵢ·(gᵢ − Σⱼ gⱼ·pⱼ)` per case.
    pub fn generic_input_gradient(
        &self,
        probs: &Matrix,
        grad: &Matrix,
        dst: &mut Matrix,
        overwrite: bool,
    ) {
        let mut contribution = Matrix::zeros(probs.dim());
        for ((p_row, g_row), mut d_row) in probs
            .rows()
            .into_iter()
            .zip(grad.rows())
            .zip(contribution.rows_mut())
        {
            let dot: f32 = p_row.iter().zip(g_row.iter()).map(|(&p, &g)| p * g).sum();
            for ((d, &p), &g) in d_row.iter_mut().zip(p_row.iter()).zip(g_row.iter()) {
                *d = p * (g - dot);
            }
        }
        backend::accumulate(dst, &contribution.view(), overwrite);
    }

    /// Fused path: `(p − onehot(label)) · coeff`, straight from the labels
    /// and this layer's own outputs.
    pub fn fused_input_gradient(
        &self,
        probs: &Matrix,
        labels: &ArrayView2<'_, f32>,
        coeff: f32,
        dst: &mut Matrix,
        overwrite: bool,
    ) {
        assert_eq!(labels.nrows(), probs.nrows(), "label count mismatch");
        let mut contribution = probs.clone();
        for (case, mut row) in contribution.rows_mut().into_iter().enumerate() {
            let label = label_index(labels[(case, 0)], row.len());
            row[label] -= 1.0;
            row.mapv_inplace(|v| v * coeff);
        }
        backend::accumulate(dst, &contribution.view(), overwrite);
    }
}
