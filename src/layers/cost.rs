//! Cost layers: graph sinks producing error metrics
//!
//! A cost layer's inputs are `(labels, probabilities)` in predecessor order.
//! Its scalar coefficient gates gradient production entirely: coefficient 0
//! means the layer contributes to nobody's backward fan-in and its own
//! backward step is a no-op.

use ndarray::ArrayView2;

use super::label_index;
use crate::backend::{self, Matrix};
use crate::error::{Error, Result};

const PROB_FLOOR: f32 = 1e-10;

/// Concrete cost kind, resolved from a textual type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CostKind {
    Logreg,
}

impl CostKind {
    pub fn from_tag(tag: &str) -> Result<Self> {
        match tag {
            "cost.logreg" => Ok(CostKind::Logreg),
            other => Err(Error::UnknownCostType(other.to_string())),
        }
    }

    pub fn tag(self) -> &'static str {
        match self {
            CostKind::Logreg => "cost.logreg",
        }
    }
}

#[derive(Debug)]
pub struct CostLayer {
    pub kind: CostKind,
    pub coeff: f32,
    /// Per-pass error metrics, ordered: [summed negative log-likelihood,
    /// misclassified case count].
    pub metrics: Vec<f32>,
}

impl CostLayer {
    pub fn new(kind: CostKind, coeff: f32) -> Self {
        CostLayer {
            kind,
            coeff,
            metrics: Vec::new(),
        }
    }

    /// Computes the pass metrics from label indices and predicted
    /// probabilities.
    pub fn forward(&mut self, labels: &ArrayView2<'_, f32>, probs: &ArrayView2<'_, f32>) {
        assert_eq!(labels.nrows(), probs.nrows(), "label count mismatch");
        let mut nll = 0.0;
        let mut wrong = 0usize;
        for (case, row) in probs.rows().into_iter().enumerate() {
            let label = label_index(labels[(case, 0)], row.len());
            nll -= row[label].max(PROB_FLOOR).ln();
            let argmax = row
                .iter()
                .enumerate()
                .fold((0, f32::NEG_INFINITY), |best, (i, &v)| {
                    if v > best.1 {
                        (i, v)
                    } else {
                        best
                    }
                })
                .0;
            if argmax != label {
                wrong += 1;
            }
        }
        self.metrics = vec![nll, wrong as f32];
    }

    /// Explicit gradient toward the probability input:
    /// `−coeff · onehot(label) / p`. The graph driver skips this call when
    /// the predecessor softmax takes the fused path instead.
    pub fn input_gradient(
        &self,
        labels: &ArrayView2<'_, f32>,
        probs: &ArrayView2<'_, f32>,
        dst: &mut Matrix,
        overwrite: bool,
    ) {
        let mut contribution = Matrix::zeros(probs.dim());
        for (case, mut row) in contribution.rows_mut().into_iter().enumerate() {
            let label = label_index(labels[(case, 0)], row.len());
            row[label] = -self.coeff / probs[(case, label)].max(PROB_FLOOR);
        }
        backend::accumulate(dst, &contribution.view(), overwrite);
    }
}
