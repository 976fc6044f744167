//! Pooling layer: max or average over sliding windows

use ndarray::ArrayView2;

use crate::backend::{
    avg_pool_backward, avg_pool_forward, max_pool_backward, max_pool_forward, Matrix, PoolGeometry,
};
use crate::error::{Error, Result};

/// Pooling variant, resolved from the configuration tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    Max,
    Avg,
}

impl PoolKind {
    pub fn from_tag(tag: &str) -> Result<Self> {
        match tag {
            "max" => Ok(PoolKind::Max),
            "avg" => Ok(PoolKind::Avg),
            other => Err(Error::UnknownPoolKind(other.to_string())),
        }
    }
}

#[derive(Debug)]
pub struct PoolLayer {
    pub kind: PoolKind,
    pub geom: PoolGeometry,
}

impl PoolLayer {
    pub fn new(kind: PoolKind, geom: PoolGeometry) -> Self {
        PoolLayer { kind, geom }
    }

    pub fn forward(&self, input: &ArrayView2<'_, f32>, acts: &mut Matrix) {
        match self.kind {
            PoolKind::Max => max_pool_forward(&self.geom, input, acts),
            PoolKind::Avg => avg_pool_forward(&self.geom, input, acts),
        }
    }

    /// Max routes the gradient to the forward argmax; avg spreads it over the
    /// window. Max needs the predecessor activations to find the argmax.
    pub fn input_gradient(
        &self,
        input: &ArrayView2<'_, f32>,
        grad: &Matrix,
        dst: &mut Matrix,
        overwrite: bool,
    ) {
        match self.kind {
            PoolKind::Max => max_pool_backward(&self.geom, input, &grad.view(), dst, overwrite),
            PoolKind::Avg => {
                avg_pool_backward(&self.geom, &grad.view(), input.nrows(), dst, overwrite)
            }
        }
    }
}
