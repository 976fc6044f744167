//! Response and contrast normalization layers
//!
//! Both retain the buffers their closed-form backward needs (denominators,
//! and for contrast norm the mean-centred activations); those buffers follow
//! the graph's gradient-retention truncation policy.

use ndarray::ArrayView2;

use crate::backend::{
    self, contrast_norm_backward, contrast_norm_forward, response_norm_backward,
    response_norm_forward, Matrix, NormGeometry,
};

/// Cross-map response normalization.
#[derive(Debug)]
pub struct ResponseNormLayer {
    pub geom: NormGeometry,
    pub scale: f32,
    pub pow: f32,
    denoms: Matrix,
}

impl ResponseNormLayer {
    pub fn new(geom: NormGeometry, scale: f32, pow: f32) -> Self {
        ResponseNormLayer {
            geom,
            scale,
            pow,
            denoms: backend::empty(),
        }
    }

    pub fn forward(&mut self, input: &ArrayView2<'_, f32>, acts: &mut Matrix) {
        response_norm_forward(&self.geom, self.scale, self.pow, input, acts, &mut self.denoms);
    }

    pub fn input_gradient(
        &self,
        input: &ArrayView2<'_, f32>,
        grad: &Matrix,
        dst: &mut Matrix,
        overwrite: bool,
    ) {
        response_norm_backward(
            &self.geom,
            self.scale,
            self.pow,
            input,
            &self.denoms,
            &grad.view(),
            dst,
            overwrite,
        );
    }

    pub fn truncate_transients(&mut self) {
        self.denoms = backend::empty();
    }
}

/// Contrast normalization: spatially mean-centred response normalization.
#[derive(Debug)]
pub struct ContrastNormLayer {
    pub geom: NormGeometry,
    pub scale: f32,
    pub pow: f32,
    denoms: Matrix,
    mean_diffs: Matrix,
}

impl ContrastNormLayer {
    pub fn new(geom: NormGeometry, scale: f32, pow: f32) -> Self {
        ContrastNormLayer {
            geom,
            scale,
            pow,
            denoms: backend::empty(),
            mean_diffs: backend::empty(),
        }
    }

    pub fn forward(&mut self, input: &ArrayView2<'_, f32>, acts: &mut Matrix) {
        contrast_norm_forward(
            &self.geom,
            self.scale,
            self.pow,
            input,
            acts,
            &mut self.denoms,
            &mut self.mean_diffs,
        );
    }

    pub fn input_gradient(&self, grad: &Matrix, dst: &mut Matrix, overwrite: bool) {
        contrast_norm_backward(
            &self.geom,
            self.scale,
            self.pow,
            &self.mean_diffs,
            &self.denoms,
            &grad.view(),
            dst,
            overwrite,
        );
    }

    pub fn truncate_transients(&mut self) {
        self.denoms = backend::empty();
        self.mean_diffs = backend::empty();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    #[test]
    fn test_response_norm_retains_denoms_until_truncated() {
        let geom = NormGeometry {
            channels: 2,
            img_size: 2,
            size_x: 3,
        };
        let mut layer = ResponseNormLayer::new(geom, 0.1, 0.75);
        let input = Array2::from_shape_fn((1, 8), |(_, i)| i as f32 * 0.5);
        let mut acts = backend::empty();
        layer.forward(&input.view(), &mut acts);
        assert_eq!(layer.denoms.dim(), (1, 8));
        layer.truncate_transients();
        assert_eq!(layer.denoms.len(), 0);
    }

    #[test]
    fn test_contrast_norm_retains_both_buffers() {
        let geom = NormGeometry {
            channels: 1,
            img_size: 3,
            size_x: 3,
        };
        let mut layer = ContrastNormLayer::new(geom, 0.1, 0.75);
        let input = Array2::from_shape_fn((2, 9), |(c, i)| (c + i) as f32);
        let mut acts = backend::empty();
        layer.forward(&input.view(), &mut acts);
        assert_eq!(layer.denoms.dim(), (2, 9));
        assert_eq!(layer.mean_diffs.dim(), (2, 9));
        layer.truncate_transients();
        assert_eq!(layer.denoms.len() + layer.mean_diffs.len(), 0);
    }
}
