//! Local normalization kernels
//!
//! Response normalization divides each activation by a denominator built from
//! the sum of squares over a `size_x`-wide cross-channel window at the same
//! pixel. Contrast normalization first subtracts a local spatial average
//! (same `size_x`, within the channel) and normalizes the centred values.
//! Both keep their denominator (and contrast the mean-difference) buffers for
//! the closed-form backward.

use ndarray::ArrayView2;

use super::Matrix;

/// Geometry shared by both normalization kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NormGeometry {
    pub channels: usize,
    /// Side length per channel.
    pub img_size: usize,
    /// Window width: channels for response norm, pixels for contrast norm.
    pub size_x: usize,
}

impl NormGeometry {
    pub fn input_len(&self) -> usize {
        self.channels * self.img_size * self.img_size
    }

    fn offset(&self) -> usize {
        (self.size_x - 1) / 2
    }

    /// Channel window centred on `c`.
    fn channel_window(&self, c: usize) -> std::ops::Range<usize> {
        let off = self.offset();
        let lo = c.saturating_sub(off);
        let hi = (c + self.size_x - off).min(self.channels);
        lo..hi
    }

    /// Channels whose window contains `c` (reverse lookup).
    fn channel_cowindow(&self, c: usize) -> std::ops::Range<usize> {
        let off = self.offset();
        let lo = (c + off + 1).saturating_sub(self.size_x);
        let hi = (c + off + 1).min(self.channels);
        lo..hi
    }

    /// Axis window centred on `v`, clipped to the image.
    fn axis_window(&self, v: usize) -> std::ops::Range<usize> {
        let off = self.offset();
        let lo = v.saturating_sub(off);
        let hi = (v + self.size_x - off).min(self.img_size);
        lo..hi
    }

    /// Axis positions whose window contains `v`.
    fn axis_cowindow(&self, v: usize) -> std::ops::Range<usize> {
        let off = self.offset();
        let lo = (v + off + 1).saturating_sub(self.size_x);
        let hi = (v + off + 1).min(self.img_size);
        lo..hi
    }
}

/// out = x · denom^(−pow) with denom = 1 + scale · Σ x² over the channel window.
pub fn response_norm_forward(
    geom: &NormGeometry,
    scale: f32,
    pow: f32,
    input: &ArrayView2<'_, f32>,
    out: &mut Matrix,
    denoms: &mut Matrix,
) {
    assert_eq!(input.ncols(), geom.input_len(), "norm input width mismatch");
    let cases = input.nrows();
    let dim = (cases, geom.input_len());
    if out.dim() != dim {
        *out = Matrix::zeros(dim);
    }
    if denoms.dim() != dim {
        *denoms = Matrix::zeros(dim);
    }
    let s2 = geom.img_size * geom.img_size;
    for case in 0..cases {
        for c in 0..geom.channels {
            for p in 0..s2 {
                let mut sumsq = 0.0;
                for j in geom.channel_window(c) {
                    let v = input[(case, j * s2 + p)];
                    sumsq += v * v;
                }
                let d = 1.0 + scale * sumsq;
                denoms[(case, c * s2 + p)] = d;
                out[(case, c * s2 + p)] = input[(case, c * s2 + p)] * d.powf(-pow);
            }
        }
    }
}

/// Closed-form response-norm input gradient, from the retained denominators.
pub fn response_norm_backward(
    geom: &NormGeometry,
    scale: f32,
    pow: f32,
    input: &ArrayView2<'_, f32>,
    denoms: &Matrix,
    grad: &ArrayView2<'_, f32>,
    dst: &mut Matrix,
    overwrite: bool,
) {
    let cases = input.nrows();
    prepare_dst(dst, (cases, geom.input_len()), overwrite);
    let s2 = geom.img_size * geom.img_size;
    for case in 0..cases {
        for c in 0..geom.channels {
            for p in 0..s2 {
                let i = c * s2 + p;
                let mut dx = grad[(case, i)] * denoms[(case, i)].powf(-pow);
                // cross terms: every channel whose window covers c
                let mut cross = 0.0;
                for j in geom.channel_cowindow(c) {
                    let jj = j * s2 + p;
                    cross += grad[(case, jj)]
                        * input[(case, jj)]
                        * denoms[(case, jj)].powf(-pow - 1.0);
                }
                dx -= 2.0 * scale * pow * input[(case, i)] * cross;
                dst[(case, i)] += dx;
            }
        }
    }
}

/// Contrast normalization forward: mean-centre spatially, then normalize.
///
/// Fills `mean_diffs` (centred activations) and `denoms`; both are needed by
/// the backward pass.
pub fn contrast_norm_forward(
    geom: &NormGeometry,
    scale: f32,
    pow: f32,
    input: &ArrayView2<'_, f32>,
    out: &mut Matrix,
    denoms: &mut Matrix,
    mean_diffs: &mut Matrix,
) {
    assert_eq!(input.ncols(), geom.input_len(), "norm input width mismatch");
    let cases = input.nrows();
    let dim = (cases, geom.input_len());
    if out.dim() != dim {
        *out = Matrix::zeros(dim);
    }
    if denoms.dim() != dim {
        *denoms = Matrix::zeros(dim);
    }
    if mean_diffs.dim() != dim {
        *mean_diffs = Matrix::zeros(dim);
    }
    let s = geom.img_size;
    let area = (geom.size_x * geom.size_x) as f32;
    for case in 0..cases {
        for c in 0..geom.channels {
            let base = c * s * s;
            for y in 0..s {
                for x in 0..s {
                    let mut sum = 0.0;
                    for wy in geom.axis_window(y) {
                        for wx in geom.axis_window(x) {
                            sum += input[(case, base + wy * s + wx)];
                        }
                    }
                    mean_diffs[(case, base + y * s + x)] =
                        input[(case, base + y * s + x)] - sum / area;
                }
            }
            for y in 0..s {
                for x in 0..s {
                    let mut sumsq = 0.0;
                    for wy in geom.axis_window(y) {
                        for wx in geom.axis_window(x) {
                            let v = mean_diffs[(case, base + wy * s + wx)];
                            sumsq += v * v;
                        }
                    }
                    let d = 1.0 + scale * sumsq;
                    denoms[(case, base + y * s + x)] = d;
                    out[(case, base + y * s + x)] =
                        mean_diffs[(case, base + y * s + x)] * d.powf(-pow);
                }
            }
        }
    }
}

/// Contrast-norm input gradient: response-norm-style gradient with respect to
/// the centred values, then chained through the mean subtraction.
#[allow(clippy::too_many_arguments)]
pub fn contrast_norm_backward(
    geom: &NormGeometry,
    scale: f32,
    pow: f32,
    mean_diffs: &Matrix,
    denoms: &Matrix,
    grad: &ArrayView2<'_, f32>,
    dst: &mut Matrix,
    overwrite: bool,
) {
    let cases = grad.nrows();
    prepare_dst(dst, (cases, geom.input_len()), overwrite);
    let s = geom.img_size;
    let area = (geom.size_x * geom.size_x) as f32;
    let mut gmd = vec![0.0f32; s * s];
    for case in 0..cases {
        for c in 0..geom.channels {
            let base = c * s * s;
            // gradient w.r.t. the mean-centred values
            for y in 0..s {
                for x in 0..s {
                    let q = base + y * s + x;
                    let mut v = grad[(case, q)] * denoms[(case, q)].powf(-pow);
                    let mut cross = 0.0;
                    for py in geom.axis_cowindow(y) {
                        for px in geom.axis_cowindow(x) {
                            let p = base + py * s + px;
                            cross += grad[(case, p)]
                                * mean_diffs[(case, p)]
                                * denoms[(case, p)].powf(-pow - 1.0);
                        }
                    }
                    v -= 2.0 * scale * pow * mean_diffs[(case, q)] * cross;
                    gmd[y * s + x] = v;
                }
            }
            // chain through md = x − local average
            for y in 0..s {
                for x in 0..s {
                    let mut v = gmd[y * s + x];
                    for py in geom.axis_cowindow(y) {
                        for px in geom.axis_cowindow(x) {
                            v -= gmd[py * s + px] / area;
                        }
                    }
                    dst[(case, base + y * s + x)] += v;
                }
            }
        }
    }
}

fn prepare_dst(dst: &mut Matrix, dim: (usize, usize), overwrite: bool) {
    if overwrite {
        if dst.dim() != dim {
            *dst = Matrix::zeros(dim);
        } else {
            dst.fill(0.0);
        }
    } else {
        assert_eq!(dst.dim(), dim, "gradient shape mismatch");
    }
}
