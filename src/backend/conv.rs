//! Convolution kernels: forward, backward-input, backward-weights
//!
//! Buffers are cases-by-dims. An input row holds `channels` square images of
//! side `img_size`, channel-major (`c * img_size² + y * img_size + x`); an
//! output row holds `filters` module grids of side `modules_x`
//! (`f * modules_x² + my * modules_x + mx`). Filters live in a
//! `(channels · filter_size², filters)` matrix so the weight gradient is a
//! plain cross-correlation into the same shape.

use ndarray::ArrayView2;

use super::Matrix;

/// Spatial geometry of one convolution layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvGeometry {
    pub channels: usize,
    /// Input side length per channel (square images).
    pub img_size: usize,
    pub filters: usize,
    pub filter_size: usize,
    /// Zero padding applied symmetrically on all sides.
    pub padding: usize,
    pub stride: usize,
    /// Output positions per spatial axis.
    pub modules_x: usize,
}

impl ConvGeometry {
    pub fn input_len(&self) -> usize {
        self.channels * self.img_size * self.img_size
    }

    pub fn output_len(&self) -> usize {
        self.filters * self.modules_x * self.modules_x
    }

    pub fn modules(&self) -> usize {
        self.modules_x * self.modules_x
    }

    /// Rows of the filter matrix: one per (channel, filter pixel).
    pub fn weight_rows(&self) -> usize {
        self.channels * self.filter_size * self.filter_size
    }

    /// Top-left image coordinate of a module, possibly negative under padding.
    fn module_start(&self, m: usize) -> isize {
        m as isize * self.stride as isize - self.padding as isize
    }
}

/// Spatial convolution of every case against the filter bank.
///
/// Output is reallocated to `(cases, filters · modules_x²)`; bias and
/// activation are the layer's business.
pub fn conv_forward(geom: &ConvGeometry, input: &ArrayView2<'_, f32>, weights: &Matrix, out: &mut Matrix) {
    assert_eq!(input.ncols(), geom.input_len(), "conv input width mismatch");
    assert_eq!(weights.dim(), (geom.weight_rows(), geom.filters), "filter matrix shape mismatch");

    let cases = input.nrows();
    let s = geom.img_size;
    let fs = geom.filter_size;
    let mx = geom.modules_x;
    if out.dim() != (cases, geom.output_len()) {
        *out = Matrix::zeros((cases, geom.output_len()));
    }

    for case in 0..cases {
        for f in 0..geom.filters {
            for my in 0..mx {
                let y0 = geom.module_start(my);
                for mo in 0..mx {
                    let x0 = geom.module_start(mo);
                    let mut sum = 0.0;
                    for c in 0..geom.channels {
                        for fy in 0..fs {
                            let y = y0 + fy as isize;
                            if y < 0 || y >= s as isize {
                                continue;
                            }
                            for fx in 0..fs {
                                let x = x0 + fx as isize;
                                if x < 0 || x >= s as isize {
                                    continue;
                                }
                                let pix = input[(case, c * s * s + y as usize * s + x as usize)];
                                let w = weights[(c * fs * fs + fy * fs + fx, f)];
                                sum += pix * w;
                            }
                        }
                    }
                    out[(case, f * mx * mx + my * mx + mo)] = sum;
                }
            }
        }
    }
}

/// Transposed ("full") convolution of the incoming gradient against the
/// filter bank, scattered back onto the input shape.
///
/// `overwrite` selects the accumulation policy: replace the destination or
/// add to the contributions already there.
pub fn conv_backward_input(
    geom: &ConvGeometry,
    grad: &ArrayView2<'_, f32>,
    weights: &Matrix,
    dst: &mut Matrix,
    overwrite: bool,
) {
    assert_eq!(grad.ncols(), geom.output_len(), "conv gradient width mismatch");
    let cases = grad.nrows();
    let in_dim = (cases, geom.input_len());
    if overwrite {
        if dst.dim() != in_dim {
            *dst = Matrix::zeros(in_dim);
        } else {
            dst.fill(0.0);
        }
    } else {
        assert_eq!(dst.dim(), in_dim, "gradient shape mismatch");
    }

    let s = geom.img_size;
    let fs = geom.filter_size;
    let mx = geom.modules_x;
    for case in 0..cases {
        for f in 0..geom.filters {
            for my in 0..mx {
                let y0 = geom.module_start(my);
                for mo in 0..mx {
                    let x0 = geom.module_start(mo);
                    let g = grad[(case, f * mx * mx + my * mx + mo)];
                    if g == 0.0 {
                        continue;
                    }
                    for c in 0..geom.channels {
                        for fy in 0..fs {
                            let y = y0 + fy as isize;
                            if y < 0 || y >= s as isize {
                                continue;
                            }
                            for fx in 0..fs {
                                let x = x0 + fx as isize;
                                if x < 0 || x >= s as isize {
                                    continue;
                                }
                                dst[(case, c * s * s + y as usize * s + x as usize)] +=
                                    g * weights[(c * fs * fs + fy * fs + fx, f)];
                            }
                        }
                    }
                }
            }
        }
    }
}

/// Cross-correlation of activations against the incoming gradient, producing
/// the filter gradient.
///
/// With `partial_sum = Some(p)` and `p` smaller than the module count, the
/// reduction runs as per-tile partials (`p` modules each) into `partial_buf`
/// before summing down to the filter shape, bounding the working set. The
/// caller owns `partial_buf` so its truncation policy applies.
pub fn conv_backward_weights(
    geom: &ConvGeometry,
    input: &ArrayView2<'_, f32>,
    grad: &ArrayView2<'_, f32>,
    partial_sum: Option<usize>,
    wgrad: &mut Matrix,
    partial_buf: &mut Matrix,
) {
    assert_eq!(input.ncols(), geom.input_len(), "conv input width mismatch");
    assert_eq!(grad.ncols(), geom.output_len(), "conv gradient width mismatch");

    let w_rows = geom.weight_rows();
    let w_len = w_rows * geom.filters;
    let modules = geom.modules();
    let tiled = matches!(partial_sum, Some(p) if p > 0 && p < modules);

    if tiled {
        let p = partial_sum.unwrap_or(modules);
        let tiles = modules.div_ceil(p);
        if partial_buf.dim() != (tiles, w_len) {
            *partial_buf = Matrix::zeros((tiles, w_len));
        } else {
            partial_buf.fill(0.0);
        }
        accumulate_weight_grad(geom, input, grad, |module, row, f, v| {
            partial_buf[(module / p, row * geom.filters + f)] += v;
        });
        if wgrad.dim() != (w_rows, geom.filters) {
            *wgrad = Matrix::zeros((w_rows, geom.filters));
        }
        for row in 0..w_rows {
            for f in 0..geom.filters {
                let mut sum = 0.0;
                for t in 0..tiles {
                    sum += partial_buf[(t, row * geom.filters + f)];
                }
                wgrad[(row, f)] = sum;
            }
        }
    } else {
        if wgrad.dim() != (w_rows, geom.filters) {
            *wgrad = Matrix::zeros((w_rows, geom.filters));
        } else {
            wgrad.fill(0.0);
        }
        accumulate_weight_grad(geom, input, grad, |_module, row, f, v| {
            wgrad[(row, f)] += v;
        });
    }
}

fn accumulate_weight_grad<F: FnMut(usize, usize, usize, f32)>(
    geom: &ConvGeometry,
    input: &ArrayView2<'_, f32>,
    grad: &ArrayView2<'_, f32>,
    mut sink: F,
) {
    let s = geom.img_size;
    let fs = geom.filter_size;
    let mx = geom.modules_x;
    for case in 0..input.nrows() {
        for f in 0..geom.filters {
            for my in 0..mx {
                let y0 = geom.module_start(my);
                for mo in 0..mx {
                    let x0 = geom.module_start(mo);
                    let g = grad[(case, f * mx * mx + my * mx + mo)];
                    if g == 0.0 {
                        continue;
                    }
                    for c in 0..geom.channels {
                        for fy in 0..fs {
                            let y = y0 + fy as isize;
                            if y < 0 || y >= s as isize {
                                continue;
                            }
                            for fx in 0..fs {
                                let x = x0 + fx as isize;
                                if x < 0 || x >= s as isize {
                                    continue;
                                }
                                let pix = input[(case, c * s * s + y as usize * s + x as usize)];
                                sink(my * mx + mo, c * fs * fs + fy * fs + fx, f, pix * g);
                            }
                        }
                    }
                }
            }
        }
    }
}
