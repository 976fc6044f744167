//! Max and average pooling kernels
//!
//! Windows are `size_x` square, placed at `start + k·stride` per axis within
//! each channel, clipped to the image. Max backward routes the gradient to
//! the first window position (scan order) that attained the maximum; the
//! forward kernel selects the maximum with the same scan order, so the two
//! always agree on ties.

use ndarray::ArrayView2;

use super::Matrix;

/// Spatial geometry of one pooling layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolGeometry {
    pub channels: usize,
    /// Input side length per channel.
    pub img_size: usize,
    /// Window side length.
    pub size_x: usize,
    /// Offset of the first window, may be negative.
    pub start: isize,
    pub stride: usize,
    /// Output positions per spatial axis.
    pub outputs_x: usize,
}

impl PoolGeometry {
    pub fn input_len(&self) -> usize {
        self.channels * self.img_size * self.img_size
    }

    pub fn output_len(&self) -> usize {
        self.channels * self.outputs_x * self.outputs_x
    }

    pub fn window_area(&self) -> f32 {
        (self.size_x * self.size_x) as f32
    }

    /// In-bounds pixel coordinates of an output window, scan order.
    fn window(&self, oy: usize, ox: usize) -> impl Iterator<Item = (usize, usize)> + '_ {
        let y0 = self.start + (oy * self.stride) as isize;
        let x0 = self.start + (ox * self.stride) as isize;
        let s = self.img_size as isize;
        (0..self.size_x as isize).flat_map(move |dy| {
            (0..self.size_x as isize).filter_map(move |dx| {
                let (y, x) = (y0 + dy, x0 + dx);
                if y >= 0 && y < s && x >= 0 && x < s {
                    Some((y as usize, x as usize))
                } else {
                    None
                }
            })
        })
    }
}

pub fn max_pool_forward(geom: &PoolGeometry, input: &ArrayView2<'_, f32>, out: &mut Matrix) {
    assert_eq!(input.ncols(), geom.input_len(), "pool input width mismatch");
    let cases = input.nrows();
    if out.dim() != (cases, geom.output_len()) {
        *out = Matrix::zeros((cases, geom.output_len()));
    }
    let s = geom.img_size;
    let ox_n = geom.outputs_x;
    for case in 0..cases {
        for c in 0..geom.channels {
            for oy in 0..ox_n {
                for ox in 0..ox_n {
                    let mut best = f32::NEG_INFINITY;
                    for (y, x) in geom.window(oy, ox) {
                        let v = input[(case, c * s * s + y * s + x)];
                        // strict comparison keeps the first position on ties
                        if v > best {
                            best = v;
                        }
                    }
                    out[(case, c * ox_n * ox_n + oy * ox_n + ox)] = best;
                }
            }
        }
    }
}

/// Routes each output gradient to the window position that produced the max.
pub fn max_pool_backward(
    geom: &PoolGeometry,
    input: &ArrayView2<'_, f32>,
    grad: &ArrayView2<'_, f32>,
    dst: &mut Matrix,
    overwrite: bool,
) {
    assert_eq!(grad.ncols(), geom.output_len(), "pool gradient width mismatch");
    let cases = input.nrows();
    prepare_dst(dst, (cases, geom.input_len()), overwrite);
    let s = geom.img_size;
    let ox_n = geom.outputs_x;
    for case in 0..cases {
        for c in 0..geom.channels {
            for oy in 0..ox_n {
                for ox in 0..ox_n {
                    let g = grad[(case, c * ox_n * ox_n + oy * ox_n + ox)];
                    let mut best = f32::NEG_INFINITY;
                    let mut best_pos = None;
                    for (y, x) in geom.window(oy, ox) {
                        let v = input[(case, c * s * s + y * s + x)];
                        if v > best {
                            best = v;
                            best_pos = Some((y, x));
                        }
                    }
                    if let Some((y, x)) = best_pos {
                        dst[(case, c * s * s + y * s + x)] += g;
                    }
                }
            }
        }
    }
}

pub fn avg_pool_forward(geom: &PoolGeometry, input: &ArrayView2<'_, f32>, out: &mut Matrix) {
    assert_eq!(input.ncols(), geom.input_len(), "pool input width mismatch");
    let cases = input.nrows();
    if out.dim() != (cases, geom.output_len()) {
        *out = Matrix::zeros((cases, geom.output_len()));
    }
    let s = geom.img_size;
    let ox_n = geom.outputs_x;
    let area = geom.window_area();
    for case in 0..cases {
        for c in 0..geom.channels {
            for oy in 0..ox_n {
                for ox in 0..ox_n {
                    let mut sum = 0.0;
                    for (y, x) in geom.window(oy, ox) {
                        sum += input[(case, c * s * s + y * s + x)];
                    }
                    out[(case, c * ox_n * ox_n + oy * ox_n + ox)] = sum / area;
                }
            }
        }
    }
}

/// Spreads each output gradient equally over its window; overlapping windows
/// accumulate at shared positions.
pub fn avg_pool_backward(
    geom: &PoolGeometry,
    grad: &ArrayView2<'_, f32>,
    cases: usize,
    dst: &mut Matrix,
    overwrite: bool,
) {
    assert_eq!(grad.ncols(), geom.output_len(), "pool gradient width mismatch");
    prepare_dst(dst, (cases, geom.input_len()), overwrite);
    let s = geom.img_size;
    let ox_n = geom.outputs_x;
    let area = geom.window_area();
    for case in 0..cases {
        for c in 0..geom.channels {
            for oy in 0..ox_n {
                for ox in 0..ox_n {
                    let g = grad[(case, c * ox_n * ox_n + oy * ox_n + ox)] / area;
                    for (y, x) in geom.window(oy, ox) {
                        dst[(case, c * s * s + y * s + x)] += g;
                    }
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

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    fn geom_4x4() -> PoolGeometry {
        // 4x4 image, one channel, 2x2 windows, stride 2 -> 2x2 outputs
        PoolGeometry {
            channels: 1,
            img_size: 4,
            size_x: 2,
            start: 0,
            stride: 2,
            outputs_x: 2,
        }
    }

    #[test]
    fn test_max_pool_forward() {
        let geom = geom_4x4();
        let input = array![[
            1.0, 2.0, 5.0, 6.0, //
            3.0, 4.0, 7.0, 8.0, //
            -1.0, -2.0, 0.0, 0.0, //
            -3.0, -4.0, 0.0, 9.0
        ]];
        let mut out = super::super::empty();
        max_pool_forward(&geom, &input.view(), &mut out);
        assert_eq!(out, array![[4.0, 8.0, -1.0, 9.0]]);
    }

    #[test]
    fn test_max_pool_backward_routes_to_unique_max() {
        let geom = geom_4x4();
        let input = array![[
            1.0, 2.0, 5.0, 6.0, //
            3.0, 4.0, 7.0, 8.0, //
            -1.0, -2.0, 0.0, 0.0, //
            -3.0, -4.0, 0.0, 9.0
        ]];
        let grad = array![[10.0, 20.0, 30.0, 40.0]];
        let mut dst = super::super::empty();
        max_pool_backward(&geom, &input.view(), &grad.view(), &mut dst, true);
        // whole gradient lands on the argmax of each window, zero elsewhere
        assert_eq!(dst[(0, 5)], 10.0);
        assert_eq!(dst[(0, 7)], 20.0);
        assert_eq!(dst[(0, 8)], 30.0);
        assert_eq!(dst[(0, 15)], 40.0);
        assert_eq!(dst.sum(), 100.0);
    }

    #[test]
    fn test_max_pool_tie_break_matches_forward() {
        // all-equal window: the first scanned position wins
        let geom = PoolGeometry {
            channels: 1,
            img_size: 2,
            size_x: 2,
            start: 0,
            stride: 2,
            outputs_x: 1,
        };
        let input = array![[7.0, 7.0, 7.0, 7.0]];
        let mut out = super::super::empty();
        max_pool_forward(&geom, &input.view(), &mut out);
        assert_eq!(out, array![[7.0]]);
        let grad = array![[1.0]];
        let mut dst = super::super::empty();
        max_pool_backward(&geom, &input.view(), &grad.view(), &mut dst, true);
        assert_eq!(dst, array![[1.0, 0.0, 0.0, 0.0]]);
    }

    #[test]
    fn test_avg_pool_forward_backward() {
        let geom = geom_4x4();
        let input = array![[
            1.0, 2.0, 5.0, 6.0, //
            3.0, 4.0, 7.0, 8.0, //
            0.0, 0.0, 0.0, 0.0, //
            0.0, 0.0, 0.0, 4.0
        ]];
        let mut out = super::super::empty();
        avg_pool_forward(&geom, &input.view(), &mut out);
        assert_eq!(out, array![[2.5, 6.5, 0.0, 1.0]]);

        let grad = array![[4.0, 8.0, 0.0, 0.0]];
        let mut dst = super::super::empty();
        avg_pool_backward(&geom, &grad.view(), 1, &mut dst, true);
        // each position of a 2x2 window gets g / 4
        assert_relative_eq!(dst[(0, 0)], 1.0);
        assert_relative_eq!(dst[(0, 2)], 2.0);
        assert_relative_eq!(dst.sum(), 12.0);
    }

    #[test]
    fn test_avg_pool_overlapping_windows_accumulate() {
        // stride 1 windows overlap: shared pixels sum their shares
        let geom = PoolGeometry {
            channels: 1,
            img_size: 3,
            size_x: 2,
            start: 0,
            stride: 1,
            outputs_x: 2,
        };
        let grad = array![[4.0, 4.0, 4.0, 4.0]];
        let mut dst = super::super::empty();
        avg_pool_backward(&geom, &grad.view(), 1, &mut dst, true);
        // centre pixel is in all four windows
        assert_relative_eq!(dst[(0, 4)], 4.0);
        // corners are in exactly one
        assert_relative_eq!(dst[(0, 0)], 1.0);
    }
}
