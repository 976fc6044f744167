//! Dense 2-D tensor helpers on top of ndarray
//!
//! Activation and gradient buffers are `Array2<f32>` stored cases-by-dims.
//! The overwrite-vs-accumulate policy used throughout backward passes is
//! expressed with scale factors (`general_mat_mul`'s beta, or the explicit
//! [`accumulate`] helper), never by callers mutating shared orientation
//! state: a consumer reading a transposed producer takes an [`oriented`]
//! view constructed per access.

mod conv;
mod norm;
mod pool;

pub use conv::{conv_backward_input, conv_backward_weights, conv_forward, ConvGeometry};
pub use norm::{
    contrast_norm_backward, contrast_norm_forward, response_norm_backward, response_norm_forward,
    NormGeometry,
};
pub use pool::{
    avg_pool_backward, avg_pool_forward, max_pool_backward, max_pool_forward, PoolGeometry,
};

use ndarray::{Array1, Array2, ArrayView2, Axis};

/// Dense 2-D buffer, cases along rows.
pub type Matrix = Array2<f32>;

/// A zero-sized buffer, used as the truncated state.
pub fn empty() -> Matrix {
    Matrix::zeros((0, 0))
}

/// Logical view of a stored buffer under an explicit orientation.
///
/// Storage is always cases-by-dims; a transposed consumer gets the axes
/// reversed without touching the underlying data.
pub fn oriented(m: &Matrix, transposed: bool) -> ArrayView2<'_, f32> {
    if transposed {
        m.t()
    } else {
        m.view()
    }
}

/// dst = contribution (overwrite) or dst += contribution (accumulate).
///
/// On overwrite the destination is reallocated if its shape differs, which
/// also covers writing into a truncated (empty) buffer.
pub fn accumulate(dst: &mut Matrix, contribution: &ArrayView2<'_, f32>, overwrite: bool) {
    if overwrite {
        if dst.dim() != contribution.dim() {
            *dst = contribution.to_owned();
        } else {
            dst.assign(contribution);
        }
    } else {
        assert_eq!(dst.dim(), contribution.dim(), "gradient shape mismatch");
        *dst += contribution;
    }
}

/// dst = a @ b (overwrite) or dst += a @ b (accumulate), via gemm scale factors.
pub fn matmul_acc(
    a: &ArrayView2<'_, f32>,
    b: &ArrayView2<'_, f32>,
    dst: &mut Matrix,
    overwrite: bool,
) {
    let out_dim = (a.nrows(), b.ncols());
    if overwrite {
        if dst.dim() != out_dim {
            *dst = Matrix::zeros(out_dim);
        }
    } else {
        assert_eq!(dst.dim(), out_dim, "gradient shape mismatch");
    }
    let beta = if overwrite { 0.0 } else { 1.0 };
    ndarray::linalg::general_mat_mul(1.0, a, b, beta, dst);
}

/// Column sums: reduce over cases, one value per dim.
pub fn col_sums(m: &Matrix) -> Array1<f32> {
    m.sum_axis(Axis(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_oriented_view() {
        let m = array![[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]];
        assert_eq!(oriented(&m, false).dim(), (3, 2));
        assert_eq!(oriented(&m, true).dim(), (2, 3));
        assert_eq!(oriented(&m, true)[(1, 2)], 6.0);
    }

    #[test]
    fn test_accumulate_overwrite_then_add() {
        let mut dst = empty();
        let c1 = array![[1.0, 2.0], [3.0, 4.0]];
        let c2 = array![[10.0, 20.0], [30.0, 40.0]];
        accumulate(&mut dst, &c1.view(), true);
        accumulate(&mut dst, &c2.view(), false);
        assert_eq!(dst, array![[11.0, 22.0], [33.0, 44.0]]);
    }

    #[test]
    fn test_matmul_acc_scale_factors() {
        let a = array![[1.0, 2.0]];
        let b = array![[3.0, 0.0], [0.0, 5.0]];
        let mut dst = empty();
        matmul_acc(&a.view(), &b.view(), &mut dst, true);
        assert_eq!(dst, array![[3.0, 10.0]]);
        matmul_acc(&a.view(), &b.view(), &mut dst, false);
        assert_eq!(dst, array![[6.0, 20.0]]);
    }

    #[test]
    fn test_col_sums() {
        let m = array![[1.0, 2.0], [3.0, 4.0]];
        assert_eq!(col_sums(&m), ndarray::arr1(&[4.0, 6.0]));
    }
}
