//! ndarray <-> faer interop for the loss-processing strategies.
//!
//! All block-level state lives in ndarray containers; faer supplies the
//! Cholesky factorization behind `BackwardExact` and the GEMM/GEMV kernels
//! for block products once operands are large enough to amortize kernel
//! setup. Small products stay on ndarray.

use faer::linalg::matmul::matmul;
use faer::linalg::solvers::{self, Solve};
use faer::{Accum, Mat, MatMut, MatRef, Par, Side, get_global_parallelism};
use ndarray::{Array1, Array2, ArrayBase, Data, Ix1, Ix2};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FaerLinalgError {
    #[error("Cholesky factorization failed: {0:?}")]
    Cholesky(solvers::LltError),
}

#[inline]
fn use_faer_kernel(m: usize, n: usize, k: usize) -> bool {
    // Dispatch policy: tiny products are cheaper on ndarray, moderate and
    // larger ones go through faer GEMM/GEMV.
    const MIN_DIM: usize = 32;
    const MIN_FLOP_SCALE: usize = 64 * 64;
    (m >= MIN_DIM || n >= MIN_DIM || k >= MIN_DIM)
        && m.saturating_mul(n).saturating_mul(k) >= MIN_FLOP_SCALE
}

/// Borrowed faer view over an ndarray matrix.
///
/// Block slices of the design matrix are contiguous row ranges with positive
/// strides and can be viewed in place; anything else (e.g. reversed axes) is
/// materialized into a compact copy first, since faer kernels assume a
/// forward memory traversal.
pub struct MatView<'a> {
    borrowed: Option<(&'a f64, usize, usize, isize, isize)>,
    owned: Option<Array2<f64>>,
}

impl<'a> MatView<'a> {
    pub fn new<S: Data<Elem = f64>>(array: &'a ArrayBase<S, Ix2>) -> Self {
        let (rows, cols) = array.dim();
        let strides = array.strides();
        if rows > 0 && cols > 0 && strides[0] > 0 && strides[1] > 0 {
            // SAFETY-relevant invariant: the reference pins the backing
            // ndarray storage for the lifetime of this view.
            let first = unsafe { &*array.as_ptr() };
            MatView {
                borrowed: Some((first, rows, cols, strides[0], strides[1])),
                owned: None,
            }
        } else {
            MatView {
                borrowed: None,
                owned: Some(array.to_owned()),
            }
        }
    }

    #[inline]
    pub fn as_ref(&self) -> MatRef<'_, f64> {
        match (&self.borrowed, &self.owned) {
            (Some((first, rows, cols, rs, cs)), _) => {
                // SAFETY: pointer, shape, and strides come from a live ndarray
                // view with positive strides held for the view's lifetime.
                unsafe { MatRef::from_raw_parts(*first as *const f64, *rows, *cols, *rs, *cs) }
            }
            (None, Some(owned)) => {
                let strides = owned.strides();
                // SAFETY: the owned copy is compact and lives inside `self`.
                unsafe {
                    MatRef::from_raw_parts(
                        owned.as_ptr(),
                        owned.nrows(),
                        owned.ncols(),
                        strides[0],
                        strides[1],
                    )
                }
            }
            (None, None) => unreachable!("MatView holds either a borrow or an owned copy"),
        }
    }
}

/// Borrowed faer column view over an ndarray vector.
pub struct ColView<'a> {
    borrowed: Option<(&'a f64, usize, isize)>,
    owned: Option<Array1<f64>>,
}

impl<'a> ColView<'a> {
    pub fn new<S: Data<Elem = f64>>(array: &'a ArrayBase<S, Ix1>) -> Self {
        let len = array.len();
        let stride = array.strides()[0];
        if len > 0 && stride > 0 {
            let first = unsafe { &*array.as_ptr() };
            ColView {
                borrowed: Some((first, len, stride)),
                owned: None,
            }
        } else {
            ColView {
                borrowed: None,
                owned: Some(array.to_owned()),
            }
        }
    }

    #[inline]
    pub fn as_ref(&self) -> MatRef<'_, f64> {
        match (&self.borrowed, &self.owned) {
            (Some((first, len, stride)), _) => {
                // SAFETY: see MatView::as_ref.
                unsafe { MatRef::from_raw_parts(*first as *const f64, *len, 1, *stride, 0) }
            }
            (None, Some(owned)) => {
                // SAFETY: the owned copy is compact and lives inside `self`.
                unsafe { MatRef::from_raw_parts(owned.as_ptr(), owned.len(), 1, 1, 0) }
            }
            (None, None) => unreachable!("ColView holds either a borrow or an owned copy"),
        }
    }
}

#[inline]
pub fn array1_to_col_mat_mut(array: &mut Array1<f64>) -> MatMut<'_, f64> {
    let len = array.len();
    let stride = array.strides()[0];
    // SAFETY: raw parts taken directly from the live ndarray buffer.
    unsafe { MatMut::from_raw_parts_mut(array.as_mut_ptr(), len, 1, stride, 0) }
}

fn mat_to_array2(mat: MatRef<'_, f64>) -> Array2<f64> {
    let mut out = Array2::<f64>::zeros((mat.nrows(), mat.ncols()));
    for j in 0..mat.ncols() {
        for i in 0..mat.nrows() {
            out[[i, j]] = mat[(i, j)];
        }
    }
    out
}

fn col_to_array1(mat: MatRef<'_, f64>) -> Array1<f64> {
    let mut out = Array1::<f64>::zeros(mat.nrows());
    for i in 0..mat.nrows() {
        out[i] = mat[(i, 0)];
    }
    out
}

#[inline]
fn par_for(dims: &[usize]) -> Par {
    if dims.iter().any(|&d| d < 128) {
        Par::Seq
    } else {
        get_global_parallelism()
    }
}

/// `A * v` for `A` of shape `(n, p)` and `v` of length `p`.
#[inline]
pub fn fast_av<S1: Data<Elem = f64>, S2: Data<Elem = f64>>(
    a: &ArrayBase<S1, Ix2>,
    v: &ArrayBase<S2, Ix1>,
) -> Array1<f64> {
    let (n, p) = a.dim();
    debug_assert_eq!(p, v.len(), "A cols must match v length");
    if !use_faer_kernel(n, 1, p) {
        return a.dot(v);
    }
    let mut result = Mat::<f64>::zeros(n, 1);
    let a_view = MatView::new(a);
    let v_view = ColView::new(v);
    matmul(
        result.as_mut(),
        Accum::Replace,
        a_view.as_ref(),
        v_view.as_ref(),
        1.0,
        par_for(&[n, p]),
    );
    col_to_array1(result.as_ref())
}

/// `A^T * v` for `A` of shape `(n, p)` and `v` of length `n`.
#[inline]
pub fn fast_atv<S1: Data<Elem = f64>, S2: Data<Elem = f64>>(
    a: &ArrayBase<S1, Ix2>,
    v: &ArrayBase<S2, Ix1>,
) -> Array1<f64> {
    let (n, p) = a.dim();
    debug_assert_eq!(n, v.len(), "A rows must match v length");
    if !use_faer_kernel(p, 1, n) {
        return a.t().dot(v);
    }
    let mut result = Mat::<f64>::zeros(p, 1);
    let a_view = MatView::new(a);
    let v_view = ColView::new(v);
    matmul(
        result.as_mut(),
        Accum::Replace,
        a_view.as_ref().transpose(),
        v_view.as_ref(),
        1.0,
        par_for(&[n, p]),
    );
    col_to_array1(result.as_ref())
}

/// `A^T * A` for `A` of shape `(n, p)`, giving a `(p, p)` Gram matrix.
#[inline]
pub fn fast_ata<S: Data<Elem = f64>>(a: &ArrayBase<S, Ix2>) -> Array2<f64> {
    let (n, p) = a.dim();
    if !use_faer_kernel(p, p, n) {
        return a.t().dot(a);
    }
    let mut result = Mat::<f64>::zeros(p, p);
    let a_view = MatView::new(a);
    let a_ref = a_view.as_ref();
    matmul(
        result.as_mut(),
        Accum::Replace,
        a_ref.transpose(),
        a_ref,
        1.0,
        par_for(&[n, p]),
    );
    mat_to_array2(result.as_ref())
}

/// `A * A^T` for `A` of shape `(n, p)`, giving an `(n, n)` Gram matrix.
#[inline]
pub fn fast_aat<S: Data<Elem = f64>>(a: &ArrayBase<S, Ix2>) -> Array2<f64> {
    let (n, p) = a.dim();
    if !use_faer_kernel(n, n, p) {
        return a.dot(&a.t());
    }
    let mut result = Mat::<f64>::zeros(n, n);
    let a_view = MatView::new(a);
    let a_ref = a_view.as_ref();
    matmul(
        result.as_mut(),
        Accum::Replace,
        a_ref,
        a_ref.transpose(),
        1.0,
        par_for(&[n, p]),
    );
    mat_to_array2(result.as_ref())
}

/// Cached LLT factorization of a symmetric positive definite matrix.
pub struct CholeskyFactor {
    factor: solvers::Llt<f64>,
}

impl CholeskyFactor {
    pub fn solve_vec(&self, rhs: &Array1<f64>) -> Array1<f64> {
        let mut rhs = rhs.to_owned();
        let mut rhs_view = array1_to_col_mat_mut(&mut rhs);
        self.factor.solve_in_place(rhs_view.as_mut());
        rhs
    }
}

pub trait FaerCholesky {
    fn cholesky(&self, side: Side) -> Result<CholeskyFactor, FaerLinalgError>;
}

impl<S: Data<Elem = f64>> FaerCholesky for ArrayBase<S, Ix2> {
    fn cholesky(&self, side: Side) -> Result<CholeskyFactor, FaerLinalgError> {
        let view = MatView::new(self);
        let factor = solvers::Llt::new(view.as_ref(), side).map_err(FaerLinalgError::Cholesky)?;
        Ok(CholeskyFactor { factor })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn products_match_ndarray_reference() {
        let a = array![[1.0, 2.0, -1.0], [0.5, -3.0, 2.0], [2.0, 0.0, 1.0], [1.0, 1.0, 1.0]];
        let v3 = array![0.3, -1.2, 2.0];
        let v4 = array![1.0, -0.5, 0.25, 2.0];

        let av = fast_av(&a, &v3);
        let atv = fast_atv(&a, &v4);
        assert!((&av - &a.dot(&v3)).iter().all(|e| e.abs() < 1e-14));
        assert!((&atv - &a.t().dot(&v4)).iter().all(|e| e.abs() < 1e-14));

        let ata = fast_ata(&a);
        let aat = fast_aat(&a);
        assert!((&ata - &a.t().dot(&a)).iter().all(|e| e.abs() < 1e-14));
        assert!((&aat - &a.dot(&a.t())).iter().all(|e| e.abs() < 1e-14));
    }

    #[test]
    fn gram_views_handle_reversed_slices() {
        let a = array![[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]];
        let reversed = a.slice(ndarray::s![..;-1, ..]);
        let ata = fast_ata(&reversed);
        assert!(
            (&ata - &reversed.t().dot(&reversed))
                .iter()
                .all(|e| e.abs() < 1e-14)
        );
    }

    #[test]
    fn cholesky_solves_spd_system() {
        let m = array![[4.0, 1.0, 0.0], [1.0, 3.0, 0.5], [0.0, 0.5, 2.0]];
        let rhs = array![1.0, -2.0, 0.5];
        let factor = m.cholesky(Side::Lower).expect("SPD factorization");
        let x = factor.solve_vec(&rhs);
        let back = m.dot(&x);
        assert!((&back - &rhs).iter().all(|e| e.abs() < 1e-12));
    }

    #[test]
    fn cholesky_rejects_indefinite_matrix() {
        let m = array![[1.0, 2.0], [2.0, 1.0]];
        assert!(m.cholesky(Side::Lower).is_err());
    }
}
