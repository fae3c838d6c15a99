//! ndarray <-> nalgebra bridging.
//!
//! Arrays live in ndarray everywhere in the crate; factorizations go through
//! nalgebra's Cholesky.

use nalgebra::{Cholesky, DMatrix, DVector, Dyn};
use ndarray::{Array1, Array2};

#[inline]
pub fn to_dmatrix(a: &Array2<f64>) -> DMatrix<f64> {
    DMatrix::from_fn(a.nrows(), a.ncols(), |i, j| a[[i, j]])
}

#[inline]
pub fn to_dvector(v: &Array1<f64>) -> DVector<f64> {
    DVector::from_iterator(v.len(), v.iter().copied())
}

#[inline]
pub fn to_array2(m: &DMatrix<f64>) -> Array2<f64> {
    let (nrows, ncols) = m.shape();
    Array2::from_shape_fn((nrows, ncols), |(i, j)| m[(i, j)])
}

#[inline]
pub fn to_array1(v: &DVector<f64>) -> Array1<f64> {
    Array1::from_vec(v.as_slice().to_vec())
}

/// Cholesky factor of a symmetric positive-definite matrix, rejected when a
/// pivot is tiny relative to the caller's per-column scale.
pub struct SpdFactor {
    chol: Cholesky<f64, Dyn>,
}

impl SpdFactor {
    /// `Err(j)` names the first column whose pivot fails the check
    pub fn new(a: &Array2<f64>, scale: &[f64], tolerance: f64) -> Result<Self, usize> {
        let p = a.nrows();
        let m = to_dmatrix(a);
        let chol = match m.clone().cholesky() {
            Some(chol) => chol,
            None => return Err(first_failing_column(&m)),
        };

        let l = chol.l();
        for j in 0..p {
            let pivot_sq = l[(j, j)] * l[(j, j)];
            let reference = scale.get(j).copied().unwrap_or(1.0).max(f64::MIN_POSITIVE);
            if !pivot_sq.is_finite() || pivot_sq <= tolerance * reference {
                return Err(j);
            }
        }
        Ok(Self { chol })
    }

    pub fn solve(&self, b: &Array1<f64>) -> Array1<f64> {
        to_array1(&self.chol.solve(&to_dvector(b)))
    }

    pub fn inverse(&self) -> Array2<f64> {
        to_array2(&self.chol.inverse())
    }
}

/// smallest leading block that isn't positive definite
fn first_failing_column(m: &DMatrix<f64>) -> usize {
    let p = m.nrows();
    (1..=p)
        .find(|&k| m.view((0, 0), (k, k)).into_owned().cholesky().is_none())
        .map_or(p.saturating_sub(1), |k| k - 1)
}
