#![allow(clippy::needless_range_loop)]
//! Symmetric eigendecomposition.
//!
//! Wraps faer's self-adjoint eigensolver. Used both for the kinship matrix
//! (large, once per chromosome) and for the small `X' (K + delta I)^{-1} X`
//! matrices inside every likelihood evaluation.

use crate::dense::DenseMatrix;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LinalgError {
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Matrix is not symmetric (max asymmetry {asymmetry:.3e})")]
    NotSymmetric { asymmetry: f64 },

    #[error("Matrix contains non-finite entries")]
    NonFinite,
}

/// Tolerance (relative to the largest absolute entry) for symmetry checks.
const SYMMETRY_TOL: f64 = 1e-8;

/// Eigenvalues and orthonormal eigenvectors of a symmetric matrix.
///
/// `values[k]` belongs to column `k` of `vectors`; values are ascending.
#[derive(Debug, Clone)]
pub struct SymmetricEigen {
    pub values: Vec<f64>,
    pub vectors: DenseMatrix,
}

impl SymmetricEigen {
    /// Decompose a symmetric matrix. Only the lower triangle is read by the
    /// solver, but a grossly asymmetric input is rejected.
    pub fn new(a: &DenseMatrix) -> Result<Self, LinalgError> {
        let n = a.nrows();
        if n != a.ncols() {
            return Err(LinalgError::DimensionMismatch {
                expected: n,
                got: a.ncols(),
            });
        }
        if a.has_nan() || a.diag().iter().any(|v| !v.is_finite()) {
            return Err(LinalgError::NonFinite);
        }
        let mut scale: f64 = 0.0;
        for j in 0..n {
            for i in 0..n {
                scale = scale.max(a.get(i, j).abs());
            }
        }
        let asymmetry = a.max_asymmetry();
        if asymmetry > SYMMETRY_TOL * scale.max(1.0) {
            return Err(LinalgError::NotSymmetric { asymmetry });
        }

        let evd = a.as_faer().selfadjoint_eigendecomposition(faer::Side::Lower);
        let s = evd.s().column_vector();
        let u = evd.u();

        let mut order: Vec<usize> = (0..n).collect();
        let values_raw: Vec<f64> = (0..n).map(|i| s.read(i)).collect();
        order.sort_by(|&x, &y| values_raw[x].total_cmp(&values_raw[y]));

        let values = order.iter().map(|&k| values_raw[k]).collect();
        let vectors = DenseMatrix::from_fn(n, n, |i, j| u.read(i, order[j]));
        Ok(Self { values, vectors })
    }

    /// Number of eigenpairs.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Keep only the eigenpairs whose eigenvalue is strictly above `threshold`.
    pub fn retain_above(self, threshold: f64) -> Self {
        let keep: Vec<usize> = (0..self.values.len())
            .filter(|&k| self.values[k] > threshold)
            .collect();
        let values = keep.iter().map(|&k| self.values[k]).collect();
        let vectors = self.vectors.select_columns(&keep);
        Self { values, vectors }
    }

    /// Sum of log eigenvalues. `None` when any eigenvalue is not positive.
    pub fn log_determinant(&self) -> Option<f64> {
        if self.values.iter().any(|&v| v <= 0.0) {
            return None;
        }
        Some(self.values.iter().map(|v| v.ln()).sum())
    }

    /// Pseudo-inverse solve `V diag(1/lambda) V' b` over the held eigenpairs.
    pub fn pseudo_solve(&self, b: &[f64]) -> Vec<f64> {
        let n = self.vectors.nrows();
        assert_eq!(b.len(), n);
        let mut x = vec![0.0; n];
        for k in 0..self.values.len() {
            let mut proj = 0.0;
            for i in 0..n {
                proj += self.vectors.get(i, k) * b[i];
            }
            let coef = proj / self.values[k];
            for i in 0..n {
                x[i] += self.vectors.get(i, k) * coef;
            }
        }
        x
    }

    /// Diagonal of the pseudo-inverse `V diag(1/lambda) V'`.
    pub fn pseudo_inverse_diag(&self) -> Vec<f64> {
        let n = self.vectors.nrows();
        (0..n)
            .map(|i| {
                (0..self.values.len())
                    .map(|k| {
                        let v = self.vectors.get(i, k);
                        v * v / self.values[k]
                    })
                    .sum()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eigenvalues_and_log_determinant() {
        let a = DenseMatrix::from_row_major(2, 2, &[3.0, 1.0, 1.0, 3.0]);
        let evd = SymmetricEigen::new(&a).unwrap();
        assert!((evd.values[0] - 2.0).abs() < 1e-10);
        assert!((evd.values[1] - 4.0).abs() < 1e-10);
        assert!((evd.log_determinant().unwrap() - 8f64.ln()).abs() < 1e-10);

        let singular = DenseMatrix::from_row_major(2, 2, &[1.0, 1.0, 1.0, 1.0]);
        let evd = SymmetricEigen::new(&singular).unwrap();
        assert!(evd.log_determinant().is_none());
        assert!((evd.retain_above(1e-10).log_determinant().unwrap() - 2f64.ln()).abs() < 1e-10);
    }

    #[test]
    fn test_reconstruction() {
        let a = DenseMatrix::from_row_major(3, 3, &[4.0, 2.0, 1.0, 2.0, 5.0, 3.0, 1.0, 3.0, 6.0]);
        let evd = SymmetricEigen::new(&a).unwrap();
        assert!(evd.values.windows(2).all(|w| w[0] <= w[1]));
        let scaled = DenseMatrix::from_fn(3, 3, |i, j| evd.vectors.get(i, j) * evd.values[j]);
        let back = scaled.mat_mul(&evd.vectors.transpose());
        assert!(back.max_abs_diff(&a) < 1e-10, "V L V' != A:\n{}", back);
    }

    #[test]
    fn test_pseudo_solve_full_rank() {
        let a = DenseMatrix::from_row_major(2, 2, &[4.0, 2.0, 2.0, 3.0]);
        let evd = SymmetricEigen::new(&a).unwrap();
        let b = vec![1.0, 2.0];
        let x = evd.pseudo_solve(&b);
        let ax = a.mat_mul(&DenseMatrix::from_vec(&x)).col(0);
        for i in 0..2 {
            assert!((ax[i] - b[i]).abs() < 1e-10, "ax[{}]={} != {}", i, ax[i], b[i]);
        }
        // inverse of [[4,2],[2,3]] is [[3,-2],[-2,4]] / 8
        let d = evd.pseudo_inverse_diag();
        assert!((d[0] - 3.0 / 8.0).abs() < 1e-10);
        assert!((d[1] - 4.0 / 8.0).abs() < 1e-10);
    }

    #[test]
    fn test_retain_above_drops_null_direction() {
        // Rank-one matrix [1,1]' [1,1]
        let a = DenseMatrix::from_row_major(2, 2, &[1.0, 1.0, 1.0, 1.0]);
        let evd = SymmetricEigen::new(&a).unwrap().retain_above(1e-10);
        assert_eq!(evd.len(), 1);
        assert!((evd.values[0] - 2.0).abs() < 1e-10);
        assert!((evd.log_determinant().unwrap() - 2f64.ln()).abs() < 1e-10);
    }

    #[test]
    fn test_rejects_asymmetric() {
        let a = DenseMatrix::from_row_major(2, 2, &[1.0, 3.0, 0.0, 1.0]);
        assert!(matches!(
            SymmetricEigen::new(&a),
            Err(LinalgError::NotSymmetric { .. })
        ));
    }
}
