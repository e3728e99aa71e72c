#![allow(clippy::needless_range_loop)]
//! Dense matrix operations backed by faer.
//!
//! Wraps faer's column-major `Mat<f64>` with the handful of operations the
//! likelihood engine needs: products against transposes, row scaling by a
//! spectrum, column selection and block reads/writes for assembling small
//! quadratic-form matrices.

use std::ops::Range;

use faer::Mat;

/// A dense matrix wrapper around faer's `Mat<f64>`.
///
/// Rows are individuals and columns are variables wherever a matrix holds
/// per-individual data.
#[derive(Debug, Clone)]
pub struct DenseMatrix {
    inner: Mat<f64>,
}

impl DenseMatrix {
    /// Create a new dense matrix filled with zeros.
    pub fn zeros(nrows: usize, ncols: usize) -> Self {
        Self {
            inner: Mat::zeros(nrows, ncols),
        }
    }

    /// Create a new dense matrix filled with a constant value.
    pub fn full(nrows: usize, ncols: usize, value: f64) -> Self {
        Self {
            inner: Mat::from_fn(nrows, ncols, |_, _| value),
        }
    }

    /// Create a dense matrix by evaluating `f(row, col)` for every entry.
    pub fn from_fn(nrows: usize, ncols: usize, f: impl FnMut(usize, usize) -> f64) -> Self {
        Self {
            inner: Mat::from_fn(nrows, ncols, f),
        }
    }

    /// Create a dense matrix from a flat vec (column-major order).
    pub fn from_col_major(nrows: usize, ncols: usize, data: Vec<f64>) -> Self {
        assert_eq!(data.len(), nrows * ncols);
        let inner = Mat::from_fn(nrows, ncols, |i, j| data[j * nrows + i]);
        Self { inner }
    }

    /// Create a dense matrix from a row-major slice.
    pub fn from_row_major(nrows: usize, ncols: usize, data: &[f64]) -> Self {
        assert_eq!(data.len(), nrows * ncols);
        let inner = Mat::from_fn(nrows, ncols, |i, j| data[i * ncols + j]);
        Self { inner }
    }

    /// Build an n x k matrix from k column vectors of equal length.
    pub fn from_columns(columns: &[Vec<f64>]) -> Self {
        let ncols = columns.len();
        let nrows = columns.first().map_or(0, |c| c.len());
        assert!(columns.iter().all(|c| c.len() == nrows));
        let inner = Mat::from_fn(nrows, ncols, |i, j| columns[j][i]);
        Self { inner }
    }

    /// Create an identity matrix of size n x n.
    pub fn identity(n: usize) -> Self {
        let inner = Mat::from_fn(n, n, |i, j| if i == j { 1.0 } else { 0.0 });
        Self { inner }
    }

    /// Create a single-column matrix from a slice.
    pub fn from_vec(data: &[f64]) -> Self {
        let inner = Mat::from_fn(data.len(), 1, |i, _| data[i]);
        Self { inner }
    }

    pub fn nrows(&self) -> usize {
        self.inner.nrows()
    }

    pub fn ncols(&self) -> usize {
        self.inner.ncols()
    }

    /// Get element at (row, col).
    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.inner.read(row, col)
    }

    /// Set element at (row, col).
    pub fn set(&mut self, row: usize, col: usize, value: f64) {
        self.inner.write(row, col, value);
    }

    /// Get a reference to the underlying faer matrix.
    pub fn as_faer(&self) -> &Mat<f64> {
        &self.inner
    }

    /// Create from a faer matrix.
    pub fn from_faer(mat: Mat<f64>) -> Self {
        Self { inner: mat }
    }

    /// Matrix-matrix product: self * other.
    pub fn mat_mul(&self, other: &DenseMatrix) -> DenseMatrix {
        assert_eq!(self.ncols(), other.nrows());
        DenseMatrix {
            inner: &self.inner * &other.inner,
        }
    }

    /// Product with the transpose on the left: self' * other.
    ///
    /// This is the shape of every rotation (`V' D`) and every quadratic form
    /// (`A' B`) in the engine.
    pub fn t_mat_mul(&self, other: &DenseMatrix) -> DenseMatrix {
        assert_eq!(self.nrows(), other.nrows());
        let lhs = self.inner.transpose().to_owned();
        DenseMatrix {
            inner: &lhs * &other.inner,
        }
    }

    /// Transpose.
    pub fn transpose(&self) -> DenseMatrix {
        DenseMatrix {
            inner: self.inner.transpose().to_owned(),
        }
    }

    /// Extract column as a Vec<f64>.
    pub fn col(&self, j: usize) -> Vec<f64> {
        (0..self.nrows()).map(|i| self.inner.read(i, j)).collect()
    }

    /// Set an entire column from a slice.
    pub fn set_col(&mut self, j: usize, data: &[f64]) {
        assert_eq!(data.len(), self.nrows());
        for i in 0..self.nrows() {
            self.inner.write(i, j, data[i]);
        }
    }

    /// Copy of a contiguous range of columns.
    pub fn columns(&self, range: Range<usize>) -> DenseMatrix {
        assert!(range.end <= self.ncols());
        let start = range.start;
        DenseMatrix::from_fn(self.nrows(), range.len(), |i, j| {
            self.inner.read(i, start + j)
        })
    }

    /// Copy of the listed columns, in the listed order.
    pub fn select_columns(&self, indices: &[usize]) -> DenseMatrix {
        DenseMatrix::from_fn(self.nrows(), indices.len(), |i, j| {
            self.inner.read(i, indices[j])
        })
    }

    /// Copy of the listed rows, in the listed order.
    pub fn select_rows(&self, indices: &[usize]) -> DenseMatrix {
        DenseMatrix::from_fn(indices.len(), self.ncols(), |i, j| {
            self.inner.read(indices[i], j)
        })
    }

    /// Copy of a rectangular block.
    pub fn block(&self, rows: Range<usize>, cols: Range<usize>) -> DenseMatrix {
        assert!(rows.end <= self.nrows() && cols.end <= self.ncols());
        let (r0, c0) = (rows.start, cols.start);
        DenseMatrix::from_fn(rows.len(), cols.len(), |i, j| self.inner.read(r0 + i, c0 + j))
    }

    /// Overwrite the block whose top-left corner is (row, col) with `src`.
    pub fn set_block(&mut self, row: usize, col: usize, src: &DenseMatrix) {
        assert!(row + src.nrows() <= self.nrows());
        assert!(col + src.ncols() <= self.ncols());
        for j in 0..src.ncols() {
            for i in 0..src.nrows() {
                self.inner.write(row + i, col + j, src.get(i, j));
            }
        }
    }

    /// Horizontal concatenation `[self | other]`.
    pub fn hstack(&self, other: &DenseMatrix) -> DenseMatrix {
        assert_eq!(self.nrows(), other.nrows());
        let left = self.ncols();
        DenseMatrix::from_fn(self.nrows(), left + other.ncols(), |i, j| {
            if j < left {
                self.inner.read(i, j)
            } else {
                other.get(i, j - left)
            }
        })
    }

    /// Divide row i by `divisors[i]`.
    pub fn div_rows(&self, divisors: &[f64]) -> DenseMatrix {
        assert_eq!(divisors.len(), self.nrows());
        DenseMatrix::from_fn(self.nrows(), self.ncols(), |i, j| {
            self.inner.read(i, j) / divisors[i]
        })
    }

    /// Element-wise addition: self + other.
    pub fn add(&self, other: &DenseMatrix) -> DenseMatrix {
        assert_eq!(self.nrows(), other.nrows());
        assert_eq!(self.ncols(), other.ncols());
        DenseMatrix::from_fn(self.nrows(), self.ncols(), |i, j| {
            self.inner.read(i, j) + other.get(i, j)
        })
    }

    /// Element-wise subtraction: self - other.
    pub fn sub(&self, other: &DenseMatrix) -> DenseMatrix {
        assert_eq!(self.nrows(), other.nrows());
        assert_eq!(self.ncols(), other.ncols());
        DenseMatrix::from_fn(self.nrows(), self.ncols(), |i, j| {
            self.inner.read(i, j) - other.get(i, j)
        })
    }

    /// Scalar multiplication.
    pub fn scale(&self, s: f64) -> DenseMatrix {
        DenseMatrix::from_fn(self.nrows(), self.ncols(), |i, j| self.inner.read(i, j) * s)
    }

    /// Diagonal of a square matrix.
    pub fn diag(&self) -> Vec<f64> {
        let n = self.nrows().min(self.ncols());
        (0..n).map(|i| self.inner.read(i, i)).collect()
    }

    /// Per-column inner products `sum_i self[i, j] * other[i, j]`.
    ///
    /// The diagonal of `self' * other` without forming the off-diagonal.
    pub fn column_dots(&self, other: &DenseMatrix) -> Vec<f64> {
        assert_eq!(self.nrows(), other.nrows());
        assert_eq!(self.ncols(), other.ncols());
        (0..self.ncols())
            .map(|j| {
                let mut s = 0.0;
                for i in 0..self.nrows() {
                    s += self.inner.read(i, j) * other.get(i, j);
                }
                s
            })
            .collect()
    }

    /// Largest absolute asymmetry `|a_ij - a_ji|` of a square matrix.
    pub fn max_asymmetry(&self) -> f64 {
        assert_eq!(self.nrows(), self.ncols());
        let mut worst: f64 = 0.0;
        for j in 0..self.ncols() {
            for i in (j + 1)..self.nrows() {
                worst = worst.max((self.inner.read(i, j) - self.inner.read(j, i)).abs());
            }
        }
        worst
    }

    /// Whether any entry is NaN.
    pub fn has_nan(&self) -> bool {
        (0..self.ncols()).any(|j| (0..self.nrows()).any(|i| self.inner.read(i, j).is_nan()))
    }

    /// Largest absolute element-wise difference to `other`.
    pub fn max_abs_diff(&self, other: &DenseMatrix) -> f64 {
        assert_eq!(self.nrows(), other.nrows());
        assert_eq!(self.ncols(), other.ncols());
        let mut worst: f64 = 0.0;
        for j in 0..self.ncols() {
            for i in 0..self.nrows() {
                worst = worst.max((self.inner.read(i, j) - other.get(i, j)).abs());
            }
        }
        worst
    }

    /// Dot product of two slices.
    pub fn dot(a: &[f64], b: &[f64]) -> f64 {
        assert_eq!(a.len(), b.len());
        a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
    }

    /// Extract data as a flat Vec in column-major order.
    pub fn to_col_major(&self) -> Vec<f64> {
        let mut data = Vec::with_capacity(self.nrows() * self.ncols());
        for j in 0..self.ncols() {
            for i in 0..self.nrows() {
                data.push(self.inner.read(i, j));
            }
        }
        data
    }
}

impl std::fmt::Display for DenseMatrix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for i in 0..self.nrows() {
            for j in 0..self.ncols() {
                if j > 0 {
                    write!(f, "\t")?;
                }
                write!(f, "{:.6}", self.inner.read(i, j))?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_t_mat_mul_matches_explicit_transpose() {
        let a = DenseMatrix::from_row_major(3, 2, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let b = DenseMatrix::from_row_major(3, 2, &[1.0, 0.0, 0.0, 1.0, 1.0, 1.0]);
        let direct = a.t_mat_mul(&b);
        let explicit = a.transpose().mat_mul(&b);
        assert_eq!(direct.nrows(), 2);
        assert_eq!(direct.ncols(), 2);
        assert!(direct.max_abs_diff(&explicit) < 1e-12);
        // col0(a) . col0(b) = 1 + 0 + 5
        assert!((direct.get(0, 0) - 6.0).abs() < 1e-12);
    }

    #[test]
    fn test_block_roundtrip() {
        let mut m = DenseMatrix::full(3, 3, f64::NAN);
        assert!(m.has_nan());
        let src = DenseMatrix::from_row_major(2, 2, &[1.0, 2.0, 3.0, 4.0]);
        m.set_block(0, 0, &src);
        assert_eq!(m.get(1, 0), 3.0);
        assert!(m.get(2, 2).is_nan());
        let back = m.block(0..2, 0..2);
        assert_eq!(back.max_abs_diff(&src), 0.0);
    }

    #[test]
    fn test_div_rows_and_column_dots() {
        let a = DenseMatrix::from_row_major(2, 2, &[2.0, 4.0, 9.0, 3.0]);
        let scaled = a.div_rows(&[2.0, 3.0]);
        assert_eq!(scaled.get(0, 1), 2.0);
        assert_eq!(scaled.get(1, 0), 3.0);
        let dots = a.column_dots(&scaled);
        // col0: 2*1 + 9*3, col1: 4*2 + 3*1
        assert!((dots[0] - 29.0).abs() < 1e-12);
        assert!((dots[1] - 11.0).abs() < 1e-12);
    }

    #[test]
    fn test_hstack_and_select() {
        let a = DenseMatrix::from_vec(&[1.0, 2.0]);
        let b = DenseMatrix::from_columns(&[vec![3.0, 4.0], vec![5.0, 6.0]]);
        let ab = a.hstack(&b);
        assert_eq!(ab.ncols(), 3);
        assert_eq!(ab.get(1, 2), 6.0);
        let picked = ab.select_columns(&[2, 0]);
        assert_eq!(picked.col(0), vec![5.0, 6.0]);
        assert_eq!(picked.col(1), vec![1.0, 2.0]);
        let rows = ab.select_rows(&[1]);
        assert_eq!(rows.nrows(), 1);
        assert_eq!(rows.get(0, 1), 4.0);
        assert_eq!(ab.columns(1..3).get(0, 0), 3.0);
    }

    #[test]
    fn test_max_asymmetry() {
        let m = DenseMatrix::from_row_major(2, 2, &[1.0, 2.0, 2.5, 1.0]);
        assert!((m.max_asymmetry() - 0.5).abs() < 1e-12);
    }
}
