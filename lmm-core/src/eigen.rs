//! Kinship eigendecomposition and eigen-space rotations.
//!
//! `EigenDecomposition` holds `K = V diag(values) V'` with `V` an n x r
//! orthonormal basis. When r < n the decomposition is low rank and every
//! rotation keeps the component of the data orthogonal to `V`, which the
//! quadratic forms need for the `(I - V V') / delta` correction.

use std::collections::BTreeMap;
use std::sync::Arc;

use lmm_linalg::{DenseMatrix, SymmetricEigen};
use tracing::{debug, warn};

use crate::error::{LmmError, LmmResult};
use crate::kinship::kinship_from_markers;

/// Eigenpairs at or below this value are dropped when building a
/// decomposition from standardized markers.
pub const DEFAULT_MIN_EIGENVALUE: f64 = 1e-8;

#[derive(Debug, Clone)]
pub struct EigenDecomposition {
    values: Vec<f64>,
    /// n x r, orthonormal columns.
    vectors: DenseMatrix,
}

impl EigenDecomposition {
    pub fn new(values: Vec<f64>, vectors: DenseMatrix) -> LmmResult<Self> {
        if vectors.ncols() != values.len() {
            return Err(LmmError::dims(
                "eigenvector columns vs eigenvalues",
                values.len(),
                vectors.ncols(),
            ));
        }
        if vectors.ncols() > vectors.nrows() {
            return Err(LmmError::dims(
                "eigendecomposition rank exceeds row count",
                vectors.nrows(),
                vectors.ncols(),
            ));
        }
        Ok(Self { values, vectors })
    }

    /// Full eigendecomposition of a symmetric n x n kinship matrix.
    ///
    /// Negative eigenvalues are clamped to zero, so `K + delta I` stays
    /// positive definite for every `delta > 0`.
    pub fn from_kinship(kinship: &DenseMatrix) -> LmmResult<Self> {
        let evd = SymmetricEigen::new(kinship)?;
        if evd.values.iter().any(|&v| v < -0.1) {
            warn!("kernel contains a negative eigenvalue");
        }
        let n_negative = evd.values.iter().filter(|&&v| v < 0.0).count();
        if n_negative > 0 {
            debug!("Clamping {} negative kinship eigenvalues to zero", n_negative);
        }
        let values = evd.values.iter().map(|&v| v.max(0.0)).collect();
        debug!("Decomposed {}x{} kinship", kinship.nrows(), kinship.ncols());
        Self::new(values, evd.vectors)
    }

    /// Decomposition of `K = G G' / m` for unit-standardized markers `G` (n x m).
    ///
    /// With fewer markers than individuals the m x m Gram matrix is decomposed
    /// instead and the eigenvectors are mapped back, giving a low-rank result.
    /// Eigenpairs with eigenvalue `<= min_eigenvalue` are dropped.
    pub fn from_standardized_markers(g: &DenseMatrix, min_eigenvalue: f64) -> LmmResult<Self> {
        let (n, m) = (g.nrows(), g.ncols());
        if m == 0 {
            return Self::new(Vec::new(), DenseMatrix::zeros(n, 0));
        }
        if m < n {
            let gram = g.t_mat_mul(g).scale(1.0 / m as f64);
            let evd = SymmetricEigen::new(&gram)?.retain_above(min_eigenvalue);
            // U = G W / sqrt(lambda * m)
            let gw = g.mat_mul(&evd.vectors);
            let vectors = DenseMatrix::from_fn(n, evd.len(), |i, k| {
                gw.get(i, k) / (evd.values[k] * m as f64).sqrt()
            });
            Self::new(evd.values, vectors)
        } else {
            let kinship = kinship_from_markers(g);
            let evd = SymmetricEigen::new(&kinship)?.retain_above(min_eigenvalue);
            Self::new(evd.values, evd.vectors)
        }
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn vectors(&self) -> &DenseMatrix {
        &self.vectors
    }

    /// Number of individuals (n).
    pub fn row_count(&self) -> usize {
        self.vectors.nrows()
    }

    /// Number of eigenpairs (r).
    pub fn rank(&self) -> usize {
        self.values.len()
    }

    pub fn is_low_rank(&self) -> bool {
        self.rank() < self.row_count()
    }

    /// `values + delta` and `log det(K + delta I)`.
    ///
    /// In the low-rank case the n - r implicit zero eigenvalues each
    /// contribute `ln(delta)`.
    pub fn log_determinant(&self, delta: f64) -> LmmResult<(f64, Vec<f64>)> {
        if self.is_low_rank() && delta <= 0.0 {
            return Err(LmmError::SingularModel(format!(
                "delta = {} with a rank {} decomposition of {} individuals",
                delta,
                self.rank(),
                self.row_count()
            )));
        }
        let shifted: Vec<f64> = self.values.iter().map(|v| v + delta).collect();
        if let Some(k) = shifted.iter().position(|&s| s <= 0.0) {
            let detail = format!("eigenvalue {} + delta {} is not positive", self.values[k], delta);
            // A positive ridge that fails to lift a negative eigenvalue only
            // rules out this delta.
            return Err(if delta > 0.0 {
                LmmError::degenerate("shifted spectrum", detail)
            } else {
                LmmError::SingularModel(detail)
            });
        }
        let mut logdet: f64 = shifted.iter().map(|s| s.ln()).sum();
        if self.is_low_rank() {
            logdet += (self.row_count() - self.rank()) as f64 * delta.ln();
        }
        Ok((logdet, shifted))
    }

    /// Shorthand for [`Rotation::new`].
    pub fn rotate(self: &Arc<Self>, data: &DenseMatrix, labels: Vec<String>) -> LmmResult<Rotation> {
        Rotation::new(self, data, labels)
    }
}

/// Data projected onto the eigenbasis, with the orthogonal remainder kept
/// when the decomposition is low rank.
#[derive(Debug, Clone)]
pub struct Rotation {
    eigen: Arc<EigenDecomposition>,
    labels: Vec<String>,
    /// r x k, `V' D`
    rotated: DenseMatrix,
    /// n x k, `D - V V' D`; present iff low rank.
    residual: Option<DenseMatrix>,
}

impl Rotation {
    /// Rotate `data` (n x k) whose columns are named by `labels`.
    pub fn new(
        eigen: &Arc<EigenDecomposition>,
        data: &DenseMatrix,
        labels: Vec<String>,
    ) -> LmmResult<Self> {
        if data.nrows() != eigen.row_count() {
            return Err(LmmError::dims(
                "rotation rows vs decomposition rows",
                eigen.row_count(),
                data.nrows(),
            ));
        }
        if labels.len() != data.ncols() {
            return Err(LmmError::dims("rotation labels", data.ncols(), labels.len()));
        }
        let rotated = eigen.vectors().t_mat_mul(data);
        let residual = if eigen.is_low_rank() {
            Some(data.sub(&eigen.vectors().mat_mul(&rotated)))
        } else {
            None
        };
        Ok(Self {
            eigen: Arc::clone(eigen),
            labels,
            rotated,
            residual,
        })
    }

    /// Reassemble a rotation from stored parts, validating the shapes against
    /// the decomposition.
    pub fn from_parts(
        eigen: &Arc<EigenDecomposition>,
        labels: Vec<String>,
        rotated: DenseMatrix,
        residual: Option<DenseMatrix>,
    ) -> LmmResult<Self> {
        if rotated.nrows() != eigen.rank() {
            return Err(LmmError::dims("stored rotation rows", eigen.rank(), rotated.nrows()));
        }
        if labels.len() != rotated.ncols() {
            return Err(LmmError::dims("stored rotation labels", rotated.ncols(), labels.len()));
        }
        match (&residual, eigen.is_low_rank()) {
            (Some(r), true) => {
                if r.nrows() != eigen.row_count() || r.ncols() != rotated.ncols() {
                    return Err(LmmError::dims(
                        "stored rotation residual rows",
                        eigen.row_count(),
                        r.nrows(),
                    ));
                }
            }
            (None, false) => {}
            (Some(r), false) => {
                return Err(LmmError::dims("stored rotation residual rows", 0, r.nrows()))
            }
            (None, true) => {
                return Err(LmmError::dims(
                    "stored rotation residual rows",
                    eigen.row_count(),
                    0,
                ))
            }
        }
        Ok(Self {
            eigen: Arc::clone(eigen),
            labels,
            rotated,
            residual,
        })
    }

    pub fn eigen(&self) -> &Arc<EigenDecomposition> {
        &self.eigen
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn rotated(&self) -> &DenseMatrix {
        &self.rotated
    }

    pub fn residual(&self) -> Option<&DenseMatrix> {
        self.residual.as_ref()
    }

    pub fn ncols(&self) -> usize {
        self.rotated.ncols()
    }

    /// The rotation of a single column.
    pub fn column(&self, j: usize) -> Rotation {
        self.select(&[j])
    }

    /// The rotation of the listed columns.
    pub fn select(&self, columns: &[usize]) -> Rotation {
        Rotation {
            eigen: Arc::clone(&self.eigen),
            labels: columns.iter().map(|&j| self.labels[j].clone()).collect(),
            rotated: self.rotated.select_columns(columns),
            residual: self.residual.as_ref().map(|r| r.select_columns(columns)),
        }
    }
}

/// Kinship decompositions by chromosome.
#[derive(Debug, Clone)]
pub enum KinshipEigen {
    /// One decomposition used for every chromosome.
    GenomeWide(Arc<EigenDecomposition>),
    /// Leave-one-chromosome-out: a decomposition per tested chromosome.
    PerChromosome(BTreeMap<String, Arc<EigenDecomposition>>),
}

impl KinshipEigen {
    pub fn for_chromosome(&self, chrom: &str) -> Option<&Arc<EigenDecomposition>> {
        match self {
            KinshipEigen::GenomeWide(eigen) => Some(eigen),
            KinshipEigen::PerChromosome(map) => map.get(chrom),
        }
    }

    /// Row count shared by all decompositions; `None` if they disagree or
    /// there are none.
    pub fn row_count(&self) -> Option<usize> {
        match self {
            KinshipEigen::GenomeWide(eigen) => Some(eigen.row_count()),
            KinshipEigen::PerChromosome(map) => {
                let mut counts = map.values().map(|e| e.row_count());
                let first = counts.next()?;
                counts.all(|c| c == first).then_some(first)
            }
        }
    }
}
