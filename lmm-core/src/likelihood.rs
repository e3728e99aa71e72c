//! Generalized least squares and the (restricted) negative log-likelihood.
//!
//! Everything here works on the small quadratic forms `X'K^{-1}X`,
//! `y'K^{-1}y` and `X'K^{-1}y`; the n-dimensional work has already been done
//! by the rotations.

use std::f64::consts::PI;

use lmm_linalg::{DenseMatrix, SymmetricEigen};
use serde::{Deserialize, Serialize};

use crate::error::{LmmError, LmmResult};
use crate::quadratic::QuadraticForm;

/// Eigenvalues of `X'K^{-1}X` and `X'X` at or below this are dropped.
pub const RETAIN_THRESHOLD: f64 = 1e-10;

/// Residual sums of squares below this fraction of `y'K^{-1}y` mean the
/// covariates reproduce the phenotype exactly.
const RSS_REL_TOL: f64 = 1e-10;

/// Which likelihood the h2 search minimizes for the null model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LikelihoodObjective {
    #[default]
    Restricted,
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LikelihoodKind {
    /// Maximum likelihood.
    Full,
    /// REML, carrying `log det(X'X)` of the untransformed covariates.
    Restricted { log_det_xtx: f64 },
}

/// Fitted fixed effects and variance components at one ridge value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelFit {
    pub neg_log_likelihood: f64,
    pub beta: Vec<f64>,
    /// Sampling variance of each coefficient; ML fits only.
    pub beta_variance: Option<Vec<f64>>,
    /// Total variance scale `rss / n` (ML) or `rss / (n - p)` (REML).
    pub sigma2: f64,
    pub h2: f64,
    pub rss: f64,
    /// Rank of `X'K^{-1}X` after dropping tiny eigenvalues.
    pub retained_rank: usize,
}

impl ModelFit {
    pub fn log_likelihood(&self) -> f64 {
        -self.neg_log_likelihood
    }
}

/// Fit of the covariates-only model for one phenotype.
pub type NullModelResult = ModelFit;
/// Fit of the covariates-plus-marker model.
pub type AltModelResult = ModelFit;

#[derive(Debug, Clone, Copy)]
pub struct LikelihoodEvaluator {
    kind: LikelihoodKind,
}

impl LikelihoodEvaluator {
    pub fn full() -> Self {
        Self {
            kind: LikelihoodKind::Full,
        }
    }

    /// REML against the untransformed covariate matrix `x`.
    pub fn restricted(x: &DenseMatrix) -> LmmResult<Self> {
        Ok(Self::restricted_with(design_log_determinant(x)?))
    }

    pub fn restricted_with(log_det_xtx: f64) -> Self {
        Self {
            kind: LikelihoodKind::Restricted { log_det_xtx },
        }
    }

    pub fn for_objective(objective: LikelihoodObjective, x: &DenseMatrix) -> LmmResult<Self> {
        match objective {
            LikelihoodObjective::Full => Ok(Self::full()),
            LikelihoodObjective::Restricted => Self::restricted(x),
        }
    }

    pub fn kind(&self) -> LikelihoodKind {
        self.kind
    }

    pub fn evaluate(
        &self,
        xkx: &QuadraticForm,
        yky: &QuadraticForm,
        xky: &QuadraticForm,
    ) -> LmmResult<ModelFit> {
        let spectrum = xkx.spectrum();
        if !spectrum.is_compatible(yky.spectrum()) || !spectrum.is_compatible(xky.spectrum()) {
            return Err(LmmError::InconsistentSpectrum(
                "likelihood inputs computed under different spectra".into(),
            ));
        }
        let p = xkx.nrows();
        if xkx.ncols() != p {
            return Err(LmmError::dims("X'K^-1X columns", p, xkx.ncols()));
        }
        if xky.nrows() != p || xky.ncols() != 1 {
            return Err(LmmError::dims("X'K^-1y rows", p, xky.nrows()));
        }
        if !xkx.is_complete() || !xky.is_complete() {
            return Err(LmmError::UnsetBlock {
                context: format!("X'K^-1X over {:?}", xkx.rows()),
            });
        }
        let yky = yky.scalar()?;

        let xkx_eigen = SymmetricEigen::new(xkx.values())?.retain_above(RETAIN_THRESHOLD);
        let xky_vec = xky.values().col(0);
        let beta = xkx_eigen.pseudo_solve(&xky_vec);
        let rss = yky - DenseMatrix::dot(&xky_vec, &beta);

        let n = spectrum.row_count();
        let h2 = spectrum.h2();
        if !(rss > RSS_REL_TOL * yky.abs()) {
            return Err(LmmError::degenerate(
                "generalized least squares",
                format!("residual sum of squares {:.3e} is not positive", rss),
            ));
        }
        let logdet = spectrum.log_determinant();

        let fit = match self.kind {
            LikelihoodKind::Full => {
                let sigma2 = rss / n as f64;
                let nll = 0.5 * (logdet + n as f64 * ((2.0 * PI * sigma2).ln() + 1.0));
                let beta_variance = xkx_eigen
                    .pseudo_inverse_diag()
                    .into_iter()
                    .map(|d| h2 * sigma2 * d)
                    .collect();
                ModelFit {
                    neg_log_likelihood: nll,
                    beta,
                    beta_variance: Some(beta_variance),
                    sigma2,
                    h2,
                    rss,
                    retained_rank: xkx_eigen.len(),
                }
            }
            LikelihoodKind::Restricted { log_det_xtx } => {
                let rank = xkx_eigen.len();
                if rank >= n {
                    return Err(LmmError::degenerate(
                        "restricted likelihood",
                        format!("no residual degrees of freedom (rank {}, n {})", rank, n),
                    ));
                }
                let dof = (n - rank) as f64;
                let sigma2 = rss / dof;
                let logdet_xkx = xkx_eigen.log_determinant().ok_or_else(|| {
                    LmmError::degenerate("restricted likelihood", "X'K^-1X has no positive spectrum")
                })?;
                let nll = 0.5
                    * (logdet + logdet_xkx - log_det_xtx
                        + dof * ((2.0 * PI * sigma2).ln() + 1.0));
                ModelFit {
                    neg_log_likelihood: nll,
                    beta,
                    beta_variance: None,
                    sigma2,
                    h2,
                    rss,
                    retained_rank: rank,
                }
            }
        };

        if !fit.neg_log_likelihood.is_finite() {
            return Err(LmmError::degenerate(
                "likelihood",
                format!("negative log-likelihood is {}", fit.neg_log_likelihood),
            ));
        }
        Ok(fit)
    }
}

/// `log det(X'X)` over the eigenvalues above [`RETAIN_THRESHOLD`].
pub fn design_log_determinant(x: &DenseMatrix) -> LmmResult<f64> {
    let xtx = x.t_mat_mul(x);
    let evd = SymmetricEigen::new(&xtx)?.retain_above(RETAIN_THRESHOLD);
    if evd.is_empty() && x.ncols() > 0 {
        return Err(LmmError::degenerate(
            "covariate design",
            "X'X has no eigenvalue above the retention threshold",
        ));
    }
    evd.log_determinant()
        .ok_or_else(|| LmmError::degenerate("covariate design", "X'X has no positive spectrum"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eigen::{EigenDecomposition, Rotation};
    use crate::spectrum::{Ridge, ShiftedSpectrum};
    use std::sync::Arc;

    struct Forms {
        xkx: QuadraticForm,
        yky: QuadraticForm,
        xky: QuadraticForm,
    }

    fn forms(x: &DenseMatrix, y: &[f64], k: &DenseMatrix, delta: f64) -> Forms {
        let eigen = Arc::new(EigenDecomposition::from_kinship(k).unwrap());
        let spectrum = Arc::new(ShiftedSpectrum::new(&eigen, Ridge::Delta(delta)).unwrap());
        let labels = (0..x.ncols()).map(|j| format!("x{}", j)).collect();
        let x_rot = Rotation::new(&eigen, x, labels).unwrap();
        let y_rot = Rotation::new(&eigen, &DenseMatrix::from_vec(y), vec!["y".into()]).unwrap();
        Forms {
            xkx: QuadraticForm::from_rotations(&x_rot, &spectrum, &x_rot).unwrap(),
            yky: QuadraticForm::from_rotations(&y_rot, &spectrum, &y_rot).unwrap(),
            xky: QuadraticForm::from_rotations(&x_rot, &spectrum, &y_rot).unwrap(),
        }
    }

    #[test]
    fn test_identity_kinship_reduces_to_ols() {
        // K = I, delta = 1: V = 2I, so beta is the OLS estimate.
        let k = DenseMatrix::identity(4);
        let x = DenseMatrix::from_row_major(4, 2, &[1.0, 0.0, 1.0, 1.0, 1.0, 2.0, 1.0, 3.0]);
        let y = [1.0, 3.1, 4.9, 7.2];
        let f = forms(&x, &y, &k, 1.0);
        let fit = LikelihoodEvaluator::full().evaluate(&f.xkx, &f.yky, &f.xky).unwrap();

        let xbar = 1.5;
        let ybar = (1.0 + 3.1 + 4.9 + 7.2) / 4.0;
        let sxy: f64 = (0..4).map(|i| (i as f64 - xbar) * (y[i] - ybar)).sum();
        let sxx: f64 = (0..4).map(|i| (i as f64 - xbar).powi(2)).sum();
        let b1 = sxy / sxx;
        let b0 = ybar - b1 * xbar;
        assert!((fit.beta[0] - b0).abs() < 1e-10);
        assert!((fit.beta[1] - b1).abs() < 1e-10);
        assert_eq!(fit.retained_rank, 2);
        assert!((fit.h2 - 0.5).abs() < 1e-15);
        assert!(fit.beta_variance.is_some());
    }

    #[test]
    fn test_design_log_determinant_uses_retained_spectrum() {
        // X'X = diag(4, 9)
        let x = DenseMatrix::from_row_major(2, 2, &[2.0, 0.0, 0.0, 3.0]);
        assert!((design_log_determinant(&x).unwrap() - 36f64.ln()).abs() < 1e-10);

        // Duplicated column: X'X = [[2, 2], [2, 2]], one retained eigenvalue of 4.
        let dup = DenseMatrix::from_row_major(2, 2, &[1.0, 1.0, 1.0, 1.0]);
        assert!((design_log_determinant(&dup).unwrap() - 4f64.ln()).abs() < 1e-10);
    }

    #[test]
    fn test_collinear_design_drops_direction() {
        let k = DenseMatrix::identity(4);
        let x = DenseMatrix::from_row_major(4, 2, &[1.0, 2.0, 1.0, 2.0, 1.0, 2.0, 1.0, 2.0]);
        let f = forms(&x, &[1.0, 2.0, 0.5, 1.5], &k, 0.5);
        let fit = LikelihoodEvaluator::full().evaluate(&f.xkx, &f.yky, &f.xky).unwrap();
        assert_eq!(fit.retained_rank, 1);
        let reml = LikelihoodEvaluator::restricted(&x)
            .unwrap()
            .evaluate(&f.xkx, &f.yky, &f.xky)
            .unwrap();
        assert_eq!(reml.retained_rank, 1);
        assert!(reml.neg_log_likelihood.is_finite());
    }

    #[test]
    fn test_exact_fit_is_degenerate() {
        let k = DenseMatrix::identity(4);
        let x = DenseMatrix::from_row_major(4, 2, &[1.0, 0.0, 1.0, 1.0, 1.0, 2.0, 1.0, 3.0]);
        let y = [1.0, 3.0, 5.0, 7.0];
        let f = forms(&x, &y, &k, 1.0);
        let err = LikelihoodEvaluator::full().evaluate(&f.xkx, &f.yky, &f.xky).unwrap_err();
        assert!(err.is_local());
    }

    #[test]
    fn test_unset_block_rejected() {
        let k = DenseMatrix::identity(3);
        let x = DenseMatrix::from_vec(&[1.0, 1.0, 1.0]);
        let f = forms(&x, &[0.1, 0.5, 0.2], &k, 1.0);
        let unset = QuadraticForm::unset(vec!["x0".into()], vec!["x0".into()], f.xkx.spectrum());
        assert!(matches!(
            LikelihoodEvaluator::full().evaluate(&unset, &f.yky, &f.xky),
            Err(LmmError::UnsetBlock { .. })
        ));
    }

    #[test]
    fn test_mismatched_spectra_rejected() {
        let k = DenseMatrix::identity(3);
        let x = DenseMatrix::from_vec(&[1.0, 1.0, 1.0]);
        let a = forms(&x, &[0.1, 0.5, 0.2], &k, 1.0);
        let b = forms(&x, &[0.1, 0.5, 0.2], &k, 2.0);
        assert!(matches!(
            LikelihoodEvaluator::full().evaluate(&a.xkx, &b.yky, &a.xky),
            Err(LmmError::InconsistentSpectrum(_))
        ));
    }
}
