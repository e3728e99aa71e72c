//! Ridge parameterizations and the shifted kinship spectrum.
//!
//! The random-effect / noise trade-off can be written three ways:
//! heritability `h2`, ridge `delta = 1/h2 - 1`, or `log_delta`. A
//! `ShiftedSpectrum` fixes one value and caches `values + delta` together
//! with `log det(K + delta I)`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::eigen::EigenDecomposition;
use crate::error::{LmmError, LmmResult};

/// One of the three equivalent ridge parameterizations.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Ridge {
    /// Heritability, `0 < h2 <= 1`.
    H2(f64),
    /// Natural log of the ridge, any finite value.
    LogDelta(f64),
    /// Ridge, `delta >= 0`.
    Delta(f64),
}

impl Ridge {
    /// Build from optional values. Exactly one must be given.
    pub fn from_options(
        h2: Option<f64>,
        log_delta: Option<f64>,
        delta: Option<f64>,
    ) -> LmmResult<Ridge> {
        let ridge = match (h2, log_delta, delta) {
            (Some(v), None, None) => Ridge::H2(v),
            (None, Some(v), None) => Ridge::LogDelta(v),
            (None, None, Some(v)) => Ridge::Delta(v),
            (None, None, None) => {
                return Err(LmmError::InvalidParameterization(
                    "one of h2, log_delta, delta is required".into(),
                ))
            }
            _ => {
                return Err(LmmError::InvalidParameterization(
                    "only one of h2, log_delta, delta may be given".into(),
                ))
            }
        };
        ridge.delta()?;
        Ok(ridge)
    }

    /// The ridge value, validating the domain of whichever form is held.
    pub fn delta(self) -> LmmResult<f64> {
        match self {
            Ridge::H2(h2) => {
                if !(h2 > 0.0 && h2 <= 1.0) {
                    return Err(LmmError::InvalidParameterization(format!(
                        "h2 must be in (0, 1], got {}",
                        h2
                    )));
                }
                Ok(1.0 / h2 - 1.0)
            }
            Ridge::LogDelta(log_delta) => {
                if !log_delta.is_finite() {
                    return Err(LmmError::InvalidParameterization(format!(
                        "log_delta must be finite, got {}",
                        log_delta
                    )));
                }
                Ok(log_delta.exp())
            }
            Ridge::Delta(delta) => {
                if !(delta >= 0.0 && delta.is_finite()) {
                    return Err(LmmError::InvalidParameterization(format!(
                        "delta must be finite and >= 0, got {}",
                        delta
                    )));
                }
                Ok(delta)
            }
        }
    }

    pub fn h2(self) -> LmmResult<f64> {
        Ok(h2_from_delta(self.delta()?))
    }

    pub fn log_delta(self) -> LmmResult<f64> {
        Ok(self.delta()?.ln())
    }
}

pub fn h2_from_delta(delta: f64) -> f64 {
    1.0 / (delta + 1.0)
}

/// Kinship spectrum at a fixed ridge.
#[derive(Debug, Clone)]
pub struct ShiftedSpectrum {
    eigen: Arc<EigenDecomposition>,
    delta: f64,
    shifted_values: Vec<f64>,
    log_determinant: f64,
}

impl ShiftedSpectrum {
    pub fn new(eigen: &Arc<EigenDecomposition>, ridge: Ridge) -> LmmResult<Self> {
        let delta = ridge.delta()?;
        let (log_determinant, shifted_values) = eigen.log_determinant(delta)?;
        Ok(Self {
            eigen: Arc::clone(eigen),
            delta,
            shifted_values,
            log_determinant,
        })
    }

    pub fn eigen(&self) -> &Arc<EigenDecomposition> {
        &self.eigen
    }

    pub fn delta(&self) -> f64 {
        self.delta
    }

    pub fn h2(&self) -> f64 {
        h2_from_delta(self.delta)
    }

    /// `-inf` when delta is zero.
    pub fn log_delta(&self) -> f64 {
        self.delta.ln()
    }

    /// `values + delta`, one per eigenpair.
    pub fn shifted_values(&self) -> &[f64] {
        &self.shifted_values
    }

    /// `log det(K + delta I)`.
    pub fn log_determinant(&self) -> f64 {
        self.log_determinant
    }

    pub fn row_count(&self) -> usize {
        self.eigen.row_count()
    }

    pub fn is_low_rank(&self) -> bool {
        self.eigen.is_low_rank()
    }

    /// Whether forms computed under `self` and `other` may be combined:
    /// same decomposition and bit-identical ridge.
    pub fn is_compatible(&self, other: &ShiftedSpectrum) -> bool {
        std::ptr::eq(self, other)
            || (Arc::ptr_eq(&self.eigen, &other.eigen)
                && self.delta.to_bits() == other.delta.to_bits()
                && self.log_determinant.to_bits() == other.log_determinant.to_bits())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lmm_linalg::DenseMatrix;

    fn full_rank() -> Arc<EigenDecomposition> {
        let k = DenseMatrix::from_row_major(2, 2, &[2.0, 0.5, 0.5, 1.0]);
        Arc::new(EigenDecomposition::from_kinship(&k).unwrap())
    }

    #[test]
    fn test_exactly_one_parameterization() {
        assert!(matches!(
            Ridge::from_options(None, None, None),
            Err(LmmError::InvalidParameterization(_))
        ));
        assert!(matches!(
            Ridge::from_options(Some(0.5), Some(0.0), None),
            Err(LmmError::InvalidParameterization(_))
        ));
        assert_eq!(
            Ridge::from_options(None, None, Some(1.0)).unwrap(),
            Ridge::Delta(1.0)
        );
    }

    #[test]
    fn test_domain_checks() {
        assert!(Ridge::H2(0.0).delta().is_err());
        assert!(Ridge::H2(1.5).delta().is_err());
        assert!(Ridge::Delta(-1.0).delta().is_err());
        assert!(Ridge::LogDelta(f64::INFINITY).delta().is_err());
        assert_eq!(Ridge::H2(1.0).delta().unwrap(), 0.0);
    }

    #[test]
    fn test_conversions() {
        assert!((Ridge::H2(0.5).delta().unwrap() - 1.0).abs() < 1e-15);
        assert!((Ridge::Delta(3.0).h2().unwrap() - 0.25).abs() < 1e-15);
        assert!(Ridge::LogDelta(0.0).h2().unwrap() == 0.5);
    }

    #[test]
    fn test_full_rank_log_determinant() {
        let eigen = full_rank();
        let shifted = ShiftedSpectrum::new(&eigen, Ridge::Delta(0.5)).unwrap();
        // det(K + 0.5 I) = 2.5 * 1.5 - 0.25
        assert!((shifted.log_determinant() - 3.5f64.ln()).abs() < 1e-12);
        assert!((shifted.h2() - 2.0 / 3.0).abs() < 1e-15);
    }

    #[test]
    fn test_zero_delta_low_rank_is_singular() {
        let g = DenseMatrix::from_row_major(3, 1, &[1.0, 0.0, -1.0]);
        let eigen = Arc::new(EigenDecomposition::from_standardized_markers(&g, 1e-8).unwrap());
        assert!(matches!(
            ShiftedSpectrum::new(&eigen, Ridge::H2(1.0)),
            Err(LmmError::SingularModel(_))
        ));
    }

    #[test]
    fn test_compatibility() {
        let eigen = full_rank();
        let a = ShiftedSpectrum::new(&eigen, Ridge::Delta(1.0)).unwrap();
        let b = ShiftedSpectrum::new(&eigen, Ridge::Delta(1.0)).unwrap();
        let c = ShiftedSpectrum::new(&eigen, Ridge::Delta(2.0)).unwrap();
        assert!(a.is_compatible(&b));
        assert!(!a.is_compatible(&c));
        let other = full_rank();
        let d = ShiftedSpectrum::new(&other, Ridge::Delta(1.0)).unwrap();
        assert!(!a.is_compatible(&d));
    }
}
