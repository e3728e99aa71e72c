//! One-dimensional heritability search.
//!
//! A fixed grid over `[min_h2, max_h2]` is scanned in parallel, then the best
//! grid point is optionally refined by golden-section search between its
//! neighbours. The refined point is kept only when it is strictly better.

use std::cell::RefCell;
use std::sync::Arc;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::eigen::{EigenDecomposition, Rotation};
use crate::error::{LmmError, LmmResult};
use crate::likelihood::{LikelihoodEvaluator, ModelFit};
use crate::quadratic::{QuadraticForm, ScaledRotation};
use crate::spectrum::{Ridge, ShiftedSpectrum};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct H2SearchConfig {
    pub min_h2: f64,
    pub max_h2: f64,
    /// Number of evenly spaced grid points, including both ends.
    pub n_grid: usize,
    /// Golden-section refinement around the best grid point.
    pub refine: bool,
    pub refine_tol: f64,
    pub refine_max_iter: usize,
}

impl Default for H2SearchConfig {
    fn default() -> Self {
        Self {
            min_h2: 1e-5,
            max_h2: 0.99999,
            n_grid: 10,
            refine: true,
            refine_tol: 1e-6,
            refine_max_iter: 100,
        }
    }
}

impl H2SearchConfig {
    pub fn validate(&self) -> LmmResult<()> {
        if !(self.min_h2 > 0.0 && self.max_h2 <= 1.0 && self.min_h2 < self.max_h2) {
            return Err(LmmError::InvalidParameterization(format!(
                "h2 search range must satisfy 0 < min < max <= 1, got [{}, {}]",
                self.min_h2, self.max_h2
            )));
        }
        if self.n_grid < 2 {
            return Err(LmmError::InvalidParameterization(format!(
                "h2 grid needs at least 2 points, got {}",
                self.n_grid
            )));
        }
        Ok(())
    }

    pub fn grid(&self) -> Vec<f64> {
        let step = (self.max_h2 - self.min_h2) / (self.n_grid - 1) as f64;
        (0..self.n_grid)
            .map(|i| {
                if i + 1 == self.n_grid {
                    self.max_h2
                } else {
                    self.min_h2 + i as f64 * step
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct H2Estimate {
    pub h2: f64,
    pub neg_log_likelihood: f64,
}

/// Minimize `objective` over h2.
///
/// Candidates whose objective fails with a local error score `+inf`; any
/// other error aborts the search. When every grid candidate fails the
/// search reports a degenerate model.
pub fn minimize_h2<F>(objective: F, config: &H2SearchConfig) -> LmmResult<H2Estimate>
where
    F: Fn(f64) -> LmmResult<f64> + Sync,
{
    config.validate()?;
    let grid = config.grid();

    let scores: Vec<f64> = grid
        .par_iter()
        .map(|&h2| score(&objective, h2))
        .collect::<LmmResult<_>>()?;

    let mut best = 0;
    for (i, &s) in scores.iter().enumerate() {
        if s < scores[best] {
            best = i;
        }
    }
    if !scores[best].is_finite() {
        return Err(LmmError::degenerate(
            "h2 search",
            format!("no finite likelihood on a grid of {} points", grid.len()),
        ));
    }
    let mut estimate = H2Estimate {
        h2: grid[best],
        neg_log_likelihood: scores[best],
    };

    if config.refine {
        let lo = grid[best.saturating_sub(1)];
        let hi = grid[(best + 1).min(grid.len() - 1)];
        let first_error: RefCell<Option<LmmError>> = RefCell::new(None);
        let f = |h2: f64| match score(&objective, h2) {
            Ok(s) => s,
            Err(e) => {
                first_error.borrow_mut().get_or_insert(e);
                f64::INFINITY
            }
        };
        let (h2, nll) =
            golden_section_minimize(f, lo, hi, config.refine_tol, config.refine_max_iter);
        if let Some(e) = first_error.into_inner() {
            return Err(e);
        }
        if nll < estimate.neg_log_likelihood {
            estimate = H2Estimate {
                h2,
                neg_log_likelihood: nll,
            };
        }
    }
    debug!(
        "h2 search: h2 = {:.6}, nLL = {:.6}",
        estimate.h2, estimate.neg_log_likelihood
    );
    Ok(estimate)
}

fn score<F>(objective: &F, h2: f64) -> LmmResult<f64>
where
    F: Fn(f64) -> LmmResult<f64>,
{
    let scored = match objective(h2) {
        Ok(v) if v.is_nan() => f64::INFINITY,
        Ok(v) => v,
        Err(e) if e.is_local() => {
            debug!("h2 candidate {:.6} skipped: {}", h2, e);
            f64::INFINITY
        }
        Err(e) => return Err(e),
    };
    debug!("h2 candidate {:.6}: nLL = {:.6}", h2, scored);
    Ok(scored)
}

fn golden_section_minimize<F>(f: F, mut a: f64, mut b: f64, tol: f64, max_iter: usize) -> (f64, f64)
where
    F: Fn(f64) -> f64,
{
    let gr = 0.5 * (1.0 + 5f64.sqrt());

    let mut c = b - (b - a) / gr;
    let mut d = a + (b - a) / gr;
    let mut fc = f(c);
    let mut fd = f(d);

    for _ in 0..max_iter {
        if (b - a).abs() < tol {
            break;
        }
        if fc < fd {
            b = d;
            d = c;
            fd = fc;
            c = b - (b - a) / gr;
            fc = f(c);
        } else {
            a = c;
            c = d;
            fc = fd;
            d = a + (b - a) / gr;
            fd = f(d);
        }
    }

    if fc < fd {
        (c, fc)
    } else {
        (d, fd)
    }
}

/// Everything needed to evaluate the null likelihood of one phenotype at
/// an arbitrary h2.
pub struct NullObjective<'a> {
    pub eigen: &'a Arc<EigenDecomposition>,
    pub covariates: &'a Rotation,
    pub phenotype: &'a Rotation,
    pub evaluator: LikelihoodEvaluator,
}

impl NullObjective<'_> {
    /// Fit the covariates-only model at a fixed ridge.
    pub fn fit(&self, ridge: Ridge) -> LmmResult<ModelFit> {
        let spectrum = Arc::new(ShiftedSpectrum::new(self.eigen, ridge)?);
        let covar_scaled = ScaledRotation::new(self.covariates, &spectrum)?;
        let pheno_scaled = ScaledRotation::new(self.phenotype, &spectrum)?;
        let xkx = QuadraticForm::from_scaled(&covar_scaled, self.covariates)?;
        let xky = QuadraticForm::from_scaled(&covar_scaled, self.phenotype)?;
        let yky = QuadraticForm::from_scaled(&pheno_scaled, self.phenotype)?;
        self.evaluator.evaluate(&xkx, &yky, &xky)
    }

    pub fn find_h2(&self, config: &H2SearchConfig) -> LmmResult<H2Estimate> {
        minimize_h2(
            |h2| Ok(self.fit(Ridge::H2(h2))?.neg_log_likelihood),
            config,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grid_endpoints() {
        let cfg = H2SearchConfig::default();
        let grid = cfg.grid();
        assert_eq!(grid.len(), 10);
        assert_eq!(grid[0], 1e-5);
        assert_eq!(grid[9], 0.99999);
        assert!(grid.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_refines_to_quadratic_minimum() {
        let cfg = H2SearchConfig::default();
        let est = minimize_h2(|h2| Ok((h2 - 0.37).powi(2)), &cfg).unwrap();
        assert!((est.h2 - 0.37).abs() < 1e-4);
    }

    #[test]
    fn test_grid_only_ties_prefer_smallest_h2() {
        let cfg = H2SearchConfig {
            refine: false,
            ..Default::default()
        };
        let est = minimize_h2(|_| Ok(1.0), &cfg).unwrap();
        assert_eq!(est.h2, cfg.min_h2);
    }

    #[test]
    fn test_degenerate_candidates_skipped() {
        let cfg = H2SearchConfig {
            refine: false,
            ..Default::default()
        };
        let est = minimize_h2(
            |h2| {
                if h2 < 0.5 {
                    Err(LmmError::degenerate("test", "bad"))
                } else {
                    Ok(h2)
                }
            },
            &cfg,
        )
        .unwrap();
        assert!(est.h2 >= 0.5);

        let all_bad = minimize_h2(|_| Err(LmmError::degenerate("test", "bad")), &cfg);
        assert!(matches!(all_bad, Err(LmmError::DegenerateModel { .. })));
    }

    #[test]
    fn test_structural_error_propagates() {
        let cfg = H2SearchConfig::default();
        let res = minimize_h2(|_| Err(LmmError::SingularModel("x".into())), &cfg);
        assert!(matches!(res, Err(LmmError::SingularModel(_))));
    }

    #[test]
    fn test_invalid_config() {
        let cfg = H2SearchConfig {
            n_grid: 1,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
        let cfg = H2SearchConfig {
            min_h2: 0.6,
            max_h2: 0.5,
            ..Default::default()
        };
        assert!(minimize_h2(|h2| Ok(h2), &cfg).is_err());
    }
}
