//! NullModel: the covariates-only fit for one phenotype on one chromosome.
//!
//! Holds everything the per-marker tests need:
//! - the shifted spectrum at the selected ridge
//! - the covariate rotation scaled by that spectrum
//! - `y'K^{-1}y` and the augmented-design template
//! - the ML fit of the null model (`ll_null`)
//!
//! Published behind an `Arc` and never mutated afterwards.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::eigen::{EigenDecomposition, Rotation};
use crate::error::{LmmError, LmmResult};
use crate::likelihood::{LikelihoodEvaluator, NullModelResult};
use crate::quadratic::{AugmentedDesign, QuadraticForm, ScaledRotation};
use crate::spectrum::{Ridge, ShiftedSpectrum};

#[derive(Debug, Clone)]
pub struct NullModel {
    pub phenotype_id: String,
    pub chrom: String,
    pub spectrum: Arc<ShiftedSpectrum>,
    pub covariates: ScaledRotation,
    pub phenotype: Rotation,
    pub pheno_kpheno: QuadraticForm,
    pub design: AugmentedDesign,
    /// ML fit at the selected ridge.
    pub fit: NullModelResult,
}

/// The persisted part of a null model: enough to rebuild it exactly from the
/// chromosome's rotations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NullSummary {
    pub chrom: String,
    pub phenotype_id: String,
    pub delta: f64,
    /// Objective value at the selected h2; `None` when the ridge was fixed.
    pub search_neg_log_likelihood: Option<f64>,
    pub fit: NullModelResult,
}

impl NullModel {
    /// Build the shared per-marker state at `ridge` and evaluate the ML null
    /// likelihood.
    pub fn fit(
        chrom: &str,
        eigen: &Arc<EigenDecomposition>,
        covariates: &Rotation,
        phenotype: Rotation,
        ridge: Ridge,
    ) -> LmmResult<Self> {
        let spectrum = Arc::new(ShiftedSpectrum::new(eigen, ridge)?);
        let covar_scaled = ScaledRotation::new(covariates, &spectrum)?;
        let pheno_scaled = ScaledRotation::new(&phenotype, &spectrum)?;

        let covar_kcovar = QuadraticForm::from_scaled(&covar_scaled, covariates)?;
        let covar_kpheno = QuadraticForm::from_scaled(&covar_scaled, &phenotype)?;
        let pheno_kpheno = QuadraticForm::from_scaled(&pheno_scaled, &phenotype)?;

        let fit = LikelihoodEvaluator::full().evaluate(&covar_kcovar, &pheno_kpheno, &covar_kpheno)?;
        let design = AugmentedDesign::new(&covar_kcovar, &covar_kpheno)?;

        Ok(Self {
            phenotype_id: phenotype.labels()[0].clone(),
            chrom: chrom.to_string(),
            spectrum,
            covariates: covar_scaled,
            phenotype,
            pheno_kpheno,
            design,
            fit,
        })
    }

    /// Rebuild from a stored summary. The stored fit is kept as is.
    ///
    /// The summary must belong to `chrom` and to the phenotype `phenotype`
    /// is labelled with.
    pub fn restore(
        summary: &NullSummary,
        chrom: &str,
        eigen: &Arc<EigenDecomposition>,
        covariates: &Rotation,
        phenotype: Rotation,
    ) -> LmmResult<Self> {
        let phenotype_id = phenotype.labels().first().map(String::as_str).unwrap_or("");
        if summary.chrom != chrom || summary.phenotype_id != phenotype_id {
            return Err(LmmError::LabelMismatch {
                context: format!(
                    "stored null model for chromosome {} phenotype {} restored as chromosome {} phenotype {}",
                    summary.chrom, summary.phenotype_id, chrom, phenotype_id
                ),
            });
        }
        if summary.fit.beta.len() != covariates.ncols() {
            return Err(LmmError::dims(
                "stored null model coefficients",
                covariates.ncols(),
                summary.fit.beta.len(),
            ));
        }
        let mut model = Self::fit(chrom, eigen, covariates, phenotype, Ridge::Delta(summary.delta))?;
        model.fit = summary.fit.clone();
        Ok(model)
    }

    pub fn summary(&self, search_neg_log_likelihood: Option<f64>) -> NullSummary {
        NullSummary {
            chrom: self.chrom.clone(),
            phenotype_id: self.phenotype_id.clone(),
            delta: self.spectrum.delta(),
            search_neg_log_likelihood,
            fit: self.fit.clone(),
        }
    }

    pub fn h2(&self) -> f64 {
        self.spectrum.h2()
    }

    pub fn log_likelihood(&self) -> f64 {
        self.fit.log_likelihood()
    }

    pub fn n_covariates(&self) -> usize {
        self.design.n_covariates()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lmm_linalg::DenseMatrix;

    #[test]
    fn test_restore_matches_fit() {
        let k = DenseMatrix::from_row_major(
            4,
            4,
            &[1.0, 0.3, 0.1, 0.0, 0.3, 1.0, 0.2, 0.1, 0.1, 0.2, 1.0, 0.4, 0.0, 0.1, 0.4, 1.0],
        );
        let eigen = Arc::new(EigenDecomposition::from_kinship(&k).unwrap());
        let x = Rotation::new(&eigen, &DenseMatrix::full(4, 1, 1.0), vec!["bias".into()]).unwrap();
        let y = Rotation::new(&eigen, &DenseMatrix::from_vec(&[0.3, 1.2, -0.4, 0.8]), vec!["y".into()]).unwrap();

        let model = NullModel::fit("1", &eigen, &x, y.clone(), Ridge::H2(0.4)).unwrap();
        assert_eq!(model.phenotype_id, "y");
        assert_eq!(model.n_covariates(), 1);
        assert!(model.fit.beta_variance.is_some());

        let summary = model.summary(None);
        let restored = NullModel::restore(&summary, "1", &eigen, &x, y.clone()).unwrap();
        assert!(restored.spectrum.is_compatible(&model.spectrum));
        assert_eq!(restored.log_likelihood().to_bits(), model.log_likelihood().to_bits());
        assert_eq!(
            restored.pheno_kpheno.scalar().unwrap().to_bits(),
            model.pheno_kpheno.scalar().unwrap().to_bits()
        );

        // Keyed to another chromosome or phenotype.
        assert!(matches!(
            NullModel::restore(&summary, "2", &eigen, &x, y.clone()),
            Err(LmmError::LabelMismatch { .. })
        ));
        let z = Rotation::new(&eigen, &DenseMatrix::from_vec(&[0.3, 1.2, -0.4, 0.8]), vec!["z".into()]).unwrap();
        assert!(matches!(
            NullModel::restore(&summary, "1", &eigen, &x, z),
            Err(LmmError::LabelMismatch { .. })
        ));
    }
}
