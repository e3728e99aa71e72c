//! Quadratic forms `A' (K + delta I)^{-1} B` on rotated data.
//!
//! With `rotA = V' A` and the orthogonal remainder `resA = A - V V' A`,
//!
//! ```text
//! A' (K + delta I)^{-1} B = (rotA / shifted)' rotB + resA' resB / delta
//! ```
//!
//! where the second term only exists for a low-rank decomposition. Forms
//! carry row and column labels and the spectrum they were computed under so
//! that blocks from different sources can be checked before they are combined.

use std::ops::Range;
use std::sync::Arc;

use lmm_linalg::DenseMatrix;

use crate::eigen::Rotation;
use crate::error::{LmmError, LmmResult};
use crate::spectrum::ShiftedSpectrum;

/// A rotation divided through by the shifted spectrum: `rotA / (values + delta)`.
///
/// Computed once per spectrum and reused as the left operand of every form
/// that shares it.
#[derive(Debug, Clone)]
pub struct ScaledRotation {
    spectrum: Arc<ShiftedSpectrum>,
    labels: Vec<String>,
    scaled: DenseMatrix,
    residual: Option<DenseMatrix>,
}

impl ScaledRotation {
    pub fn new(rotation: &Rotation, spectrum: &Arc<ShiftedSpectrum>) -> LmmResult<Self> {
        if !Arc::ptr_eq(rotation.eigen(), spectrum.eigen()) {
            return Err(LmmError::InconsistentSpectrum(
                "rotation and spectrum come from different decompositions".into(),
            ));
        }
        Ok(Self {
            spectrum: Arc::clone(spectrum),
            labels: rotation.labels().to_vec(),
            scaled: rotation.rotated().div_rows(spectrum.shifted_values()),
            residual: rotation.residual().cloned(),
        })
    }

    pub fn spectrum(&self) -> &Arc<ShiftedSpectrum> {
        &self.spectrum
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn ncols(&self) -> usize {
        self.scaled.ncols()
    }

    fn check_operand(&self, b: &Rotation) -> LmmResult<()> {
        if !Arc::ptr_eq(self.spectrum.eigen(), b.eigen()) {
            return Err(LmmError::InconsistentSpectrum(
                "operands rotated by different decompositions".into(),
            ));
        }
        Ok(())
    }
}

/// A labelled `rows x cols` quadratic form tied to one spectrum.
///
/// NaN entries mark blocks that have not been filled yet.
#[derive(Debug, Clone)]
pub struct QuadraticForm {
    values: DenseMatrix,
    rows: Vec<String>,
    cols: Vec<String>,
    spectrum: Arc<ShiftedSpectrum>,
}

impl QuadraticForm {
    /// `A' (K + delta I)^{-1} B` from a pre-scaled left operand.
    pub fn from_scaled(a: &ScaledRotation, b: &Rotation) -> LmmResult<Self> {
        a.check_operand(b)?;
        let mut values = a.scaled.t_mat_mul(b.rotated());
        if let (Some(res_a), Some(res_b)) = (&a.residual, b.residual()) {
            let correction = res_a.t_mat_mul(res_b).scale(1.0 / a.spectrum.delta());
            values = values.add(&correction);
        }
        Ok(Self {
            values,
            rows: a.labels.clone(),
            cols: b.labels().to_vec(),
            spectrum: Arc::clone(&a.spectrum),
        })
    }

    pub fn from_rotations(
        a: &Rotation,
        spectrum: &Arc<ShiftedSpectrum>,
        b: &Rotation,
    ) -> LmmResult<Self> {
        Self::from_scaled(&ScaledRotation::new(a, spectrum)?, b)
    }

    /// Only the diagonal of `A' (K + delta I)^{-1} B` for same-width operands.
    ///
    /// Used for the per-marker `alt' K^{-1} alt` terms of a batch.
    pub fn diagonal(a: &ScaledRotation, b: &Rotation) -> LmmResult<Vec<f64>> {
        a.check_operand(b)?;
        if a.ncols() != b.ncols() {
            return Err(LmmError::dims("diagonal form operands", a.ncols(), b.ncols()));
        }
        let mut diag = a.scaled.column_dots(b.rotated());
        if let (Some(res_a), Some(res_b)) = (&a.residual, b.residual()) {
            let delta = a.spectrum.delta();
            for (d, r) in diag.iter_mut().zip(res_a.column_dots(res_b)) {
                *d += r / delta;
            }
        }
        Ok(diag)
    }

    /// A form from explicit values.
    pub fn from_parts(
        values: DenseMatrix,
        rows: Vec<String>,
        cols: Vec<String>,
        spectrum: &Arc<ShiftedSpectrum>,
    ) -> LmmResult<Self> {
        if values.nrows() != rows.len() {
            return Err(LmmError::dims("form row labels", values.nrows(), rows.len()));
        }
        if values.ncols() != cols.len() {
            return Err(LmmError::dims("form column labels", values.ncols(), cols.len()));
        }
        Ok(Self {
            values,
            rows,
            cols,
            spectrum: Arc::clone(spectrum),
        })
    }

    /// A form with every entry unset.
    pub fn unset(rows: Vec<String>, cols: Vec<String>, spectrum: &Arc<ShiftedSpectrum>) -> Self {
        Self {
            values: DenseMatrix::full(rows.len(), cols.len(), f64::NAN),
            rows,
            cols,
            spectrum: Arc::clone(spectrum),
        }
    }

    pub fn values(&self) -> &DenseMatrix {
        &self.values
    }

    pub fn rows(&self) -> &[String] {
        &self.rows
    }

    pub fn cols(&self) -> &[String] {
        &self.cols
    }

    pub fn spectrum(&self) -> &Arc<ShiftedSpectrum> {
        &self.spectrum
    }

    pub fn nrows(&self) -> usize {
        self.values.nrows()
    }

    pub fn ncols(&self) -> usize {
        self.values.ncols()
    }

    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.values.get(i, j)
    }

    /// True when no entry is unset.
    pub fn is_complete(&self) -> bool {
        !self.values.has_nan()
    }

    /// The single entry of a 1 x 1 form.
    pub fn scalar(&self) -> LmmResult<f64> {
        if self.nrows() != 1 || self.ncols() != 1 {
            return Err(LmmError::dims("scalar form", 1, self.nrows() * self.ncols()));
        }
        Ok(self.values.get(0, 0))
    }

    pub fn transpose(&self) -> QuadraticForm {
        QuadraticForm {
            values: self.values.transpose(),
            rows: self.cols.clone(),
            cols: self.rows.clone(),
            spectrum: Arc::clone(&self.spectrum),
        }
    }

    pub fn block(&self, rows: Range<usize>, cols: Range<usize>) -> QuadraticForm {
        QuadraticForm {
            values: self.values.block(rows.clone(), cols.clone()),
            rows: self.rows[rows].to_vec(),
            cols: self.cols[cols].to_vec(),
            spectrum: Arc::clone(&self.spectrum),
        }
    }

    /// Fill the unset block whose top-left corner is `(row, col)` with `src`.
    ///
    /// `src` must share this form's spectrum, its labels must match the
    /// target rows and columns, and every target entry must still be unset.
    pub fn set_block(&mut self, row: usize, col: usize, src: &QuadraticForm) -> LmmResult<()> {
        if !self.spectrum.is_compatible(&src.spectrum) {
            return Err(LmmError::InconsistentSpectrum(format!(
                "block computed at delta {} placed into a form at delta {}",
                src.spectrum.delta(),
                self.spectrum.delta()
            )));
        }
        if row + src.nrows() > self.nrows() {
            return Err(LmmError::dims("block rows", self.nrows() - row, src.nrows()));
        }
        if col + src.ncols() > self.ncols() {
            return Err(LmmError::dims("block columns", self.ncols() - col, src.ncols()));
        }
        let rows = row..row + src.nrows();
        let cols = col..col + src.ncols();
        if self.rows[rows.clone()] != src.rows[..] || self.cols[cols.clone()] != src.cols[..] {
            return Err(LmmError::LabelMismatch {
                context: format!(
                    "block {:?} x {:?} into {:?} x {:?}",
                    src.rows, src.cols, &self.rows[rows], &self.cols[cols]
                ),
            });
        }
        for j in cols.clone() {
            for i in rows.clone() {
                if !self.values.get(i, j).is_nan() {
                    return Err(LmmError::BlockAlreadySet {
                        context: format!("entry ({}, {}) = {}", self.rows[i], self.cols[j], self.values.get(i, j)),
                    });
                }
            }
        }
        self.values.set_block(row, col, &src.values);
        Ok(())
    }

    pub(crate) fn rename_row(&mut self, i: usize, name: &str) {
        self.rows[i] = name.to_string();
    }

    pub(crate) fn rename_col(&mut self, j: usize, name: &str) {
        self.cols[j] = name.to_string();
    }
}

/// `[X | alt]' K^{-1} [X | alt]` and `[X | alt]' K^{-1} y` with the covariate
/// blocks filled and the marker slot left unset.
///
/// Each marker works on its own copy; the template is never modified after
/// construction.
#[derive(Debug, Clone)]
pub struct AugmentedDesign {
    xkx: QuadraticForm,
    xky: QuadraticForm,
}

const MARKER_SLOT: &str = "alt";

impl AugmentedDesign {
    /// `covar_kcovar` is `X' K^{-1} X` (c x c), `covar_ky` is `X' K^{-1} y` (c x 1).
    pub fn new(covar_kcovar: &QuadraticForm, covar_ky: &QuadraticForm) -> LmmResult<Self> {
        let c = covar_kcovar.nrows();
        if covar_kcovar.ncols() != c {
            return Err(LmmError::dims("covariate form columns", c, covar_kcovar.ncols()));
        }
        if covar_ky.nrows() != c || covar_ky.ncols() != 1 {
            return Err(LmmError::dims("covariate-phenotype form rows", c, covar_ky.nrows()));
        }
        let mut labels = covar_kcovar.rows().to_vec();
        labels.push(MARKER_SLOT.to_string());

        let spectrum = covar_kcovar.spectrum();
        let mut xkx = QuadraticForm::unset(labels.clone(), labels.clone(), spectrum);
        xkx.set_block(0, 0, covar_kcovar)?;
        let mut xky = QuadraticForm::unset(labels, covar_ky.cols().to_vec(), spectrum);
        xky.set_block(0, 0, covar_ky)?;
        Ok(Self { xkx, xky })
    }

    pub fn n_covariates(&self) -> usize {
        self.xkx.nrows() - 1
    }

    /// Complete copies of the template for one marker.
    ///
    /// `covar_kalt` is `X' K^{-1} alt` (c x 1), `alt_kalt` is 1 x 1 and
    /// `alt_ky` is `alt' K^{-1} y` (1 x 1). All three must name the same marker.
    pub fn with_marker(
        &self,
        covar_kalt: &QuadraticForm,
        alt_kalt: &QuadraticForm,
        alt_ky: &QuadraticForm,
    ) -> LmmResult<(QuadraticForm, QuadraticForm)> {
        let c = self.n_covariates();
        let marker = match covar_kalt.cols() {
            [name] => name.as_str(),
            cols => return Err(LmmError::dims("marker columns", 1, cols.len())),
        };

        let mut xkx = self.xkx.clone();
        xkx.rename_row(c, marker);
        xkx.rename_col(c, marker);
        xkx.set_block(0, c, covar_kalt)?;
        xkx.set_block(c, 0, &covar_kalt.transpose())?;
        xkx.set_block(c, c, alt_kalt)?;

        let mut xky = self.xky.clone();
        xky.rename_row(c, marker);
        xky.set_block(c, 0, alt_ky)?;
        Ok((xkx, xky))
    }
}
