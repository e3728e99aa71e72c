//! Association driver: null fit per phenotype, then likelihood-ratio tests
//! over marker batches.
//!
//! Per chromosome the covariates and phenotypes are rotated once by that
//! chromosome's kinship decomposition. Each phenotype gets its own ridge and
//! a published `Arc<NullModel>`; marker batches are read, standardized and
//! rotated once, then tested against every phenotype's null model with the
//! markers of a batch evaluated in parallel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use lmm_geno::{MarkerInfo, MarkerReader};
use lmm_linalg::DenseMatrix;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ChiSquared, ContinuousCDF};
use tracing::{info, warn};

use super::record::{AssocResults, TestFailure, TestRecord};
use crate::eigen::{EigenDecomposition, KinshipEigen, Rotation};
use crate::error::{LmmError, LmmResult};
use crate::kinship::standardize_markers;
use crate::likelihood::{LikelihoodEvaluator, LikelihoodObjective};
use crate::model::checkpoint::{NullCheckpoint, RotationCheckpoint};
use crate::model::{CheckpointStore, NullModel};
use crate::quadratic::{QuadraticForm, ScaledRotation};
use crate::search::{H2SearchConfig, NullObjective};
use crate::spectrum::Ridge;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssocConfig {
    pub search: H2SearchConfig,
    /// Likelihood minimized when selecting h2. Tests always use ML.
    pub h2_objective: LikelihoodObjective,
    /// Skip the search and use this ridge for every phenotype.
    pub fixed_ridge: Option<Ridge>,
    /// Markers read and rotated together.
    pub batch_size: usize,
}

impl Default for AssocConfig {
    fn default() -> Self {
        Self {
            search: H2SearchConfig::default(),
            h2_objective: LikelihoodObjective::Restricted,
            fixed_ridge: None,
            batch_size: 1000,
        }
    }
}

/// Cooperative early stop, checked between batches.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Rotated covariates and phenotypes for one chromosome.
#[derive(Debug, Clone)]
pub struct ChromosomeState {
    pub chrom: String,
    pub eigen: Arc<EigenDecomposition>,
    pub covariates: Rotation,
    pub phenotypes: Rotation,
}

/// A standardized, rotated batch of markers.
#[derive(Debug, Clone)]
pub struct RotatedBatch {
    pub rotation: Rotation,
    pub infos: Vec<MarkerInfo>,
    /// Input-order index of each marker.
    pub indices: Vec<usize>,
}

impl RotatedBatch {
    pub fn new(
        eigen: &Arc<EigenDecomposition>,
        raw: &DenseMatrix,
        infos: Vec<MarkerInfo>,
        indices: Vec<usize>,
    ) -> LmmResult<Self> {
        if infos.len() != raw.ncols() || indices.len() != raw.ncols() {
            return Err(LmmError::dims("marker batch metadata", raw.ncols(), infos.len()));
        }
        let labels = infos.iter().map(|m| m.id.clone()).collect();
        let rotation = Rotation::new(eigen, &standardize_markers(raw), labels)?;
        Ok(Self {
            rotation,
            infos,
            indices,
        })
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

pub struct AssociationDriver {
    config: AssocConfig,
    kinship: KinshipEigen,
    covariates: DenseMatrix,
    covariate_names: Vec<String>,
    phenotypes: DenseMatrix,
    phenotype_names: Vec<String>,
    checkpoint: Option<Arc<dyn CheckpointStore>>,
    stop: StopSignal,
}

impl AssociationDriver {
    /// `covariates` (n x c, c >= 1) and `phenotypes` (n x k) must be complete
    /// and share the row order of the kinship decompositions.
    pub fn new(
        config: AssocConfig,
        kinship: KinshipEigen,
        covariates: DenseMatrix,
        covariate_names: Vec<String>,
        phenotypes: DenseMatrix,
        phenotype_names: Vec<String>,
    ) -> LmmResult<Self> {
        if config.batch_size == 0 {
            return Err(LmmError::InvalidParameterization("batch size must be positive".into()));
        }
        match config.fixed_ridge {
            Some(ridge) => {
                ridge.delta()?;
            }
            None => config.search.validate()?,
        }
        let n = kinship.row_count().ok_or_else(|| {
            LmmError::InconsistentSpectrum("kinship decompositions disagree on row count".into())
        })?;
        if covariates.nrows() != n {
            return Err(LmmError::dims("covariate rows", n, covariates.nrows()));
        }
        if phenotypes.nrows() != n {
            return Err(LmmError::dims("phenotype rows", n, phenotypes.nrows()));
        }
        if covariates.ncols() == 0 {
            return Err(LmmError::dims("covariate columns", 1, 0));
        }
        if covariate_names.len() != covariates.ncols() {
            return Err(LmmError::dims("covariate names", covariates.ncols(), covariate_names.len()));
        }
        if phenotype_names.len() != phenotypes.ncols() {
            return Err(LmmError::dims("phenotype names", phenotypes.ncols(), phenotype_names.len()));
        }
        check_complete(&covariates, &phenotypes)?;

        Ok(Self {
            config,
            kinship,
            covariates,
            covariate_names,
            phenotypes,
            phenotype_names,
            checkpoint: None,
            stop: StopSignal::new(),
        })
    }

    pub fn with_checkpoint(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoint = Some(store);
        self
    }

    pub fn with_stop_signal(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    pub fn config(&self) -> &AssocConfig {
        &self.config
    }

    pub fn n_samples(&self) -> usize {
        self.covariates.nrows()
    }

    pub fn phenotype_names(&self) -> &[String] {
        &self.phenotype_names
    }

    /// Rotate covariates and phenotypes for `chrom`, restoring them from the
    /// checkpoint store when available.
    pub fn prepare_chromosome(&self, chrom: &str) -> Result<ChromosomeState> {
        let eigen = Arc::clone(
            self.kinship
                .for_chromosome(chrom)
                .ok_or_else(|| anyhow!("No kinship decomposition for chromosome {}", chrom))?,
        );

        if let Some(store) = &self.checkpoint {
            if let Some(cp) = store.load_rotations(chrom)? {
                let (covariates, phenotypes) = cp.restore(&eigen)?;
                if covariates.labels() != self.covariate_names.as_slice()
                    || phenotypes.labels() != self.phenotype_names.as_slice()
                {
                    bail!("Checkpointed rotations for chromosome {} name different columns", chrom);
                }
                info!("Chromosome {}: restored rotations from checkpoint", chrom);
                return Ok(ChromosomeState {
                    chrom: chrom.to_string(),
                    eigen,
                    covariates,
                    phenotypes,
                });
            }
        }

        let covariates = Rotation::new(&eigen, &self.covariates, self.covariate_names.clone())?;
        let phenotypes = Rotation::new(&eigen, &self.phenotypes, self.phenotype_names.clone())?;
        if let Some(store) = &self.checkpoint {
            store.save_rotations(&RotationCheckpoint::new(chrom, &covariates, &phenotypes))?;
        }
        Ok(ChromosomeState {
            chrom: chrom.to_string(),
            eigen,
            covariates,
            phenotypes,
        })
    }

    /// Select the ridge for phenotype `j` and fit its null model.
    ///
    /// Returns the model and the search objective at the selected h2 (`None`
    /// when the ridge is fixed).
    pub fn fit_null(&self, state: &ChromosomeState, j: usize) -> LmmResult<(NullModel, Option<f64>)> {
        let phenotype = state.phenotypes.column(j);
        let (ridge, search_nll) = match self.config.fixed_ridge {
            Some(ridge) => (ridge, None),
            None => {
                let objective = NullObjective {
                    eigen: &state.eigen,
                    covariates: &state.covariates,
                    phenotype: &phenotype,
                    evaluator: LikelihoodEvaluator::for_objective(
                        self.config.h2_objective,
                        &self.covariates,
                    )?,
                };
                let estimate = objective.find_h2(&self.config.search)?;
                (Ridge::H2(estimate.h2), Some(estimate.neg_log_likelihood))
            }
        };
        let model = NullModel::fit(&state.chrom, &state.eigen, &state.covariates, phenotype, ridge)?;
        info!(
            "Chromosome {}, phenotype {}: h2 = {:.4}, delta = {:.4}, ll_null = {:.4}",
            state.chrom,
            model.phenotype_id,
            model.h2(),
            model.spectrum.delta(),
            model.log_likelihood()
        );
        Ok((model, search_nll))
    }

    /// Checkpoint-aware null fit. A degenerate phenotype becomes a failure
    /// record; any other error aborts.
    fn resolve_null(
        &self,
        state: &ChromosomeState,
        j: usize,
    ) -> Result<std::result::Result<NullModel, TestFailure>> {
        let phenotype_id = &self.phenotype_names[j];
        if let Some(store) = &self.checkpoint {
            if let Some(cp) = store.load_null(&state.chrom, phenotype_id)? {
                let model = NullModel::restore(
                    &cp.summary,
                    &state.chrom,
                    &state.eigen,
                    &state.covariates,
                    state.phenotypes.column(j),
                )?;
                info!(
                    "Chromosome {}, phenotype {}: restored null model (h2 = {:.4})",
                    state.chrom,
                    phenotype_id,
                    model.h2()
                );
                return Ok(Ok(model));
            }
        }

        match self.fit_null(state, j) {
            Ok((model, search_nll)) => {
                if let Some(store) = &self.checkpoint {
                    store.save_null(&NullCheckpoint::new(model.summary(search_nll)))?;
                }
                Ok(Ok(model))
            }
            Err(e) if e.is_local() => {
                warn!(
                    "Chromosome {}, phenotype {}: null model failed: {}",
                    state.chrom, phenotype_id, e
                );
                Ok(Err(TestFailure {
                    phenotype_id: phenotype_id.clone(),
                    chromosome: state.chrom.clone(),
                    marker_index: None,
                    marker_id: None,
                    reason: e.to_string(),
                }))
            }
            Err(e) => Err(e).with_context(|| {
                format!("Null model for phenotype {} on chromosome {}", phenotype_id, state.chrom)
            }),
        }
    }

    /// Test every chromosome the reader serves.
    pub fn run<R: MarkerReader + ?Sized>(&self, reader: &mut R) -> Result<AssocResults> {
        if reader.n_samples() != self.n_samples() {
            bail!(
                "Marker data has {} samples, phenotypes have {}",
                reader.n_samples(),
                self.n_samples()
            );
        }
        let mut results = AssocResults::default();

        'chroms: for chrom in reader.chromosomes()? {
            let indices = reader.markers_on(&chrom)?;
            let state = self.prepare_chromosome(&chrom)?;

            let mut nulls = Vec::new();
            for j in 0..self.phenotype_names.len() {
                match self.resolve_null(&state, j)? {
                    Ok(model) => nulls.push(Arc::new(model)),
                    Err(failure) => results.failures.push(failure),
                }
            }
            if nulls.is_empty() {
                continue;
            }

            // Per phenotype so the output order does not depend on batching.
            let mut records: Vec<Vec<TestRecord>> = vec![Vec::new(); nulls.len()];
            let n_batches = indices.len().div_ceil(self.config.batch_size);
            for (b, chunk) in indices.chunks(self.config.batch_size).enumerate() {
                if self.stop.is_stopped() {
                    info!("Stop requested; ending before batch {} of chromosome {}", b + 1, chrom);
                    results.cancelled = true;
                    for r in records {
                        results.records.extend(r);
                    }
                    break 'chroms;
                }
                let raw = reader.read_marker_set(chunk)?;
                let infos = chunk
                    .iter()
                    .map(|&i| reader.marker_info(i))
                    .collect::<Result<Vec<_>>>()?;
                let batch = RotatedBatch::new(&state.eigen, &raw, infos, chunk.to_vec())?;

                for (null, out) in nulls.iter().zip(records.iter_mut()) {
                    for outcome in test_batch(null, &batch)? {
                        match outcome {
                            Ok(record) => out.push(record),
                            Err(failure) => {
                                warn!(
                                    "Phenotype {}, marker {}: {}",
                                    failure.phenotype_id,
                                    failure.marker_id.as_deref().unwrap_or("?"),
                                    failure.reason
                                );
                                results.failures.push(failure);
                            }
                        }
                    }
                }
                info!(
                    "Chromosome {}: batch {}/{} ({} markers) done",
                    chrom,
                    b + 1,
                    n_batches,
                    batch.len()
                );
            }
            for r in records {
                results.records.extend(r);
            }
        }
        Ok(results)
    }
}

fn check_complete(covariates: &DenseMatrix, phenotypes: &DenseMatrix) -> LmmResult<()> {
    for i in 0..covariates.nrows() {
        if (0..covariates.ncols()).any(|j| covariates.get(i, j).is_nan()) {
            return Err(LmmError::MissingValue {
                context: "covariates".into(),
                row: i,
            });
        }
        let missing = (0..phenotypes.ncols())
            .filter(|&j| phenotypes.get(i, j).is_nan())
            .count();
        if missing == phenotypes.ncols() && missing > 0 {
            return Err(LmmError::MissingValue {
                context: "phenotypes".into(),
                row: i,
            });
        }
        if missing > 0 {
            return Err(LmmError::PartialMissingPhenotype { row: i });
        }
    }
    Ok(())
}

/// Likelihood-ratio tests of every marker in `batch` against `null`, in
/// batch order. Degenerate markers come back as failures; other errors abort.
pub fn test_batch(
    null: &NullModel,
    batch: &RotatedBatch,
) -> LmmResult<Vec<std::result::Result<TestRecord, TestFailure>>> {
    let alt_scaled = ScaledRotation::new(&batch.rotation, &null.spectrum)?;
    let covar_kalt = QuadraticForm::from_scaled(&null.covariates, &batch.rotation)?;
    let alt_kpheno = QuadraticForm::from_scaled(&alt_scaled, &null.phenotype)?;
    let alt_kalt = QuadraticForm::diagonal(&alt_scaled, &batch.rotation)?;
    let chi2 = ChiSquared::new(1.0).map_err(|e| LmmError::InvalidParameterization(e.to_string()))?;

    (0..batch.len())
        .into_par_iter()
        .map(|i| {
            let outcome = test_marker(null, &covar_kalt, alt_kalt[i], &alt_kpheno, i, &chi2);
            let info = &batch.infos[i];
            match outcome {
                Ok((p_value, effect_size, effect_size_stderr)) => Ok(Ok(TestRecord {
                    marker_index: batch.indices[i],
                    marker_id: info.id.clone(),
                    chromosome: info.chrom.clone(),
                    genetic_distance: info.genetic_distance,
                    position: info.position,
                    p_value,
                    effect_size,
                    effect_size_stderr,
                    null_h2: null.h2(),
                    phenotype_id: null.phenotype_id.clone(),
                })),
                Err(e) if e.is_local() => Ok(Err(TestFailure {
                    phenotype_id: null.phenotype_id.clone(),
                    chromosome: info.chrom.clone(),
                    marker_index: Some(batch.indices[i]),
                    marker_id: Some(info.id.clone()),
                    reason: e.to_string(),
                })),
                Err(e) => Err(e),
            }
        })
        .collect()
}

/// p-value, effect and standard error for column `i` of the batch.
fn test_marker(
    null: &NullModel,
    covar_kalt: &QuadraticForm,
    alt_kalt: f64,
    alt_kpheno: &QuadraticForm,
    i: usize,
    chi2: &ChiSquared,
) -> LmmResult<(f64, f64, Option<f64>)> {
    let c = null.n_covariates();
    let covar_kalt_i = covar_kalt.block(0..c, i..i + 1);
    let marker = covar_kalt_i.cols().to_vec();
    let alt_kalt_i = QuadraticForm::from_parts(
        DenseMatrix::full(1, 1, alt_kalt),
        marker.clone(),
        marker,
        &null.spectrum,
    )?;
    let alt_kpheno_i = alt_kpheno.block(i..i + 1, 0..1);

    let (xkx, xky) = null.design.with_marker(&covar_kalt_i, &alt_kalt_i, &alt_kpheno_i)?;
    let alt = LikelihoodEvaluator::full()
        .evaluate(&xkx, &null.pheno_kpheno, &xky)
        .map_err(|e| e.in_context("alternative model"))?;

    let statistic = (2.0 * (alt.log_likelihood() - null.log_likelihood())).max(0.0);
    let p_value = chi2.sf(statistic);
    let stderr = alt.beta_variance.as_ref().map(|v| v[c].max(0.0).sqrt());
    Ok((p_value, alt.beta[c], stderr))
}
