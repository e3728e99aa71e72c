//! Checkpoint persistence for resumable runs.
//!
//! Two record kinds are stored:
//! - per chromosome, the rotated covariates and phenotypes
//! - per (chromosome, phenotype), the null-model summary
//!
//! Files use bincode with magic bytes (LMCK) and a version, plus an optional
//! JSON sidecar for the null summaries. Restoring reproduces the original
//! arrays bit for bit.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Context, Result};
use lmm_linalg::DenseMatrix;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::debug;

use super::null_model::NullSummary;
use crate::eigen::{EigenDecomposition, Rotation};

/// Magic bytes: "LMCK" (LMm ChecKpoint).
pub const MAGIC: [u8; 4] = [b'L', b'M', b'C', b'K'];
pub const VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMatrix {
    pub nrows: usize,
    pub ncols: usize,
    /// Column-major.
    pub data: Vec<f64>,
}

impl StoredMatrix {
    pub fn from_dense(m: &DenseMatrix) -> Self {
        Self {
            nrows: m.nrows(),
            ncols: m.ncols(),
            data: m.to_col_major(),
        }
    }

    pub fn to_dense(&self) -> Result<DenseMatrix> {
        if self.data.len() != self.nrows * self.ncols {
            bail!(
                "Stored matrix has {} values for shape {}x{}",
                self.data.len(),
                self.nrows,
                self.ncols
            );
        }
        Ok(DenseMatrix::from_col_major(self.nrows, self.ncols, self.data.clone()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRotation {
    pub labels: Vec<String>,
    pub rotated: StoredMatrix,
    pub residual: Option<StoredMatrix>,
}

impl StoredRotation {
    pub fn from_rotation(rotation: &Rotation) -> Self {
        Self {
            labels: rotation.labels().to_vec(),
            rotated: StoredMatrix::from_dense(rotation.rotated()),
            residual: rotation.residual().map(StoredMatrix::from_dense),
        }
    }

    pub fn to_rotation(&self, eigen: &Arc<EigenDecomposition>) -> Result<Rotation> {
        let residual = self.residual.as_ref().map(|r| r.to_dense()).transpose()?;
        Ok(Rotation::from_parts(
            eigen,
            self.labels.clone(),
            self.rotated.to_dense()?,
            residual,
        )?)
    }
}

/// Rotated covariates and phenotypes of one chromosome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RotationCheckpoint {
    pub magic: [u8; 4],
    pub version: u32,
    pub chrom: String,
    pub row_count: usize,
    pub rank: usize,
    pub covariates: StoredRotation,
    pub phenotypes: StoredRotation,
}

impl RotationCheckpoint {
    pub fn new(chrom: &str, covariates: &Rotation, phenotypes: &Rotation) -> Self {
        Self {
            magic: MAGIC,
            version: VERSION,
            chrom: chrom.to_string(),
            row_count: covariates.eigen().row_count(),
            rank: covariates.eigen().rank(),
            covariates: StoredRotation::from_rotation(covariates),
            phenotypes: StoredRotation::from_rotation(phenotypes),
        }
    }

    /// Rebuild both rotations against `eigen`; fails when the stored arrays
    /// were produced by a decomposition of a different shape.
    pub fn restore(&self, eigen: &Arc<EigenDecomposition>) -> Result<(Rotation, Rotation)> {
        if self.row_count != eigen.row_count() || self.rank != eigen.rank() {
            bail!(
                "Checkpoint for chromosome {} was written for {} rows / rank {}, \
                 current decomposition has {} rows / rank {}",
                self.chrom,
                self.row_count,
                self.rank,
                eigen.row_count(),
                eigen.rank()
            );
        }
        Ok((
            self.covariates.to_rotation(eigen)?,
            self.phenotypes.to_rotation(eigen)?,
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NullCheckpoint {
    pub magic: [u8; 4],
    pub version: u32,
    pub summary: NullSummary,
}

impl NullCheckpoint {
    pub fn new(summary: NullSummary) -> Self {
        Self {
            magic: MAGIC,
            version: VERSION,
            summary,
        }
    }
}

/// Persist and restore intermediate per-chromosome state.
pub trait CheckpointStore: Send + Sync {
    fn load_rotations(&self, chrom: &str) -> Result<Option<RotationCheckpoint>>;
    fn save_rotations(&self, checkpoint: &RotationCheckpoint) -> Result<()>;
    fn load_null(&self, chrom: &str, phenotype_id: &str) -> Result<Option<NullCheckpoint>>;
    fn save_null(&self, checkpoint: &NullCheckpoint) -> Result<()>;
}

/// Process-local store, mostly for tests and single-process resumption.
#[derive(Debug, Default)]
pub struct MemoryCheckpoint {
    rotations: Mutex<HashMap<String, RotationCheckpoint>>,
    nulls: Mutex<HashMap<(String, String), NullCheckpoint>>,
}

impl MemoryCheckpoint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn n_nulls(&self) -> usize {
        self.nulls.lock().map(|m| m.len()).unwrap_or(0)
    }
}

fn poisoned<T>(_: T) -> anyhow::Error {
    anyhow!("Checkpoint store lock poisoned")
}

impl CheckpointStore for MemoryCheckpoint {
    fn load_rotations(&self, chrom: &str) -> Result<Option<RotationCheckpoint>> {
        Ok(self.rotations.lock().map_err(poisoned)?.get(chrom).cloned())
    }

    fn save_rotations(&self, checkpoint: &RotationCheckpoint) -> Result<()> {
        self.rotations
            .lock()
            .map_err(poisoned)?
            .insert(checkpoint.chrom.clone(), checkpoint.clone());
        Ok(())
    }

    fn load_null(&self, chrom: &str, phenotype_id: &str) -> Result<Option<NullCheckpoint>> {
        Ok(self
            .nulls
            .lock()
            .map_err(poisoned)?
            .get(&(chrom.to_string(), phenotype_id.to_string()))
            .cloned())
    }

    fn save_null(&self, checkpoint: &NullCheckpoint) -> Result<()> {
        let key = (
            checkpoint.summary.chrom.clone(),
            checkpoint.summary.phenotype_id.clone(),
        );
        self.nulls
            .lock()
            .map_err(poisoned)?
            .insert(key, checkpoint.clone());
        Ok(())
    }
}

/// One file per record under a directory:
/// `chrom_<c>.rotations.bin` and `chrom_<c>.pheno_<p>.null.bin` (+ `.json`).
#[derive(Debug, Clone)]
pub struct DirCheckpoint {
    dir: PathBuf,
    json_sidecar: bool,
}

impl DirCheckpoint {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create checkpoint directory {}", dir.display()))?;
        Ok(Self {
            dir,
            json_sidecar: true,
        })
    }

    pub fn without_json_sidecar(mut self) -> Self {
        self.json_sidecar = false;
        self
    }

    fn rotation_path(&self, chrom: &str) -> PathBuf {
        self.dir.join(format!("chrom_{}.rotations.bin", sanitize(chrom)))
    }

    fn null_path(&self, chrom: &str, phenotype_id: &str) -> PathBuf {
        self.dir.join(format!(
            "chrom_{}.pheno_{}.null.bin",
            sanitize(chrom),
            sanitize(phenotype_id)
        ))
    }
}

/// Keep file names portable.
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

fn write_bin<T: Serialize>(value: &T, path: &Path) -> Result<()> {
    let encoded = bincode::serialize(value)?;
    // Write then rename so a crash never leaves a truncated checkpoint.
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, &encoded)
        .with_context(|| format!("Failed to write checkpoint {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("Failed to move checkpoint into place at {}", path.display()))?;
    debug!("Wrote checkpoint {}", path.display());
    Ok(())
}

fn read_bin<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let data = std::fs::read(path)
        .with_context(|| format!("Failed to read checkpoint {}", path.display()))?;
    let value = bincode::deserialize(&data)
        .with_context(|| format!("Corrupt checkpoint {}", path.display()))?;
    Ok(Some(value))
}

fn check_header(magic: [u8; 4], version: u32, path: &Path) -> Result<()> {
    if magic != MAGIC {
        bail!(
            "Invalid checkpoint {}: expected magic bytes {:?}, got {:?}",
            path.display(),
            MAGIC,
            magic
        );
    }
    if version != VERSION {
        bail!(
            "Checkpoint {} has version {}, expected {}",
            path.display(),
            version,
            VERSION
        );
    }
    Ok(())
}

impl CheckpointStore for DirCheckpoint {
    fn load_rotations(&self, chrom: &str) -> Result<Option<RotationCheckpoint>> {
        let path = self.rotation_path(chrom);
        let cp: Option<RotationCheckpoint> = read_bin(&path)?;
        if let Some(cp) = &cp {
            check_header(cp.magic, cp.version, &path)?;
        }
        Ok(cp)
    }

    fn save_rotations(&self, checkpoint: &RotationCheckpoint) -> Result<()> {
        write_bin(checkpoint, &self.rotation_path(&checkpoint.chrom))
    }

    fn load_null(&self, chrom: &str, phenotype_id: &str) -> Result<Option<NullCheckpoint>> {
        let path = self.null_path(chrom, phenotype_id);
        let cp: Option<NullCheckpoint> = read_bin(&path)?;
        if let Some(cp) = &cp {
            check_header(cp.magic, cp.version, &path)?;
        }
        Ok(cp)
    }

    fn save_null(&self, checkpoint: &NullCheckpoint) -> Result<()> {
        let path = self.null_path(&checkpoint.summary.chrom, &checkpoint.summary.phenotype_id);
        write_bin(checkpoint, &path)?;
        if self.json_sidecar {
            let json = serde_json::to_string_pretty(&checkpoint.summary)?;
            std::fs::write(path.with_extension("json"), json)?;
        }
        Ok(())
    }
}

/// Summary of a stored null model (for display).
pub fn null_summary_text(summary: &NullSummary) -> String {
    format!(
        "Null model: chromosome {}, phenotype {}\n\
         delta: {:.6}\n\
         h2: {:.6}\n\
         log-likelihood (ML): {:.6}\n\
         sigma2: {:.6}\n\
         beta: {:?}",
        summary.chrom,
        summary.phenotype_id,
        summary.delta,
        summary.fit.h2,
        summary.fit.log_likelihood(),
        summary.fit.sigma2,
        summary.fit.beta,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::likelihood::ModelFit;

    fn summary() -> NullSummary {
        NullSummary {
            chrom: "1".into(),
            phenotype_id: "y/1".into(),
            delta: 0.8125,
            search_neg_log_likelihood: Some(12.5),
            fit: ModelFit {
                neg_log_likelihood: 10.0,
                beta: vec![0.25],
                beta_variance: Some(vec![0.01]),
                sigma2: 1.5,
                h2: 1.0 / 1.8125,
                rss: 30.0,
                retained_rank: 1,
            },
        }
    }

    fn rotations() -> (Arc<EigenDecomposition>, Rotation, Rotation) {
        let g = DenseMatrix::from_row_major(3, 1, &[1.0, 0.0, -1.0]);
        let eigen = Arc::new(EigenDecomposition::from_standardized_markers(&g, 1e-8).unwrap());
        let x = Rotation::new(&eigen, &DenseMatrix::full(3, 1, 1.0), vec!["bias".into()]).unwrap();
        let y = Rotation::new(&eigen, &DenseMatrix::from_vec(&[0.1, 0.7, -0.3]), vec!["y".into()]).unwrap();
        (eigen, x, y)
    }

    #[test]
    fn test_dir_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirCheckpoint::new(dir.path()).unwrap();
        assert!(store.load_null("1", "y/1").unwrap().is_none());

        store.save_null(&NullCheckpoint::new(summary())).unwrap();
        let loaded = store.load_null("1", "y/1").unwrap().unwrap();
        assert_eq!(loaded.summary, summary());
        assert!(dir.path().join("chrom_1.pheno_y_1.null.json").exists());

        let (eigen, x, y) = rotations();
        store.save_rotations(&RotationCheckpoint::new("1", &x, &y)).unwrap();
        let cp = store.load_rotations("1").unwrap().unwrap();
        let (x2, y2) = cp.restore(&eigen).unwrap();
        assert_eq!(x2.rotated().to_col_major(), x.rotated().to_col_major());
        assert_eq!(
            y2.residual().unwrap().to_col_major(),
            y.residual().unwrap().to_col_major()
        );
    }

    #[test]
    fn test_bad_magic_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirCheckpoint::new(dir.path()).unwrap().without_json_sidecar();
        let mut cp = NullCheckpoint::new(summary());
        cp.magic = *b"XXXX";
        store.save_null(&cp).unwrap();
        assert!(store.load_null("1", "y/1").is_err());
    }

    #[test]
    fn test_restore_rejects_other_decomposition() {
        let (_, x, y) = rotations();
        let cp = RotationCheckpoint::new("1", &x, &y);
        let other = Arc::new(EigenDecomposition::from_kinship(&DenseMatrix::identity(3)).unwrap());
        assert!(cp.restore(&other).is_err());
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryCheckpoint::new();
        store.save_null(&NullCheckpoint::new(summary())).unwrap();
        assert_eq!(store.n_nulls(), 1);
        assert!(store.load_null("1", "y/1").unwrap().is_some());
        assert!(store.load_null("2", "y/1").unwrap().is_none());
    }
}
