//! TSV phenotype and covariate file parser.
//!
//! Reads tab/space-delimited files with sample IDs, one or more phenotype
//! columns and covariate columns. Missing values become NaN; an individual's
//! phenotypes must be either all present or all missing.

use std::path::Path;

use anyhow::{bail, Context, Result};
use lmm_linalg::DenseMatrix;
use tracing::info;

/// Parsed phenotype and covariate data for all samples.
#[derive(Debug, Clone)]
pub struct PhenotypeTable {
    /// Sample IDs in file order.
    pub sample_ids: Vec<String>,
    /// Phenotype column names.
    pub phenotype_names: Vec<String>,
    /// n x k phenotype matrix (NaN for missing).
    pub phenotypes: DenseMatrix,
    /// Covariate column names.
    pub covariate_names: Vec<String>,
    /// n x c covariate matrix (NaN for missing).
    pub covariates: DenseMatrix,
}

/// Parse a phenotype/covariate file.
///
/// # Arguments
/// - `path`: Path to the TSV file (tab or space delimited, detected from the header)
/// - `pheno_cols`: Names of the phenotype columns (at least one)
/// - `covar_cols`: Names of covariate columns (may be empty)
/// - `sample_id_col`: Name of the sample ID column (usually "IID")
pub fn parse_phenotype_file(
    path: &Path,
    pheno_cols: &[String],
    covar_cols: &[String],
    sample_id_col: &str,
) -> Result<PhenotypeTable> {
    if pheno_cols.is_empty() {
        bail!("Expect at least one phenotype column");
    }
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read phenotype file: {}", path.display()))?;

    let mut lines = contents.lines();
    let header_line = lines
        .next()
        .ok_or_else(|| anyhow::anyhow!("Empty phenotype file"))?;

    let delim = if header_line.contains('\t') { '\t' } else { ' ' };
    let headers: Vec<&str> = header_line.split(delim).map(|s| s.trim()).collect();

    let find = |name: &str, kind: &str| -> Result<usize> {
        headers
            .iter()
            .position(|&h| h == name)
            .ok_or_else(|| anyhow::anyhow!("{} column '{}' not found in header", kind, name))
    };
    let id_idx = find(sample_id_col, "Sample ID")?;
    let pheno_idx: Vec<usize> = pheno_cols
        .iter()
        .map(|c| find(c, "Phenotype"))
        .collect::<Result<_>>()?;
    let covar_idx: Vec<usize> = covar_cols
        .iter()
        .map(|c| find(c, "Covariate"))
        .collect::<Result<_>>()?;
    let min_fields = pheno_idx
        .iter()
        .chain(covar_idx.iter())
        .copied()
        .fold(id_idx, usize::max)
        + 1;

    let mut sample_ids = Vec::new();
    let mut pheno_rows: Vec<Vec<f64>> = Vec::new();
    let mut covar_rows: Vec<Vec<f64>> = Vec::new();

    for (line_num, line) in lines.enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(delim).map(|s| s.trim()).collect();
        if fields.len() < min_fields {
            bail!(
                "Line {} has too few fields (expected at least {})",
                line_num + 2,
                min_fields
            );
        }
        sample_ids.push(fields[id_idx].to_string());
        pheno_rows.push(pheno_idx.iter().map(|&i| parse_value(fields[i])).collect());
        covar_rows.push(covar_idx.iter().map(|&i| parse_value(fields[i])).collect());
    }

    let n = sample_ids.len();
    let phenotypes =
        DenseMatrix::from_fn(n, pheno_cols.len(), |i, j| pheno_rows[i][j]);
    let covariates =
        DenseMatrix::from_fn(n, covar_cols.len(), |i, j| covar_rows[i][j]);

    Ok(PhenotypeTable {
        sample_ids,
        phenotype_names: pheno_cols.to_vec(),
        phenotypes,
        covariate_names: covar_cols.to_vec(),
        covariates,
    })
}

/// Parse a string value to f64, treating NA/missing as NaN.
pub fn parse_value(s: &str) -> f64 {
    match s {
        "NA" | "na" | "Na" | "." | "" | "-" | "NaN" | "nan" => f64::NAN,
        _ => s.parse().unwrap_or(f64::NAN),
    }
}

impl PhenotypeTable {
    pub fn n_samples(&self) -> usize {
        self.sample_ids.len()
    }

    /// Rows whose phenotypes are all present and whose covariates are present.
    ///
    /// Fails if any individual has some but not all phenotypes missing.
    pub fn complete_rows(&self) -> Result<Vec<usize>> {
        let k = self.phenotypes.ncols();
        let mut keep = Vec::new();
        for i in 0..self.n_samples() {
            let present = (0..k).filter(|&j| !self.phenotypes.get(i, j).is_nan()).count();
            if present > 0 && present < k {
                bail!(
                    "With multiple phenotypes, an individual's values must either be all \
                     missing or have no missing (sample '{}')",
                    self.sample_ids[i]
                );
            }
            let covars_ok =
                (0..self.covariates.ncols()).all(|j| !self.covariates.get(i, j).is_nan());
            if present == k && covars_ok {
                keep.push(i);
            }
        }
        Ok(keep)
    }

    /// Drop individuals with missing phenotypes or covariates.
    pub fn drop_all_missing(&self) -> Result<Self> {
        let keep = self.complete_rows()?;
        if keep.len() < self.n_samples() {
            info!(
                "Dropping {} of {} samples with missing phenotype or covariate values",
                self.n_samples() - keep.len(),
                self.n_samples()
            );
        }
        Ok(self.subset_rows(&keep))
    }

    /// Keep only the listed rows, in the listed order.
    pub fn subset_rows(&self, rows: &[usize]) -> Self {
        Self {
            sample_ids: rows.iter().map(|&i| self.sample_ids[i].clone()).collect(),
            phenotype_names: self.phenotype_names.clone(),
            phenotypes: self.phenotypes.select_rows(rows),
            covariate_names: self.covariate_names.clone(),
            covariates: self.covariates.select_rows(rows),
        }
    }

    /// Reorder (and subset) rows to follow `ids`. Fails on unknown IDs.
    pub fn align_to(&self, ids: &[String]) -> Result<Self> {
        let mut rows = Vec::with_capacity(ids.len());
        for id in ids {
            match self.sample_ids.iter().position(|s| s == id) {
                Some(i) => rows.push(i),
                None => bail!("Sample '{}' has no phenotype record", id),
            }
        }
        Ok(self.subset_rows(&rows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_value() {
        assert_eq!(parse_value("1.5"), 1.5);
        assert_eq!(parse_value("0"), 0.0);
        assert!(parse_value("NA").is_nan());
        assert!(parse_value(".").is_nan());
        assert!(parse_value("").is_nan());
    }

    fn write_file(rows: &[&str]) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pheno.tsv");
        let mut f = std::fs::File::create(&path).unwrap();
        for r in rows {
            writeln!(f, "{}", r).unwrap();
        }
        (dir, path)
    }

    #[test]
    fn test_parse_multi_phenotype_file() {
        let (_dir, path) = write_file(&[
            "IID\ty1\ty2\tage",
            "S1\t1\t0.5\t45",
            "S2\t0\t1.5\t50",
            "S3\tNA\tNA\t55",
        ]);
        let table = parse_phenotype_file(
            &path,
            &["y1".to_string(), "y2".to_string()],
            &["age".to_string()],
            "IID",
        )
        .unwrap();

        assert_eq!(table.sample_ids, vec!["S1", "S2", "S3"]);
        assert_eq!(table.phenotypes.ncols(), 2);
        assert_eq!(table.phenotypes.get(1, 1), 1.5);
        assert_eq!(table.covariates.get(0, 0), 45.0);

        let kept = table.drop_all_missing().unwrap();
        assert_eq!(kept.sample_ids, vec!["S1", "S2"]);
    }

    #[test]
    fn test_partial_missing_rejected() {
        let (_dir, path) = write_file(&["IID y1 y2", "S1 1 NA", "S2 0 1"]);
        let table =
            parse_phenotype_file(&path, &["y1".to_string(), "y2".to_string()], &[], "IID")
                .unwrap();
        assert!(table.complete_rows().is_err());
    }

    #[test]
    fn test_align_to() {
        let (_dir, path) = write_file(&["IID y", "A 1", "B 2", "C 3"]);
        let table = parse_phenotype_file(&path, &["y".to_string()], &[], "IID").unwrap();
        let aligned = table.align_to(&["C".to_string(), "A".to_string()]).unwrap();
        assert_eq!(aligned.phenotypes.col(0), vec![3.0, 1.0]);
        assert!(table.align_to(&["Z".to_string()]).is_err());
    }
}
