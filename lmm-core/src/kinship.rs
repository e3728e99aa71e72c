//! Kinship construction from marker dosages.
//!
//! Markers are standardized per column (mean-imputed, unit population
//! variance) and `K = G G' / m`. The decomposition itself is built through
//! [`EigenDecomposition::from_standardized_markers`], which never forms `K`
//! when there are fewer markers than individuals.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use lmm_geno::MarkerReader;
use lmm_linalg::DenseMatrix;
use tracing::info;

use crate::eigen::{EigenDecomposition, KinshipEigen};

/// Column-wise standardization of raw dosages.
///
/// NaN entries are replaced by the column mean of the observed values.
/// Columns with zero variance (or no observed values) become all zero.
pub fn standardize_markers(raw: &DenseMatrix) -> DenseMatrix {
    let n = raw.nrows();
    let mut out = DenseMatrix::zeros(n, raw.ncols());
    for j in 0..raw.ncols() {
        let col = raw.col(j);
        let observed: Vec<f64> = col.iter().copied().filter(|v| !v.is_nan()).collect();
        if observed.is_empty() {
            continue;
        }
        let mean = observed.iter().sum::<f64>() / observed.len() as f64;
        let var = col
            .iter()
            .map(|&v| if v.is_nan() { 0.0 } else { (v - mean).powi(2) })
            .sum::<f64>()
            / n as f64;
        if var <= 1e-12 {
            continue;
        }
        let sd = var.sqrt();
        let std: Vec<f64> = col
            .iter()
            .map(|&v| if v.is_nan() { 0.0 } else { (v - mean) / sd })
            .collect();
        out.set_col(j, &std);
    }
    out
}

/// `K = G G' / m` for standardized markers `G` (n x m).
pub fn kinship_from_markers(g: &DenseMatrix) -> DenseMatrix {
    let n = g.nrows();
    let m = g.ncols();
    if m == 0 {
        return DenseMatrix::zeros(n, n);
    }
    g.mat_mul(&g.transpose()).scale(1.0 / m as f64)
}

/// Append an all-ones column named `bias` (or `bias_1`, `bias_2`, ... if
/// that name is taken).
pub fn append_bias(x: &DenseMatrix, names: &[String]) -> (DenseMatrix, Vec<String>) {
    let mut name = "bias".to_string();
    let mut k = 1;
    while names.contains(&name) {
        name = format!("bias_{}", k);
        k += 1;
    }
    let ones = DenseMatrix::full(x.nrows(), 1, 1.0);
    let mut out_names = names.to_vec();
    out_names.push(name);
    (x.hstack(&ones), out_names)
}

/// Decomposition of the kinship of every marker the reader serves.
pub fn genome_wide_eigen<R: MarkerReader + ?Sized>(
    reader: &mut R,
    min_eigenvalue: f64,
) -> Result<KinshipEigen> {
    let all: Vec<usize> = (0..reader.n_markers()).collect();
    let eigen = eigen_from_marker_set(reader, &all, min_eigenvalue)?;
    info!(
        "Genome-wide kinship: {} markers, rank {} of {}",
        all.len(),
        eigen.rank(),
        eigen.row_count()
    );
    Ok(KinshipEigen::GenomeWide(Arc::new(eigen)))
}

/// One decomposition per chromosome in `test_chroms`, each built from the
/// kinship markers on every other chromosome.
pub fn loco_eigendecompositions<R: MarkerReader + ?Sized>(
    reader: &mut R,
    test_chroms: &[String],
    min_eigenvalue: f64,
) -> Result<KinshipEigen> {
    let mut chrom_of = Vec::with_capacity(reader.n_markers());
    for i in 0..reader.n_markers() {
        chrom_of.push(reader.marker_info(i)?.chrom);
    }

    let mut per_chrom = BTreeMap::new();
    for chrom in test_chroms {
        let keep: Vec<usize> = (0..chrom_of.len()).filter(|&i| &chrom_of[i] != chrom).collect();
        if keep.is_empty() {
            bail!(
                "Leaving out chromosome {} removes every kinship marker",
                chrom
            );
        }
        let eigen = eigen_from_marker_set(reader, &keep, min_eigenvalue)
            .with_context(|| format!("LOCO kinship excluding chromosome {}", chrom))?;
        info!(
            "LOCO kinship excluding chromosome {}: {} markers, rank {}",
            chrom,
            keep.len(),
            eigen.rank()
        );
        per_chrom.insert(chrom.clone(), Arc::new(eigen));
    }
    Ok(KinshipEigen::PerChromosome(per_chrom))
}

fn eigen_from_marker_set<R: MarkerReader + ?Sized>(
    reader: &mut R,
    indices: &[usize],
    min_eigenvalue: f64,
) -> Result<EigenDecomposition> {
    let raw = reader.read_marker_set(indices)?;
    let g = standardize_markers(&raw);
    Ok(EigenDecomposition::from_standardized_markers(&g, min_eigenvalue)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eigen::DEFAULT_MIN_EIGENVALUE;
    use lmm_geno::InMemoryMarkers;
    use lmm_geno::MarkerInfo;

    #[test]
    fn test_standardize_imputes_and_scales() {
        let raw = DenseMatrix::from_row_major(4, 2, &[0.0, 1.0, 2.0, 1.0, f64::NAN, 1.0, 1.0, 1.0]);
        let g = standardize_markers(&raw);
        // column 0: observed mean 1, imputed entry becomes 0
        assert_eq!(g.get(2, 0), 0.0);
        let mean: f64 = g.col(0).iter().sum::<f64>() / 4.0;
        let var: f64 = g.col(0).iter().map(|v| v * v).sum::<f64>() / 4.0;
        assert!(mean.abs() < 1e-12);
        assert!((var - 1.0).abs() < 1e-12);
        // monomorphic column
        assert!(g.col(1).iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_kinship_scaling() {
        let g = DenseMatrix::from_row_major(2, 2, &[1.0, -1.0, -1.0, 1.0]);
        let k = kinship_from_markers(&g);
        assert!((k.get(0, 0) - 1.0).abs() < 1e-12);
        assert!((k.get(0, 1) + 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_append_bias_avoids_collision() {
        let x = DenseMatrix::from_vec(&[2.0, 3.0]);
        let (xb, names) = append_bias(&x, &["bias".to_string()]);
        assert_eq!(names, vec!["bias", "bias_1"]);
        assert_eq!(xb.col(1), vec![1.0, 1.0]);
    }

    #[test]
    fn test_gram_and_kinship_paths_agree() {
        // 6 individuals, 3 markers: the Gram path; compare with the dense K.
        let raw = DenseMatrix::from_row_major(
            6,
            3,
            &[0., 1., 2., 1., 1., 0., 2., 0., 1., 0., 2., 2., 1., 0., 0., 2., 1., 1.],
        );
        let g = standardize_markers(&raw);
        let eigen = EigenDecomposition::from_standardized_markers(&g, DEFAULT_MIN_EIGENVALUE).unwrap();
        assert!(eigen.is_low_rank());
        let v = eigen.vectors();
        let rebuilt = DenseMatrix::from_fn(6, 6, |i, j| {
            (0..eigen.rank()).map(|r| v.get(i, r) * eigen.values()[r] * v.get(j, r)).sum()
        });
        assert!(rebuilt.max_abs_diff(&kinship_from_markers(&g)) < 1e-10);
        let orth = v.t_mat_mul(v);
        assert!(orth.max_abs_diff(&DenseMatrix::identity(eigen.rank())) < 1e-10);
    }

    #[test]
    fn test_loco_excludes_tested_chromosome() {
        let ids: Vec<String> = (0..5).map(|i| format!("s{}", i)).collect();
        let dosages = DenseMatrix::from_row_major(
            5,
            3,
            &[0., 1., 2., 1., 2., 0., 2., 0., 1., 0., 1., 1., 1., 0., 2.],
        );
        let markers = ["1", "1", "2"]
            .iter()
            .enumerate()
            .map(|(j, c)| MarkerInfo {
                id: format!("m{}", j),
                chrom: c.to_string(),
                genetic_distance: 0.0,
                position: j as u64,
            })
            .collect();
        let mut reader = InMemoryMarkers::new(ids, markers, dosages).unwrap();
        let loco = loco_eigendecompositions(
            &mut reader,
            &["1".to_string(), "2".to_string()],
            DEFAULT_MIN_EIGENVALUE,
        )
        .unwrap();
        // chromosome 1 left out: one marker remains
        assert_eq!(loco.for_chromosome("1").unwrap().rank(), 1);
        assert_eq!(loco.for_chromosome("2").unwrap().rank(), 2);
        assert_eq!(loco.row_count(), Some(5));
        assert!(loco.for_chromosome("3").is_none());
    }
}
