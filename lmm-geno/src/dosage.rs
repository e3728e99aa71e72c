//! Whitespace-delimited dosage tables.
//!
//! Layout: a header `SNP CHR CM BP <sample ids...>` followed by one marker
//! per line. Missing dosages are written as `NA`, `.` or `NaN`.

use std::path::Path;

use anyhow::{bail, Context, Result};
use lmm_linalg::DenseMatrix;
use tracing::info;

use crate::memory::InMemoryMarkers;
use crate::phenotype::parse_value;
use crate::traits::MarkerInfo;

const META_COLS: usize = 4;

/// Load a dosage table into memory.
pub fn read_dosage_table(path: &Path) -> Result<InMemoryMarkers> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read dosage table: {}", path.display()))?;
    let mut lines = contents.lines().filter(|l| !l.trim().is_empty());

    let header: Vec<&str> = lines
        .next()
        .ok_or_else(|| anyhow::anyhow!("Empty dosage table: {}", path.display()))?
        .split_whitespace()
        .collect();
    if header.len() <= META_COLS {
        bail!(
            "Dosage table header must have {} metadata columns followed by sample IDs",
            META_COLS
        );
    }
    let sample_ids: Vec<String> = header[META_COLS..].iter().map(|s| s.to_string()).collect();
    let n = sample_ids.len();

    let mut markers = Vec::new();
    let mut columns: Vec<Vec<f64>> = Vec::new();
    for (line_num, line) in lines.enumerate() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != META_COLS + n {
            bail!(
                "Line {} of {} has {} fields (expected {})",
                line_num + 2,
                path.display(),
                fields.len(),
                META_COLS + n
            );
        }
        let genetic_distance = parse_value(fields[2]);
        let position: u64 = fields[3]
            .parse()
            .with_context(|| format!("Bad position '{}' on line {}", fields[3], line_num + 2))?;
        markers.push(MarkerInfo {
            id: fields[0].to_string(),
            chrom: fields[1].to_string(),
            genetic_distance: if genetic_distance.is_nan() { 0.0 } else { genetic_distance },
            position,
        });
        columns.push(fields[META_COLS..].iter().map(|s| parse_value(s)).collect());
    }

    info!(
        "Loaded {} markers x {} samples from {}",
        markers.len(),
        n,
        path.display()
    );

    let dosages = if columns.is_empty() {
        DenseMatrix::zeros(n, 0)
    } else {
        DenseMatrix::from_columns(&columns)
    };
    InMemoryMarkers::new(sample_ids, markers, dosages)
}
