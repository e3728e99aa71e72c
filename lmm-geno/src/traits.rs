//! Core traits for marker reading.

use std::ops::Range;

use anyhow::Result;
use lmm_linalg::DenseMatrix;

/// Genomic coordinates and identity of a marker.
#[derive(Debug, Clone, PartialEq)]
pub struct MarkerInfo {
    /// Stable marker identifier (e.g. rsID).
    pub id: String,
    /// Chromosome (e.g. "1", "22", "X").
    pub chrom: String,
    /// Genetic distance (cM).
    pub genetic_distance: f64,
    /// Physical position in base pairs.
    pub position: u64,
}

/// Lazily readable marker matrix (rows = individuals, columns = markers).
///
/// Static dispatch via generics in the driver; dynamic dispatch
/// (`Box<dyn MarkerReader>`) at the CLI level.
pub trait MarkerReader: Send {
    /// Total number of markers.
    fn n_markers(&self) -> usize;

    /// Number of individuals returned by `read_markers`.
    fn n_samples(&self) -> usize;

    /// Sample IDs in the row order of `read_markers`.
    fn sample_ids(&self) -> &[String];

    /// Restrict and reorder subsequent reads to these sample IDs.
    fn set_sample_subset(&mut self, ids: &[String]) -> Result<()>;

    /// Metadata of the marker at `index`.
    fn marker_info(&self, index: usize) -> Result<MarkerInfo>;

    /// Raw dosages for a contiguous range of markers (n_samples x range.len()).
    /// Missing values are NaN.
    fn read_markers(&mut self, range: Range<usize>) -> Result<DenseMatrix>;

    /// Raw dosages for an arbitrary, ordered list of markers. Consecutive
    /// indices are read as one range.
    fn read_marker_set(&mut self, indices: &[usize]) -> Result<DenseMatrix> {
        let mut out = DenseMatrix::zeros(self.n_samples(), 0);
        let mut start = 0;
        while start < indices.len() {
            let mut end = start + 1;
            while end < indices.len() && indices[end] == indices[end - 1] + 1 {
                end += 1;
            }
            let run = self.read_markers(indices[start]..indices[end - 1] + 1)?;
            out = out.hstack(&run);
            start = end;
        }
        Ok(out)
    }

    /// Indices of the markers on `chrom`, in file order.
    fn markers_on(&self, chrom: &str) -> Result<Vec<usize>> {
        let mut out = Vec::new();
        for i in 0..self.n_markers() {
            if self.marker_info(i)?.chrom == chrom {
                out.push(i);
            }
        }
        Ok(out)
    }

    /// Distinct chromosomes in order of first appearance.
    fn chromosomes(&self) -> Result<Vec<String>> {
        let mut out: Vec<String> = Vec::new();
        for i in 0..self.n_markers() {
            let chrom = self.marker_info(i)?.chrom;
            if !out.contains(&chrom) {
                out.push(chrom);
            }
        }
        Ok(out)
    }
}
