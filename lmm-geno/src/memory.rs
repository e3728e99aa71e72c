//! In-memory marker matrix.
//!
//! Holds the full dosage matrix for all samples and serves column ranges,
//! optionally through a sample subset that reorders rows to match another
//! data source.

use std::collections::HashMap;
use std::ops::Range;

use anyhow::{bail, Result};
use lmm_linalg::DenseMatrix;

use crate::traits::{MarkerInfo, MarkerReader};

#[derive(Debug, Clone)]
pub struct InMemoryMarkers {
    sample_ids: Vec<String>,
    markers: Vec<MarkerInfo>,
    /// n_all_samples x n_markers
    dosages: DenseMatrix,
    /// Row indices into `dosages` for the active subset.
    subset: Option<Vec<usize>>,
    subset_ids: Vec<String>,
}

impl InMemoryMarkers {
    pub fn new(
        sample_ids: Vec<String>,
        markers: Vec<MarkerInfo>,
        dosages: DenseMatrix,
    ) -> Result<Self> {
        if dosages.nrows() != sample_ids.len() {
            bail!(
                "Dosage matrix has {} rows but {} sample IDs were given",
                dosages.nrows(),
                sample_ids.len()
            );
        }
        if dosages.ncols() != markers.len() {
            bail!(
                "Dosage matrix has {} columns but {} markers were given",
                dosages.ncols(),
                markers.len()
            );
        }
        Ok(Self {
            subset_ids: sample_ids.clone(),
            sample_ids,
            markers,
            dosages,
            subset: None,
        })
    }

    /// Markers named `snp0, snp1, ...` all on one chromosome, at positions 1, 2, ...
    pub fn on_chromosome(chrom: &str, sample_ids: Vec<String>, dosages: DenseMatrix) -> Result<Self> {
        let markers = (0..dosages.ncols())
            .map(|j| MarkerInfo {
                id: format!("snp{}", j),
                chrom: chrom.to_string(),
                genetic_distance: 0.0,
                position: j as u64 + 1,
            })
            .collect();
        Self::new(sample_ids, markers, dosages)
    }
}

impl MarkerReader for InMemoryMarkers {
    fn n_markers(&self) -> usize {
        self.markers.len()
    }

    fn n_samples(&self) -> usize {
        self.subset_ids.len()
    }

    fn sample_ids(&self) -> &[String] {
        &self.subset_ids
    }

    fn set_sample_subset(&mut self, ids: &[String]) -> Result<()> {
        let index: HashMap<&str, usize> = self
            .sample_ids
            .iter()
            .enumerate()
            .map(|(i, id)| (id.as_str(), i))
            .collect();
        let mut rows = Vec::with_capacity(ids.len());
        for id in ids {
            match index.get(id.as_str()) {
                Some(&i) => rows.push(i),
                None => bail!("Sample '{}' not found in marker data", id),
            }
        }
        self.subset = Some(rows);
        self.subset_ids = ids.to_vec();
        Ok(())
    }

    fn marker_info(&self, index: usize) -> Result<MarkerInfo> {
        match self.markers.get(index) {
            Some(info) => Ok(info.clone()),
            None => bail!(
                "Marker index {} out of range ({} markers)",
                index,
                self.markers.len()
            ),
        }
    }

    fn read_markers(&mut self, range: Range<usize>) -> Result<DenseMatrix> {
        if range.end > self.markers.len() || range.start > range.end {
            bail!(
                "Marker range {:?} out of bounds ({} markers)",
                range,
                self.markers.len()
            );
        }
        let block = self.dosages.columns(range);
        Ok(match &self.subset {
            Some(rows) => block.select_rows(rows),
            None => block,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reader() -> InMemoryMarkers {
        let ids = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let dosages = DenseMatrix::from_row_major(3, 2, &[0.0, 1.0, 1.0, 2.0, 2.0, 0.0]);
        let markers = vec![
            MarkerInfo { id: "rs1".into(), chrom: "1".into(), genetic_distance: 0.0, position: 10 },
            MarkerInfo { id: "rs2".into(), chrom: "2".into(), genetic_distance: 0.5, position: 20 },
        ];
        InMemoryMarkers::new(ids, markers, dosages).unwrap()
    }

    #[test]
    fn test_read_range_and_subset() {
        let mut r = reader();
        assert_eq!(r.n_markers(), 2);
        let all = r.read_markers(0..2).unwrap();
        assert_eq!(all.get(2, 0), 2.0);

        r.set_sample_subset(&["c".to_string(), "a".to_string()]).unwrap();
        assert_eq!(r.n_samples(), 2);
        let sub = r.read_markers(1..2).unwrap();
        assert_eq!(sub.col(0), vec![0.0, 1.0]);
    }

    #[test]
    fn test_read_marker_set_out_of_order() {
        let mut r = reader();
        let picked = r.read_marker_set(&[1, 0]).unwrap();
        assert_eq!(picked.ncols(), 2);
        assert_eq!(picked.col(0), vec![1.0, 2.0, 0.0]);
        assert_eq!(picked.col(1), vec![0.0, 1.0, 2.0]);
        assert_eq!(r.read_marker_set(&[]).unwrap().ncols(), 0);
    }

    #[test]
    fn test_unknown_sample_rejected() {
        let mut r = reader();
        assert!(r.set_sample_subset(&["zz".to_string()]).is_err());
    }

    #[test]
    fn test_chromosome_helpers() {
        let r = reader();
        assert_eq!(r.chromosomes().unwrap(), vec!["1", "2"]);
        assert_eq!(r.markers_on("2").unwrap(), vec![1]);
        assert!(r.marker_info(5).is_err());
    }
}
