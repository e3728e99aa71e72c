//! Per-marker test records and the result table.

use std::io::Write;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Outcome of one likelihood-ratio test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestRecord {
    /// Position of the marker in the input marker order.
    pub marker_index: usize,
    pub marker_id: String,
    pub chromosome: String,
    pub genetic_distance: f64,
    pub position: u64,
    pub p_value: f64,
    /// Coefficient of the standardized marker in the alternative model.
    pub effect_size: f64,
    pub effect_size_stderr: Option<f64>,
    /// Heritability selected for the null model.
    pub null_h2: f64,
    pub phenotype_id: String,
}

/// A phenotype (marker = `None`) or a single marker that could not be tested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestFailure {
    pub phenotype_id: String,
    pub chromosome: String,
    pub marker_index: Option<usize>,
    pub marker_id: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssocResults {
    pub records: Vec<TestRecord>,
    pub failures: Vec<TestFailure>,
    /// Set when the run stopped early on request.
    pub cancelled: bool,
}

impl AssocResults {
    /// Records by ascending p-value; ties keep their original order.
    pub fn sorted_by_p_value(&self) -> Vec<TestRecord> {
        let mut out = self.records.clone();
        out.sort_by(|a, b| a.p_value.total_cmp(&b.p_value));
        out
    }

    pub fn records_for(&self, phenotype_id: &str) -> impl Iterator<Item = &TestRecord> {
        let phenotype_id = phenotype_id.to_string();
        self.records
            .iter()
            .filter(move |r| r.phenotype_id == phenotype_id)
    }

    /// Write the header and every record sorted by p-value.
    pub fn write_sorted(&self, writer: &mut impl Write) -> Result<()> {
        write_results_header(writer)?;
        for r in self.sorted_by_p_value() {
            write_result_line(writer, &r)?;
        }
        Ok(())
    }
}

pub fn write_results_header(writer: &mut impl Write) -> Result<()> {
    writeln!(
        writer,
        "sid_index\tSNP\tChr\tGenDist\tChrPos\tPValue\tSnpWeight\tSnpWeightSE\tNullh2\tPheno"
    )?;
    Ok(())
}

pub fn write_result_line(writer: &mut impl Write, record: &TestRecord) -> Result<()> {
    writeln!(
        writer,
        "{}\t{}\t{}\t{}\t{}\t{:e}\t{}\t{}\t{}\t{}",
        record.marker_index,
        record.marker_id,
        record.chromosome,
        record.genetic_distance,
        record.position,
        record.p_value,
        record.effect_size,
        match record.effect_size_stderr {
            Some(se) => format!("{}", se),
            None => "NA".to_string(),
        },
        record.null_h2,
        record.phenotype_id,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(idx: usize, p: f64) -> TestRecord {
        TestRecord {
            marker_index: idx,
            marker_id: format!("rs{}", idx),
            chromosome: "1".into(),
            genetic_distance: 0.0,
            position: 100 + idx as u64,
            p_value: p,
            effect_size: 0.1,
            effect_size_stderr: Some(0.05),
            null_h2: 0.4,
            phenotype_id: "y".into(),
        }
    }

    #[test]
    fn test_sort_is_stable() {
        let results = AssocResults {
            records: vec![record(0, 0.5), record(1, 0.01), record(2, 0.5), record(3, 1.0)],
            ..Default::default()
        };
        let sorted: Vec<usize> = results.sorted_by_p_value().iter().map(|r| r.marker_index).collect();
        assert_eq!(sorted, vec![1, 0, 2, 3]);
    }

    #[test]
    fn test_write_lines() {
        let mut buf = Vec::new();
        let mut r = record(7, 0.001);
        r.effect_size_stderr = None;
        write_results_header(&mut buf).unwrap();
        write_result_line(&mut buf, &r).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("sid_index\tSNP"));
        let fields: Vec<&str> = lines[1].split('\t').collect();
        assert_eq!(fields.len(), 10);
        assert_eq!(fields[0], "7");
        assert_eq!(fields[1], "rs7");
        assert_eq!(fields[5].parse::<f64>().unwrap(), 0.001);
        assert_eq!(fields[7], "NA");
        assert_eq!(fields[9], "y");
    }
}
