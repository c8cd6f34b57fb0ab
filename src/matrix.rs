//! Cross-sample matrix merging
//!
//! Every sample contributes a sparse key -> value map. The merger fixes one
//! sorted row set and fills one column per sample, so that all flavors of a
//! merge (presence/absence, copy number, depth, ...) stay row-aligned.

use crate::error::{PipelineError, Result};
use crate::io::fmt_float;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::io::Write;

/// Which keys become matrix rows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RowSet {
    /// Keys of the reference sample only; keys seen only in other samples are dropped
    #[default]
    Reference,
    /// Union of keys across all samples
    Union,
}

/// How a key absent from a sample is written
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum MissingValue {
    #[default]
    Zero,
    Na,
}

/// Number rendering of a matrix flavor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueStyle {
    Float,
    Integer,
}

/// Sparse values of one sample for one flavor
#[derive(Debug, Clone, Default)]
pub struct SampleMap {
    pub sample_id: String,
    pub values: HashMap<String, f64>,
}

impl SampleMap {
    pub fn new(sample_id: &str) -> Self {
        SampleMap {
            sample_id: sample_id.to_string(),
            values: HashMap::new(),
        }
    }

    /// Add to the value of `key`, creating it at zero
    pub fn accumulate(&mut self, key: &str, value: f64) {
        *self.values.entry(key.to_string()).or_insert(0.0) += value;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatrixRow {
    pub key: String,
    /// One entry per sample, `None` where the sample has no value
    pub values: Vec<Option<f64>>,
}

/// Dense key x sample matrix
#[derive(Debug, Clone, PartialEq)]
pub struct MultiSampleMatrix {
    pub name: String,
    pub key_column: String,
    pub sample_ids: Vec<String>,
    pub rows: Vec<MatrixRow>,
    pub style: ValueStyle,
}

/// Across-sample statistics of one matrix row
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RowStats {
    pub mean: f64,
    pub median: f64,
    /// Number of samples with a value >= threshold
    pub prevalence: usize,
}

/// Mean, median and prevalence; every aggregate is 0 for an empty slice.
pub fn row_stats(values: &[f64], threshold: f64) -> RowStats {
    if values.is_empty() {
        return RowStats::default();
    }

    let mean = values.iter().sum::<f64>() / values.len() as f64;

    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    let median = if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    };

    let prevalence = values.iter().filter(|&&v| v >= threshold).count();
    RowStats {
        mean,
        median,
        prevalence,
    }
}

/// Merge policy shared by every flavor of one merge
#[derive(Debug, Clone, Copy, Default)]
pub struct MatrixMerger {
    pub row_set: RowSet,
    pub missing: MissingValue,
    /// Index of the sample whose key set defines the rows under `RowSet::Reference`
    pub reference_sample: usize,
}

impl MatrixMerger {
    pub fn new(row_set: RowSet, missing: MissingValue) -> Self {
        MatrixMerger {
            row_set,
            missing,
            reference_sample: 0,
        }
    }

    /// Sorted row keys for the given samples
    pub fn row_keys(&self, samples: &[SampleMap]) -> Result<Vec<String>> {
        let keys: BTreeSet<&String> = match self.row_set {
            RowSet::Reference => {
                let reference = samples.get(self.reference_sample).ok_or_else(|| {
                    PipelineError::malformed(
                        "matrix merge",
                        0,
                        format!(
                            "reference sample {} out of range for {} samples",
                            self.reference_sample,
                            samples.len()
                        ),
                    )
                })?;
                reference.values.keys().collect()
            }
            RowSet::Union => samples.iter().flat_map(|s| s.values.keys()).collect(),
        };

        if self.row_set == RowSet::Reference {
            let dropped: BTreeSet<&String> = samples
                .iter()
                .flat_map(|s| s.values.keys())
                .filter(|k| !keys.contains(k))
                .collect();
            if !dropped.is_empty() {
                log::warn!(
                    "{} keys absent from reference sample are not in the matrix",
                    dropped.len()
                );
            }
        }

        Ok(keys.into_iter().cloned().collect())
    }

    /// Fill one flavor over a fixed key list
    pub fn fill(
        &self,
        name: &str,
        key_column: &str,
        keys: &[String],
        samples: &[SampleMap],
        style: ValueStyle,
    ) -> MultiSampleMatrix {
        let rows = keys
            .iter()
            .map(|key| MatrixRow {
                key: key.clone(),
                values: samples.iter().map(|s| s.values.get(key).copied()).collect(),
            })
            .collect();

        MultiSampleMatrix {
            name: name.to_string(),
            key_column: key_column.to_string(),
            sample_ids: samples.iter().map(|s| s.sample_id.clone()).collect(),
            rows,
            style,
        }
    }

    /// Merge several flavors with one shared key iteration taken from the
    /// first flavor. All flavors must list the same samples in the same order.
    pub fn merge_flavors(
        &self,
        key_column: &str,
        flavors: &[(&str, &[SampleMap], ValueStyle)],
    ) -> Result<Vec<MultiSampleMatrix>> {
        let Some((_, first, _)) = flavors.first() else {
            return Ok(Vec::new());
        };

        let sample_ids: Vec<&str> = first.iter().map(|s| s.sample_id.as_str()).collect();
        for (name, samples, _) in flavors {
            let ids: Vec<&str> = samples.iter().map(|s| s.sample_id.as_str()).collect();
            if ids != sample_ids {
                return Err(PipelineError::malformed(
                    "matrix merge",
                    0,
                    format!("flavor {} lists different samples than {}", name, flavors[0].0),
                ));
            }
        }

        let keys = self.row_keys(first)?;
        Ok(flavors
            .iter()
            .map(|(name, samples, style)| self.fill(name, key_column, &keys, samples, *style))
            .collect())
    }

    /// Row values with the missing-value policy applied; `Na` drops gaps.
    pub fn resolved(&self, row: &MatrixRow) -> Vec<f64> {
        row.values
            .iter()
            .filter_map(|v| match (v, self.missing) {
                (Some(x), _) => Some(*x),
                (None, MissingValue::Zero) => Some(0.0),
                (None, MissingValue::Na) => None,
            })
            .collect()
    }
}

impl MultiSampleMatrix {
    fn render(&self, value: Option<f64>, missing: MissingValue) -> String {
        match (value, missing) {
            (None, MissingValue::Na) => "NA".to_string(),
            (value, _) => {
                let v = value.unwrap_or(0.0);
                match self.style {
                    ValueStyle::Float => fmt_float(v),
                    ValueStyle::Integer => format!("{:.0}", v),
                }
            }
        }
    }

    /// Header `key_column, sample...` then one line per row
    pub fn write_tsv<W: Write>(&self, out: &mut W, missing: MissingValue) -> Result<()> {
        write!(out, "{}", self.key_column)?;
        for sample in &self.sample_ids {
            write!(out, "\t{}", sample)?;
        }
        writeln!(out)?;

        for row in &self.rows {
            write!(out, "{}", row.key)?;
            for value in &row.values {
                write!(out, "\t{}", self.render(*value, missing))?;
            }
            writeln!(out)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample(id: &str, values: &[(&str, f64)]) -> SampleMap {
        let mut s = SampleMap::new(id);
        for (k, v) in values {
            s.accumulate(k, *v);
        }
        s
    }

    fn two_samples() -> Vec<SampleMap> {
        vec![
            sample("s1", &[("g1", 2.0), ("g2", 0.0)]),
            sample("s2", &[("g1", 1.5), ("g3", 3.0)]),
        ]
    }

    #[test]
    fn test_reference_rows_drop_foreign_keys() {
        let samples = two_samples();
        let merger = MatrixMerger::default();
        let keys = merger.row_keys(&samples).unwrap();
        assert_eq!(keys, vec!["g1".to_string(), "g2".to_string()]);

        let matrix = merger.fill("copynum", "gene_id", &keys, &samples, ValueStyle::Float);
        assert_eq!(matrix.rows.len(), 2);
        assert_eq!(matrix.rows[0].values, vec![Some(2.0), Some(1.5)]);
        assert_eq!(matrix.rows[1].values, vec![Some(0.0), None]);

        let mut buf = Vec::new();
        matrix.write_tsv(&mut buf, MissingValue::Zero).unwrap();
        assert_eq!(
            String::from_utf8(buf).unwrap(),
            "gene_id\ts1\ts2\ng1\t2.0\t1.5\ng2\t0.0\t0.0\n"
        );
    }

    #[test]
    fn test_union_rows_with_na() {
        let samples = two_samples();
        let merger = MatrixMerger::new(RowSet::Union, MissingValue::Na);
        let keys = merger.row_keys(&samples).unwrap();
        assert_eq!(keys.len(), 3);

        let matrix = merger.fill("depth", "gene_id", &keys, &samples, ValueStyle::Float);
        let mut buf = Vec::new();
        matrix.write_tsv(&mut buf, MissingValue::Na).unwrap();
        assert_eq!(
            String::from_utf8(buf).unwrap(),
            "gene_id\ts1\ts2\ng1\t2.0\t1.5\ng2\t0.0\tNA\ng3\tNA\t3.0\n"
        );
        assert_eq!(merger.resolved(&matrix.rows[2]), vec![3.0]);
    }

    #[test]
    fn test_flavors_are_key_aligned() {
        let copynum = two_samples();
        let depth = vec![
            sample("s1", &[("g1", 20.0), ("g2", 1.0)]),
            sample("s2", &[("g1", 15.0), ("g3", 30.0)]),
        ];
        let merger = MatrixMerger::default();
        let matrices = merger
            .merge_flavors(
                "gene_id",
                &[
                    ("copynum", &copynum[..], ValueStyle::Float),
                    ("depth", &depth[..], ValueStyle::Float),
                ],
            )
            .unwrap();

        assert_eq!(matrices.len(), 2);
        let keys: Vec<Vec<&str>> = matrices
            .iter()
            .map(|m| m.rows.iter().map(|r| r.key.as_str()).collect())
            .collect();
        assert_eq!(keys[0], keys[1]);
        assert_eq!(matrices[1].rows[1].values, vec![Some(1.0), None]);
    }

    #[test]
    fn test_mismatched_flavor_samples_rejected() {
        let a = two_samples();
        let b = vec![sample("s2", &[]), sample("s1", &[])];
        let result = MatrixMerger::default().merge_flavors(
            "gene_id",
            &[("a", &a[..], ValueStyle::Float), ("b", &b[..], ValueStyle::Float)],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_integer_style() {
        let samples = vec![sample("s1", &[("g1", 1.0)])];
        let merger = MatrixMerger::default();
        let keys = merger.row_keys(&samples).unwrap();
        let matrix = merger.fill("presabs", "gene_id", &keys, &samples, ValueStyle::Integer);
        let mut buf = Vec::new();
        matrix.write_tsv(&mut buf, MissingValue::Zero).unwrap();
        assert_eq!(String::from_utf8(buf).unwrap(), "gene_id\ts1\ng1\t1\n");
    }

    #[test]
    fn test_row_stats() {
        let stats = row_stats(&[1.0, 4.0, 2.0, 0.5], 1.0);
        assert_relative_eq!(stats.mean, 1.875);
        assert_relative_eq!(stats.median, 1.5);
        assert_eq!(stats.prevalence, 3);

        let odd = row_stats(&[3.0, 1.0, 2.0], 5.0);
        assert_relative_eq!(odd.median, 2.0);
        assert_eq!(odd.prevalence, 0);

        assert_eq!(row_stats(&[], 1.0), RowStats::default());
    }

    #[test]
    fn test_empty_sample_list() {
        let merger = MatrixMerger::new(RowSet::Union, MissingValue::Zero);
        assert!(merger.row_keys(&[]).unwrap().is_empty());
        assert!(MatrixMerger::default().row_keys(&[]).is_err());
    }
}
