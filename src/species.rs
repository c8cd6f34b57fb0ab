//! Cross-sample merge of species abundance profiles
//!
//! Each sample contributes a `<sample_id>.species` table. The merge writes
//! abundance and coverage matrices plus a per-species prevalence report.

use crate::config::MergeOptions;
use crate::error::Result as CoreResult;
use crate::io::{fmt_float, StagedOutput};
use crate::matrix::{row_stats, MatrixMerger, MultiSampleMatrix, RowStats, SampleMap, ValueStyle};
use crate::table::{Delimiter, TableReader};
use anyhow::{Context, Result};
use rayon::prelude::*;
use std::collections::HashMap;
use std::ffi::OsString;
use std::io::Write;
use std::path::{Path, PathBuf};

const SPECIES_SUFFIX: &str = ".species";

pub const PREVALENCE_FIELDS: [&str; 7] = [
    "species_id",
    "species_name",
    "mean_coverage",
    "median_coverage",
    "mean_abundance",
    "median_abundance",
    "prevalence",
];

/// Abundance and coverage of every species in one sample
#[derive(Debug, Clone)]
pub struct SpeciesProfile {
    pub abundance: SampleMap,
    pub coverage: SampleMap,
}

pub fn read_species_profile(sample_id: &str, path: &Path) -> CoreResult<SpeciesProfile> {
    let mut table = TableReader::open(path, Delimiter::Whitespace)?;
    let id_col = table.require("cluster_id")?;
    let abundance_col = table.require("relative_abundance")?;
    let coverage_col = table.require("coverage")?;

    let mut profile = SpeciesProfile {
        abundance: SampleMap::new(sample_id),
        coverage: SampleMap::new(sample_id),
    };
    while let Some(record) = table.next_record() {
        let record = record?;
        let abundance = table.parse_f64(&record, abundance_col)?;
        let coverage = table.parse_f64(&record, coverage_col)?;
        profile.abundance.accumulate(&record[id_col], abundance);
        profile.coverage.accumulate(&record[id_col], coverage);
    }
    Ok(profile)
}

/// `(sample_id, path)` of every `<sample_id>.species` file, sorted by sample id
pub fn find_species_files(dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("Failed to list {}", dir.display()))? {
        let path = entry?.path();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if let Some(sample_id) = name.strip_suffix(SPECIES_SUFFIX) {
            if !sample_id.is_empty() && path.is_file() {
                files.push((sample_id.to_string(), path));
            }
        }
    }

    if files.is_empty() {
        anyhow::bail!("No <sample_id>.species files found in {}", dir.display());
    }
    files.sort();
    Ok(files)
}

/// `cluster_id -> consensus_name` from a tab-separated annotation table
pub fn read_annotations(path: &Path) -> CoreResult<HashMap<String, String>> {
    let mut table = TableReader::open(path, Delimiter::Tab)?;
    let id_col = table.require("cluster_id")?;
    let name_col = table.require("consensus_name")?;

    let mut annotations = HashMap::new();
    while let Some(record) = table.next_record() {
        let record = record?;
        annotations.insert(record[id_col].clone(), record[name_col].clone());
    }
    Ok(annotations)
}

/// One line of the prevalence report
#[derive(Debug, Clone, PartialEq)]
pub struct PrevalenceRow {
    pub species_id: String,
    pub species_name: Option<String>,
    pub coverage: RowStats,
    pub abundance: RowStats,
}

/// Per-species statistics, most prevalent first, ties by species id.
///
/// Prevalence counts samples whose coverage reaches `min_cov`.
pub fn prevalence_rows(
    abundance: &MultiSampleMatrix,
    coverage: &MultiSampleMatrix,
    merger: &MatrixMerger,
    min_cov: f64,
    annotations: &HashMap<String, String>,
) -> Vec<PrevalenceRow> {
    let mut rows: Vec<PrevalenceRow> = abundance
        .rows
        .iter()
        .zip(&coverage.rows)
        .map(|(ab, cov)| {
            let species_name = annotations.get(&ab.key).cloned();
            if species_name.is_none() {
                log::warn!("Species {} has no annotation", ab.key);
            }
            PrevalenceRow {
                species_id: ab.key.clone(),
                species_name,
                coverage: row_stats(&merger.resolved(cov), min_cov),
                abundance: row_stats(&merger.resolved(ab), 0.0),
            }
        })
        .collect();

    rows.sort_by(|a, b| {
        b.coverage
            .prevalence
            .cmp(&a.coverage.prevalence)
            .then_with(|| a.species_id.cmp(&b.species_id))
    });
    rows
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub fn write_prevalence<W: Write>(rows: &[PrevalenceRow], out: &mut W) -> CoreResult<()> {
    writeln!(out, "{}", PREVALENCE_FIELDS.join("\t"))?;
    for row in rows {
        writeln!(
            out,
            "{}\t{}\t{}\t{}\t{}\t{}\t{}",
            row.species_id,
            row.species_name.as_deref().unwrap_or("NA"),
            fmt_float(round2(row.coverage.mean)),
            fmt_float(round2(row.coverage.median)),
            fmt_float(round2(row.abundance.mean)),
            fmt_float(round2(row.abundance.median)),
            row.coverage.prevalence
        )?;
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct SpeciesMergeOptions {
    pub in_dir: PathBuf,
    pub out_base: PathBuf,
    pub annotations: PathBuf,
    pub merge: MergeOptions,
}

/// `<out_base><suffix>`
fn output_path(out_base: &Path, suffix: &str) -> PathBuf {
    let mut path = OsString::from(out_base.as_os_str());
    path.push(suffix);
    PathBuf::from(path)
}

pub fn run_merge_species(opts: &SpeciesMergeOptions) -> Result<()> {
    let files = find_species_files(&opts.in_dir)?;
    let annotations = read_annotations(&opts.annotations)
        .with_context(|| format!("Failed to read annotations {}", opts.annotations.display()))?;
    log::info!("Merging species profiles of {} samples", files.len());

    let profiles = files
        .par_iter()
        .map(|(sample_id, path)| read_species_profile(sample_id, path))
        .collect::<CoreResult<Vec<_>>>()?;

    let abundance: Vec<SampleMap> = profiles.iter().map(|p| p.abundance.clone()).collect();
    let coverage: Vec<SampleMap> = profiles.iter().map(|p| p.coverage.clone()).collect();

    let merger = MatrixMerger::new(opts.merge.row_set, opts.merge.missing_value);
    let matrices = merger.merge_flavors(
        "species_id",
        &[
            ("species_abundance", &abundance[..], ValueStyle::Float),
            ("species_coverage", &coverage[..], ValueStyle::Float),
        ],
    )?;

    for matrix in &matrices {
        let path = output_path(&opts.out_base, &format!(".{}", matrix.name));
        let mut out = StagedOutput::create(&path)?;
        matrix.write_tsv(&mut out, opts.merge.missing_value)?;
        out.commit()?;
    }

    let rows = prevalence_rows(
        &matrices[0],
        &matrices[1],
        &merger,
        opts.merge.min_cov,
        &annotations,
    );
    let mut out = StagedOutput::create(&output_path(&opts.out_base, ".species_prevalence"))?;
    write_prevalence(&rows, &mut out)?;
    out.commit()?;

    log::info!("Wrote {} species", rows.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use tempfile::tempdir;

    const ANNOTATIONS: &str = "cluster_id\tconsensus_name\nsp1\tBacteroides vulgatus\nsp2\tPrevotella copri\n";

    fn setup(dir: &Path) -> SpeciesMergeOptions {
        let input = dir.join("species");
        std::fs::create_dir_all(&input).unwrap();
        std::fs::write(
            input.join("s2.species"),
            "cluster_id relative_abundance coverage\nsp1 0.5 4.0\nsp2 0.5 0.5\n",
        )
        .unwrap();
        std::fs::write(
            input.join("s1.species"),
            "cluster_id\trelative_abundance\tcoverage\nsp1\t0.25\t2.0\nsp2\t0.7\t3.0\nsp3\t0.05\t0.1\n",
        )
        .unwrap();
        std::fs::write(input.join("notes.txt"), "ignored\n").unwrap();
        std::fs::write(dir.join("annotations.txt"), ANNOTATIONS).unwrap();

        SpeciesMergeOptions {
            in_dir: input,
            out_base: dir.join("merged"),
            annotations: dir.join("annotations.txt"),
            merge: MergeOptions::default(),
        }
    }

    #[test]
    fn test_find_species_files_sorted() {
        let dir = tempdir().unwrap();
        let opts = setup(dir.path());
        let files = find_species_files(&opts.in_dir).unwrap();
        let ids: Vec<&str> = files.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["s1", "s2"]);

        let empty = tempdir().unwrap();
        assert!(find_species_files(empty.path()).is_err());
    }

    #[test]
    fn test_merge_species_outputs() {
        let dir = tempdir().unwrap();
        let opts = setup(dir.path());
        run_merge_species(&opts).unwrap();

        assert_eq!(
            std::fs::read_to_string(dir.path().join("merged.species_coverage")).unwrap(),
            "species_id\ts1\ts2\nsp1\t2.0\t4.0\nsp2\t3.0\t0.5\nsp3\t0.1\t0.0\n"
        );
        assert_eq!(
            std::fs::read_to_string(dir.path().join("merged.species_prevalence")).unwrap(),
            "species_id\tspecies_name\tmean_coverage\tmedian_coverage\tmean_abundance\tmedian_abundance\tprevalence\n\
             sp1\tBacteroides vulgatus\t3.0\t3.0\t0.38\t0.38\t2\n\
             sp2\tPrevotella copri\t1.75\t1.75\t0.6\t0.6\t1\n\
             sp3\tNA\t0.05\t0.05\t0.03\t0.03\t0\n"
        );
        assert!(dir.path().join("merged.species_abundance").exists());
    }

    #[test]
    fn test_prevalence_ties_sorted_by_id() {
        let mut a = SampleMap::new("s1");
        a.accumulate("spB", 1.0);
        a.accumulate("spA", 1.0);
        let merger = MatrixMerger::default();
        let samples = vec![a];
        let keys = merger.row_keys(&samples).unwrap();
        let matrix = merger.fill("species_coverage", "species_id", &keys, &samples, ValueStyle::Float);

        let rows = prevalence_rows(&matrix, &matrix, &merger, 1.0, &HashMap::new());
        assert_eq!(rows[0].species_id, "spA");
        assert_eq!(rows[1].species_id, "spB");
        assert_eq!(rows[0].coverage.prevalence, 1);
        assert_relative_eq!(rows[0].abundance.mean, 1.0);
    }

    #[test]
    fn test_non_numeric_coverage_is_fatal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("s1.species");
        std::fs::write(&path, "cluster_id relative_abundance coverage\nsp1 0.5 high\n").unwrap();
        assert!(read_species_profile("s1", &path).is_err());
    }
}
