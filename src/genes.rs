//! Cross-sample merge of per-sample pan-genome gene profiles
//!
//! For each species, the gene tables of every sample that has one are
//! merged into presence/absence, copy-number and depth matrices, with one
//! line of alignment statistics per sample.

use crate::config::MergeOptions;
use crate::error::Result as CoreResult;
use crate::io::{fmt_float, StagedOutput};
use crate::matrix::{row_stats, MatrixMerger, SampleMap, ValueStyle};
use crate::table::{Delimiter, TableReader};
use anyhow::{Context, Result};
use rayon::prelude::*;
use std::collections::{BTreeSet, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Column aliases, current name first
const GENE_ID_COLUMNS: [&str; 2] = ["gene_id", "ref_id"];
const COPY_NUMBER_COLUMNS: [&str; 2] = ["copy_number", "normalized_coverage"];
const COVERAGE_COLUMNS: [&str; 2] = ["coverage", "raw_coverage"];

const GENES_SUFFIX: &str = ".genes.gz";

pub const GENES_SUMMARY_FIELDS: [&str; 6] = [
    "sample_id",
    "pangenome_size",
    "covered_genes",
    "fraction_covered",
    "mean_coverage",
    "marker_coverage",
];

const README: &str = "\
genes_summary.txt
  alignment statistics per sample:
  pangenome_size    number of genes in the sample's gene profile
  covered_genes     genes with non-zero depth
  fraction_covered  covered_genes / pangenome_size
  mean_coverage     average depth over covered genes
  marker_coverage   median depth of the single-copy marker genes that
                    copy numbers are normalized by
genes_presabs.txt
  1 if the gene's copy number is at or above the presence threshold, else 0
genes_copynum.txt
  gene copy number: read depth normalized by the depth of single-copy marker genes
genes_depth.txt
  average read depth of the gene

Rows are genes (gene_id), columns are samples in input order.
";

/// `<sample_dir>/genes/output/<species_id>.genes.gz`
pub fn genes_path(sample_dir: &Path, species_id: &str) -> PathBuf {
    sample_dir
        .join("genes")
        .join("output")
        .join(format!("{}{}", species_id, GENES_SUFFIX))
}

/// Sample id of a sample directory: its final path component
pub fn sample_id(sample_dir: &Path) -> Result<String> {
    sample_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .with_context(|| format!("Cannot derive a sample id from {}", sample_dir.display()))
}

/// Gene values of one sample for one species
#[derive(Debug, Clone)]
pub struct SampleGenes {
    pub copy_number: SampleMap,
    pub depth: SampleMap,
}

impl SampleGenes {
    /// 1.0 where copy number reaches `min_copy`, 0.0 otherwise
    pub fn presence(&self, min_copy: f64) -> SampleMap {
        let mut presabs = SampleMap::new(&self.copy_number.sample_id);
        for (gene, &cn) in &self.copy_number.values {
            presabs.accumulate(gene, if cn >= min_copy { 1.0 } else { 0.0 });
        }
        presabs
    }
}

/// One line of `genes_summary.txt`
#[derive(Debug, Clone, PartialEq)]
pub struct GeneSummary {
    pub sample_id: String,
    pub pangenome_size: usize,
    pub covered_genes: usize,
    pub fraction_covered: f64,
    pub mean_coverage: f64,
    pub marker_coverage: f64,
}

impl SampleGenes {
    /// Alignment statistics of this sample. Copy number is depth over marker
    /// depth, so the marker depth is recovered as the median of
    /// `depth / copy_number` over genes with a non-zero copy number.
    pub fn summary(&self) -> GeneSummary {
        let pangenome_size = self.depth.values.len();
        let covered: Vec<f64> = self
            .depth
            .values
            .values()
            .copied()
            .filter(|&d| d > 0.0)
            .collect();
        let ratios: Vec<f64> = self
            .copy_number
            .values
            .iter()
            .filter(|&(_, &cn)| cn > 0.0)
            .filter_map(|(gene, &cn)| self.depth.values.get(gene).map(|d| d / cn))
            .collect();

        GeneSummary {
            sample_id: self.depth.sample_id.clone(),
            pangenome_size,
            covered_genes: covered.len(),
            fraction_covered: if pangenome_size == 0 {
                0.0
            } else {
                covered.len() as f64 / pangenome_size as f64
            },
            mean_coverage: row_stats(&covered, 0.0).mean,
            marker_coverage: row_stats(&ratios, 0.0).median,
        }
    }
}

pub fn write_gene_summaries<W: Write>(rows: &[GeneSummary], out: &mut W) -> CoreResult<()> {
    writeln!(out, "{}", GENES_SUMMARY_FIELDS.join("\t"))?;
    for row in rows {
        writeln!(
            out,
            "{}\t{}\t{}\t{}\t{}\t{}",
            row.sample_id,
            row.pangenome_size,
            row.covered_genes,
            fmt_float(row.fraction_covered),
            fmt_float(row.mean_coverage),
            fmt_float(row.marker_coverage)
        )?;
    }
    Ok(())
}

/// Read one sample's gene table; repeated gene ids are summed.
pub fn read_sample_genes(sample_id: &str, path: &Path) -> CoreResult<SampleGenes> {
    let mut table = TableReader::open(path, Delimiter::Tab)?;
    let gene_col = table.require_any(&GENE_ID_COLUMNS)?;
    let copy_col = table.require_any(&COPY_NUMBER_COLUMNS)?;
    let cov_col = table.require_any(&COVERAGE_COLUMNS)?;

    let mut genes = SampleGenes {
        copy_number: SampleMap::new(sample_id),
        depth: SampleMap::new(sample_id),
    };

    while let Some(record) = table.next_record() {
        let record = record?;
        let copy_number = table.parse_f64(&record, copy_col)?;
        let coverage = table.parse_f64(&record, cov_col)?;
        genes.copy_number.accumulate(&record[gene_col], copy_number);
        genes.depth.accumulate(&record[gene_col], coverage);
    }
    Ok(genes)
}

/// Every species with a gene table in at least one sample
pub fn discover_species(sample_dirs: &[PathBuf]) -> Result<BTreeSet<String>> {
    let mut species = BTreeSet::new();
    for dir in sample_dirs {
        let output = dir.join("genes").join("output");
        if !output.is_dir() {
            log::warn!("No gene profiles in {}", dir.display());
            continue;
        }
        for entry in std::fs::read_dir(&output)
            .with_context(|| format!("Failed to list {}", output.display()))?
        {
            let name = entry?.file_name().to_string_lossy().into_owned();
            if let Some(id) = name.strip_suffix(GENES_SUFFIX) {
                species.insert(id.to_string());
            }
        }
    }
    Ok(species)
}

#[derive(Debug, Clone)]
pub struct GenesMergeOptions {
    pub sample_dirs: Vec<PathBuf>,
    pub species: Option<Vec<String>>,
    pub outdir: PathBuf,
    pub merge: MergeOptions,
}

/// Merge one species over the samples that have its gene table.
/// Returns the number of matrix rows written.
pub fn merge_species_genes(
    species_id: &str,
    samples: &[(String, PathBuf)],
    opts: &GenesMergeOptions,
) -> Result<usize> {
    let (inputs, excluded): (Vec<(&String, PathBuf)>, Vec<(&String, PathBuf)>) = samples
        .iter()
        .map(|(id, dir)| (id, genes_path(dir, species_id)))
        .partition(|(_, path)| path.exists());
    if !excluded.is_empty() {
        let ids: Vec<&str> = excluded.iter().map(|(id, _)| id.as_str()).collect();
        log::warn!(
            "{}: {} of {} samples have no gene profile and are left out: {}",
            species_id,
            excluded.len(),
            samples.len(),
            ids.join(", ")
        );
    }
    if inputs.is_empty() {
        anyhow::bail!("No sample has a gene profile for species {}", species_id);
    }

    let loaded = inputs
        .par_iter()
        .map(|(id, path)| read_sample_genes(id, path))
        .collect::<CoreResult<Vec<_>>>()?;

    let presabs: Vec<SampleMap> = loaded
        .iter()
        .map(|g| g.presence(opts.merge.min_copy))
        .collect();
    let copynum: Vec<SampleMap> = loaded.iter().map(|g| g.copy_number.clone()).collect();
    let depth: Vec<SampleMap> = loaded.iter().map(|g| g.depth.clone()).collect();

    let merger = MatrixMerger::new(opts.merge.row_set, opts.merge.missing_value);
    let matrices = merger.merge_flavors(
        "gene_id",
        &[
            ("genes_presabs", &presabs[..], ValueStyle::Integer),
            ("genes_copynum", &copynum[..], ValueStyle::Float),
            ("genes_depth", &depth[..], ValueStyle::Float),
        ],
    )?;

    let species_dir = opts.outdir.join(species_id);
    std::fs::create_dir_all(&species_dir)
        .with_context(|| format!("Failed to create {}", species_dir.display()))?;

    for matrix in &matrices {
        let mut out = StagedOutput::create(&species_dir.join(format!("{}.txt", matrix.name)))?;
        matrix.write_tsv(&mut out, opts.merge.missing_value)?;
        out.commit()?;
    }

    let summaries: Vec<GeneSummary> = loaded.iter().map(SampleGenes::summary).collect();
    let mut out = StagedOutput::create(&species_dir.join("genes_summary.txt"))?;
    write_gene_summaries(&summaries, &mut out)?;
    out.commit()?;

    let mut readme = StagedOutput::create(&species_dir.join("README"))?;
    readme.write_all(README.as_bytes())?;
    readme.commit()?;

    let rows = matrices.first().map(|m| m.rows.len()).unwrap_or(0);
    log::info!(
        "{}: {} genes across {} samples",
        species_id,
        rows,
        inputs.len()
    );
    Ok(rows)
}

/// Merge every requested (or discovered) species; each species is
/// independent and a failure does not stop the others.
pub fn run_merge_genes(opts: &GenesMergeOptions) -> Result<()> {
    if opts.sample_dirs.is_empty() {
        anyhow::bail!("No sample directories given");
    }

    let mut seen = HashSet::new();
    let mut samples = Vec::new();
    for dir in &opts.sample_dirs {
        let id = sample_id(dir)?;
        if !seen.insert(id.clone()) {
            anyhow::bail!("Duplicate sample id {}", id);
        }
        samples.push((id, dir.clone()));
    }

    let species: Vec<String> = match &opts.species {
        Some(ids) => ids.clone(),
        None => discover_species(&opts.sample_dirs)?.into_iter().collect(),
    };
    if species.is_empty() {
        anyhow::bail!("No species to merge");
    }
    log::info!("Merging genes of {} species over {} samples", species.len(), samples.len());

    let mut failed = 0;
    for species_id in &species {
        if let Err(e) = merge_species_genes(species_id, &samples, opts) {
            log::error!("{}: {:#}", species_id, e);
            failed += 1;
        }
    }

    if failed > 0 {
        anyhow::bail!("{} of {} species failed to merge", failed, species.len());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::{MissingValue, RowSet};
    use approx::assert_relative_eq;
    use tempfile::tempdir;

    fn write_genes(sample_dir: &Path, species_id: &str, text: &str) {
        let path = genes_path(sample_dir, species_id);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut out = StagedOutput::create(&path).unwrap();
        out.write_all(text.as_bytes()).unwrap();
        out.commit().unwrap();
    }

    fn options(root: &Path, samples: &[&str]) -> GenesMergeOptions {
        GenesMergeOptions {
            sample_dirs: samples.iter().map(|s| root.join(s)).collect(),
            species: None,
            outdir: root.join("merged"),
            merge: MergeOptions::default(),
        }
    }

    #[test]
    fn test_legacy_columns_and_repeated_genes() {
        let dir = tempdir().unwrap();
        write_genes(
            dir.path(),
            "sp1",
            "ref_id\tnormalized_coverage\traw_coverage\ng1\t1.0\t10\ng1\t0.5\t5\ng2\t0.2\t2\n",
        );
        let genes = read_sample_genes("s1", &genes_path(dir.path(), "sp1")).unwrap();
        assert_eq!(genes.copy_number.values["g1"], 1.5);
        assert_eq!(genes.depth.values["g1"], 15.0);

        let presabs = genes.presence(0.35);
        assert_eq!(presabs.values["g1"], 1.0);
        assert_eq!(presabs.values["g2"], 0.0);
    }

    #[test]
    fn test_missing_column_is_error() {
        let dir = tempdir().unwrap();
        write_genes(dir.path(), "sp1", "gene_id\tcoverage\ng1\t3\n");
        assert!(read_sample_genes("s1", &genes_path(dir.path(), "sp1")).is_err());
    }

    #[test]
    fn test_merge_writes_aligned_matrices() {
        let root = tempdir().unwrap();
        write_genes(
            &root.path().join("s1"),
            "sp1",
            "gene_id\tcopy_number\tcoverage\ng1\t2.0\t20\ng2\t0.0\t0\n",
        );
        write_genes(
            &root.path().join("s2"),
            "sp1",
            "gene_id\tcopy_number\tcoverage\ng1\t1.5\t15\ng3\t3.0\t30\n",
        );

        let opts = options(root.path(), &["s1", "s2"]);
        run_merge_genes(&opts).unwrap();

        let out = opts.outdir.join("sp1");
        assert_eq!(
            std::fs::read_to_string(out.join("genes_copynum.txt")).unwrap(),
            "gene_id\ts1\ts2\ng1\t2.0\t1.5\ng2\t0.0\t0.0\n"
        );
        assert_eq!(
            std::fs::read_to_string(out.join("genes_presabs.txt")).unwrap(),
            "gene_id\ts1\ts2\ng1\t1\t1\ng2\t0\t0\n"
        );
        assert_eq!(
            std::fs::read_to_string(out.join("genes_depth.txt")).unwrap(),
            "gene_id\ts1\ts2\ng1\t20.0\t15.0\ng2\t0.0\t0.0\n"
        );
        assert!(out.join("README").exists());
        assert_eq!(
            std::fs::read_to_string(out.join("genes_summary.txt")).unwrap(),
            "sample_id\tpangenome_size\tcovered_genes\tfraction_covered\tmean_coverage\tmarker_coverage\n\
             s1\t2\t1\t0.5\t20.0\t10.0\n\
             s2\t2\t2\t1.0\t22.5\t10.0\n"
        );
    }

    #[test]
    fn test_gene_summary_statistics() {
        let mut genes = SampleGenes {
            copy_number: SampleMap::new("s1"),
            depth: SampleMap::new("s1"),
        };
        for (gene, cn, depth) in [("g1", 1.0, 4.0), ("g2", 2.0, 8.0), ("g3", 0.5, 3.0), ("g4", 0.0, 0.0)] {
            genes.copy_number.accumulate(gene, cn);
            genes.depth.accumulate(gene, depth);
        }

        let summary = genes.summary();
        assert_eq!(summary.pangenome_size, 4);
        assert_eq!(summary.covered_genes, 3);
        assert_relative_eq!(summary.fraction_covered, 0.75);
        assert_relative_eq!(summary.mean_coverage, 5.0);
        assert_relative_eq!(summary.marker_coverage, 4.0);

        let empty = SampleGenes {
            copy_number: SampleMap::new("s2"),
            depth: SampleMap::new("s2"),
        }
        .summary();
        assert_eq!(empty.covered_genes, 0);
        assert_eq!(empty.fraction_covered, 0.0);
        assert_eq!(empty.marker_coverage, 0.0);
    }

    #[test]
    fn test_samples_without_profile_are_left_out() {
        let root = tempdir().unwrap();
        write_genes(&root.path().join("s1"), "sp1", "gene_id\tcopy_number\tcoverage\ng1\t2.0\t20\n");
        std::fs::create_dir_all(root.path().join("s2")).unwrap();
        write_genes(&root.path().join("s3"), "sp1", "gene_id\tcopy_number\tcoverage\ng1\t1.0\t10\n");

        let mut opts = options(root.path(), &["s1", "s2", "s3"]);
        opts.species = Some(vec!["sp1".to_string()]);
        run_merge_genes(&opts).unwrap();

        let out = opts.outdir.join("sp1");
        assert_eq!(
            std::fs::read_to_string(out.join("genes_depth.txt")).unwrap(),
            "gene_id\ts1\ts3\ng1\t20.0\t10.0\n"
        );
        let summary = std::fs::read_to_string(out.join("genes_summary.txt")).unwrap();
        assert_eq!(summary.lines().count(), 3);
        assert!(!summary.contains("s2"));
    }

    #[test]
    fn test_union_rows_with_na() {
        let root = tempdir().unwrap();
        write_genes(&root.path().join("s1"), "sp1", "gene_id\tcopy_number\tcoverage\ng1\t2.0\t20\n");
        write_genes(&root.path().join("s2"), "sp1", "gene_id\tcopy_number\tcoverage\ng3\t3.0\t30\n");

        let mut opts = options(root.path(), &["s1", "s2"]);
        opts.merge.row_set = RowSet::Union;
        opts.merge.missing_value = MissingValue::Na;
        run_merge_genes(&opts).unwrap();

        assert_eq!(
            std::fs::read_to_string(opts.outdir.join("sp1").join("genes_presabs.txt")).unwrap(),
            "gene_id\ts1\ts2\ng1\t1\tNA\ng3\tNA\t1\n"
        );
    }

    #[test]
    fn test_discovery_and_independent_species() {
        let root = tempdir().unwrap();
        write_genes(&root.path().join("s1"), "sp1", "gene_id\tcopy_number\tcoverage\ng1\t2.0\t20\n");
        write_genes(&root.path().join("s2"), "sp2", "gene_id\tcopy_number\tcoverage\ng1\tbad\t20\n");

        let opts = options(root.path(), &["s1", "s2"]);
        let found = discover_species(&opts.sample_dirs).unwrap();
        assert_eq!(found.into_iter().collect::<Vec<_>>(), vec!["sp1", "sp2"]);

        // sp2 is malformed; sp1 is still written
        assert!(run_merge_genes(&opts).is_err());
        assert!(opts.outdir.join("sp1").join("genes_copynum.txt").exists());
        assert!(!opts.outdir.join("sp2").join("genes_copynum.txt").exists());
    }

    #[test]
    fn test_duplicate_sample_ids_rejected() {
        let root = tempdir().unwrap();
        let opts = GenesMergeOptions {
            sample_dirs: vec![root.path().join("a/s1"), root.path().join("b/s1")],
            species: Some(vec!["sp1".to_string()]),
            outdir: root.path().join("merged"),
            merge: MergeOptions::default(),
        };
        assert!(run_merge_genes(&opts).is_err());
    }
}
