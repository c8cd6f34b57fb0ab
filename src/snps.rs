//! Single-sample SNP profiling pipeline
//!
//! Stages run in order, each optional: build the genome database of the
//! selected species, align reads against it, then call (pileup, partition by
//! species, merge-fill format, summarize). Everything lives under
//! `<outdir>/snps/`.

use crate::cancel::CancelToken;
use crate::config::Config;
use crate::error::PipelineError;
use crate::genome_db::{build_genome_db, Species};
use crate::io::{open_text, StagedOutput};
use crate::partition::{partition_path, partition_pileup, ContigSpeciesMap, PartitionSummary};
use crate::profile::format_species;
use crate::reference::ReferenceIndex;
use crate::summary::{summarize_profile, write_summaries, SpeciesSummary};
use crate::tools::{ReadInput, Toolchain};
use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use serde::Serialize;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

/// File layout of one run
#[derive(Debug, Clone)]
pub struct SnpsLayout {
    root: PathBuf,
}

impl SnpsLayout {
    pub fn new(outdir: &Path) -> Self {
        SnpsLayout {
            root: outdir.join("snps"),
        }
    }

    pub fn species_list(&self) -> PathBuf {
        self.root.join("species.txt")
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.root.join("temp")
    }

    pub fn genomes_fasta(&self) -> PathBuf {
        self.temp_dir().join("genomes.fa")
    }

    pub fn genomes_map(&self) -> PathBuf {
        self.temp_dir().join("genomes.map")
    }

    /// bowtie2 index prefix (`temp/genomes.*.bt2`)
    pub fn index_prefix(&self) -> PathBuf {
        self.temp_dir().join("genomes")
    }

    pub fn bam(&self) -> PathBuf {
        self.temp_dir().join("genomes.bam")
    }

    pub fn combined_pileup(&self) -> PathBuf {
        self.temp_dir().join("genomes.mpileup.gz")
    }

    pub fn partition_dir(&self) -> PathBuf {
        self.temp_dir().join("mpileup")
    }

    pub fn tool_log_dir(&self) -> PathBuf {
        self.temp_dir().join("logs")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.root.join("output")
    }

    pub fn profile(&self, species_id: &str) -> PathBuf {
        self.output_dir().join(format!("{}.snps.gz", species_id))
    }

    pub fn summary(&self) -> PathBuf {
        self.root.join("summary.txt")
    }

    pub fn run_log(&self) -> PathBuf {
        self.root.join("log.json")
    }
}

/// What to run and on which inputs
#[derive(Debug, Clone)]
pub struct SnpsOptions {
    pub outdir: PathBuf,
    pub db_dir: PathBuf,
    pub species: Option<Vec<String>>,
    pub reads: Option<ReadInput>,
    pub build_db: bool,
    pub align: bool,
    pub call: bool,
    pub remove_temp: bool,
    pub threads: usize,
    pub fail_fast: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageRecord {
    pub stage: String,
    pub started_at: String,
    pub duration_secs: f64,
    pub success: bool,
    pub commands: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedSpecies {
    pub species_id: String,
    pub error: String,
}

/// JSON record of a run, written to `log.json`
#[derive(Debug, Clone, Serialize)]
pub struct RunLog {
    pub version: String,
    pub command_line: String,
    pub started_at: String,
    pub stages: Vec<StageRecord>,
    pub failed_species: Vec<FailedSpecies>,
}

impl RunLog {
    pub fn new() -> Self {
        RunLog {
            version: env!("CARGO_PKG_VERSION").to_string(),
            command_line: std::env::args().collect::<Vec<_>>().join(" "),
            started_at: chrono::Local::now().to_rfc3339(),
            stages: Vec::new(),
            failed_species: Vec::new(),
        }
    }

    /// Run one stage, recording its duration and the commands it returns
    pub fn stage<F>(&mut self, name: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut Vec<String>) -> Result<()>,
    {
        log::info!("Stage {}: started", name);
        let started_at = chrono::Local::now().to_rfc3339();
        let start = Instant::now();

        let mut commands = Vec::new();
        let result = f(&mut commands);
        let duration_secs = start.elapsed().as_secs_f64();

        self.stages.push(StageRecord {
            stage: name.to_string(),
            started_at,
            duration_secs,
            success: result.is_ok(),
            commands,
        });

        match &result {
            Ok(()) => log::info!("Stage {}: done in {:.1}s", name, duration_secs),
            Err(e) => log::error!("Stage {}: failed after {:.1}s: {:#}", name, duration_secs, e),
        }
        result
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let mut out = StagedOutput::create(path)?;
        serde_json::to_writer_pretty(&mut out, self).context("Failed to serialize run log")?;
        writeln!(out)?;
        out.commit()?;
        Ok(())
    }
}

/// Species ids given on the command line are written to `species.txt`;
/// otherwise the existing list is read back.
pub fn resolve_species_ids(layout: &SnpsLayout, given: Option<&[String]>) -> Result<Vec<String>> {
    let path = layout.species_list();

    let ids = match given {
        Some(ids) => {
            let mut unique: Vec<String> = Vec::new();
            for id in ids {
                if !unique.contains(id) {
                    unique.push(id.clone());
                }
            }
            let mut out = StagedOutput::create(&path)?;
            for id in &unique {
                writeln!(out, "{}", id)?;
            }
            out.commit()?;
            unique
        }
        None => {
            let reader = open_text(&path)
                .context("No --species given and no species list from a previous run")?;
            let mut ids = Vec::new();
            for line in reader.lines() {
                let line = line?;
                let id = line.trim();
                if !id.is_empty() {
                    ids.push(id.to_string());
                }
            }
            ids
        }
    };

    if ids.is_empty() {
        anyhow::bail!("Species list is empty: {}", path.display());
    }
    Ok(ids)
}

/// Split the combined pileup into one partition per species
pub fn partition_stage(layout: &SnpsLayout, cancel: &CancelToken) -> Result<PartitionSummary> {
    let map = ContigSpeciesMap::read(&layout.genomes_map())
        .with_context(|| format!("Failed to load {}", layout.genomes_map().display()))?;
    if map.is_empty() {
        anyhow::bail!("Contig map {} is empty", layout.genomes_map().display());
    }
    let input = open_text(&layout.combined_pileup())?;

    let summary = partition_pileup(input, &map, &layout.partition_dir(), cancel)
        .context("Failed to partition pileup by species")?;
    log::info!(
        "Partitioned {} pileup lines across {} contigs",
        summary.total_lines,
        map.len()
    );
    for (species_id, lines) in &summary.lines_per_species {
        log::debug!("  {}: {} lines", species_id, lines);
    }
    Ok(summary)
}

fn format_one(
    layout: &SnpsLayout,
    db_dir: &Path,
    species_id: &str,
    cancel: &CancelToken,
) -> std::result::Result<SpeciesSummary, PipelineError> {
    cancel.check()?;

    let species = Species::resolve(db_dir, species_id)?;
    let reference = ReferenceIndex::load(&species.rep_genome)?;
    let profile = layout.profile(species_id);

    let stats = format_species(
        &reference,
        &partition_path(&layout.partition_dir(), species_id),
        &profile,
        cancel,
    )?;
    log::debug!(
        "{}: {} of {} positions with pileup calls",
        species_id,
        stats.calls,
        reference.len()
    );

    summarize_profile(species_id, &profile)
}

/// Result of formatting every species
#[derive(Debug, Default)]
pub struct FormatOutcome {
    pub summaries: Vec<SpeciesSummary>,
    pub failures: Vec<FailedSpecies>,
}

/// Format and summarize every species on the global rayon pool.
///
/// A failed species never stops its siblings unless `fail_fast` is set, in
/// which case the first failure cancels every species not yet finished.
pub fn format_stage(
    layout: &SnpsLayout,
    db_dir: &Path,
    species_ids: &[String],
    fail_fast: bool,
    cancel: &CancelToken,
) -> Result<FormatOutcome> {
    std::fs::create_dir_all(layout.output_dir())
        .with_context(|| format!("Failed to create {}", layout.output_dir().display()))?;

    let pb = ProgressBar::new(species_ids.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} species ({percent}%) ETA: {eta}")?
            .progress_chars("=>-"),
    );
    pb.set_message("Formatting profiles");

    let results: Vec<(&String, std::result::Result<SpeciesSummary, PipelineError>)> = species_ids
        .par_iter()
        .map(|species_id| {
            let result = format_one(layout, db_dir, species_id, cancel);
            if result.is_err() && fail_fast {
                cancel.cancel();
            }
            pb.inc(1);
            (species_id, result)
        })
        .collect();

    pb.finish_with_message("Profiles complete");

    let mut outcome = FormatOutcome::default();
    for (species_id, result) in results {
        match result {
            Ok(summary) => outcome.summaries.push(summary),
            Err(e) => {
                match &e {
                    PipelineError::Cancelled => log::warn!("{}: cancelled", species_id),
                    e if e.is_data_inconsistency() => {
                        log::error!("{}: inconsistent input: {}", species_id, e)
                    }
                    e => log::error!("{}: {}", species_id, e),
                }
                outcome.failures.push(FailedSpecies {
                    species_id: species_id.clone(),
                    error: e.to_string(),
                });
            }
        }
    }
    Ok(outcome)
}

pub fn write_summary_file(layout: &SnpsLayout, summaries: &[SpeciesSummary]) -> Result<()> {
    let mut out = StagedOutput::create(&layout.summary())?;
    write_summaries(summaries, &mut out)?;
    out.commit()?;
    Ok(())
}

fn run_stages(opts: &SnpsOptions, config: &Config, layout: &SnpsLayout, run_log: &mut RunLog) -> Result<()> {
    let species_ids = resolve_species_ids(layout, opts.species.as_deref())?;
    log::info!("{} species selected", species_ids.len());

    std::fs::create_dir_all(layout.temp_dir())
        .with_context(|| format!("Failed to create {}", layout.temp_dir().display()))?;
    let tools = Toolchain::new(config.tools.clone(), &layout.tool_log_dir());
    let cancel = CancelToken::new();

    if opts.build_db {
        run_log.stage("build_db", |commands| {
            let species = species_ids
                .iter()
                .map(|id| Species::resolve(&opts.db_dir, id))
                .collect::<std::result::Result<Vec<_>, _>>()?;
            build_genome_db(&species, &layout.genomes_fasta(), &layout.genomes_map())?;
            commands.push(tools.build_index(&layout.genomes_fasta(), &layout.index_prefix())?);
            Ok(())
        })?;
    }

    if opts.align {
        let reads = opts
            .reads
            .as_ref()
            .context("--align requires reads (-1, optionally -2)")?;
        run_log.stage("align", |commands| {
            commands.push(tools.align(
                &layout.index_prefix(),
                reads,
                &config.align,
                opts.threads,
                &layout.bam(),
            )?);
            commands.push(tools.check_bam(&layout.bam())?);
            Ok(())
        })?;
    }

    if opts.call {
        run_log.stage("pileup", |commands| {
            commands.push(tools.mpileup(
                &layout.bam(),
                &layout.genomes_fasta(),
                &config.pileup,
                &layout.combined_pileup(),
            )?);
            Ok(())
        })?;

        run_log.stage("partition", |_| {
            partition_stage(layout, &cancel)?;
            Ok(())
        })?;

        let mut outcome = FormatOutcome::default();
        run_log.stage("format", |_| {
            outcome = format_stage(layout, &opts.db_dir, &species_ids, opts.fail_fast, &cancel)?;
            write_summary_file(layout, &outcome.summaries)?;
            std::fs::remove_dir_all(layout.partition_dir())
                .with_context(|| format!("Failed to remove {}", layout.partition_dir().display()))?;
            Ok(())
        })?;

        if !outcome.failures.is_empty() {
            let failed = outcome.failures.len();
            run_log.failed_species = outcome.failures;
            anyhow::bail!(
                "{} of {} species failed; see {}",
                failed,
                species_ids.len(),
                layout.run_log().display()
            );
        }
    }

    if opts.remove_temp {
        std::fs::remove_dir_all(layout.temp_dir())
            .with_context(|| format!("Failed to remove {}", layout.temp_dir().display()))?;
        log::info!("Removed {}", layout.temp_dir().display());
    }
    Ok(())
}

/// Run the selected stages; the run log is written even when a stage fails.
pub fn run_snps(opts: &SnpsOptions, config: &Config) -> Result<()> {
    let layout = SnpsLayout::new(&opts.outdir);
    std::fs::create_dir_all(&layout.root)
        .with_context(|| format!("Failed to create {}", layout.root.display()))?;

    let mut run_log = RunLog::new();
    let result = run_stages(opts, config, &layout, &mut run_log);
    run_log.write(&layout.run_log())?;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_genome(db: &Path, id: &str, fasta: &str) {
        let dir = db.join("rep_genomes").join(id);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("genome.fna"), fasta).unwrap();
    }

    fn write_gz(path: &Path, text: &str) {
        let mut out = StagedOutput::create(path).unwrap();
        out.write_all(text.as_bytes()).unwrap();
        out.commit().unwrap();
    }

    fn read_gz(path: &Path) -> String {
        let mut text = String::new();
        std::io::Read::read_to_string(&mut open_text(path).unwrap(), &mut text).unwrap();
        text
    }

    /// Genome database + combined pileup, as left by the build and pileup stages
    fn prepared_run(db: &Path, out: &Path) -> (SnpsLayout, Vec<String>) {
        write_genome(db, "sp1", ">c1\nACG\n");
        write_genome(db, "sp2", ">d1\nTT\n");

        let layout = SnpsLayout::new(out);
        std::fs::create_dir_all(layout.temp_dir()).unwrap();
        let species = vec![
            Species::resolve(db, "sp1").unwrap(),
            Species::resolve(db, "sp2").unwrap(),
        ];
        build_genome_db(&species, &layout.genomes_fasta(), &layout.genomes_map()).unwrap();
        write_gz(
            &layout.combined_pileup(),
            "c1\t2\tC\t5\t,,,.T\tIIIII\nd1\t1\tT\t2\t.,\tII\n",
        );
        (layout, vec!["sp1".to_string(), "sp2".to_string()])
    }

    #[test]
    fn test_species_list_roundtrip() {
        let out = tempdir().unwrap();
        let layout = SnpsLayout::new(out.path());
        std::fs::create_dir_all(out.path().join("snps")).unwrap();

        let given = vec!["sp2".to_string(), "sp1".to_string(), "sp2".to_string()];
        let ids = resolve_species_ids(&layout, Some(given.as_slice())).unwrap();
        assert_eq!(ids, vec!["sp2", "sp1"]);

        let reread = resolve_species_ids(&layout, None).unwrap();
        assert_eq!(reread, ids);
    }

    #[test]
    fn test_missing_or_empty_species_list() {
        let out = tempdir().unwrap();
        let layout = SnpsLayout::new(out.path());
        std::fs::create_dir_all(out.path().join("snps")).unwrap();
        assert!(resolve_species_ids(&layout, None).is_err());
        let empty: Vec<String> = Vec::new();
        assert!(resolve_species_ids(&layout, Some(empty.as_slice())).is_err());
    }

    #[test]
    fn test_call_stages_after_pileup() {
        let db = tempdir().unwrap();
        let out = tempdir().unwrap();
        let (layout, species) = prepared_run(db.path(), out.path());
        let cancel = CancelToken::new();

        let partitioned = partition_stage(&layout, &cancel).unwrap();
        assert_eq!(partitioned.total_lines, 2);

        let outcome = format_stage(&layout, db.path(), &species, false, &cancel).unwrap();
        assert!(outcome.failures.is_empty());
        write_summary_file(&layout, &outcome.summaries).unwrap();

        assert_eq!(
            read_gz(&layout.profile("sp1")),
            "ref_id\tref_pos\tref_allele\talt_allele\tref_freq\tdepth\tcount_atcg\n\
             c1\t1\tA\tNA\t0.0\t0\t0,0,0,0\n\
             c1\t2\tC\tT\t0.8\t5\t0,1,4,0\n\
             c1\t3\tG\tNA\t0.0\t0\t0,0,0,0\n"
        );
        assert_eq!(
            std::fs::read_to_string(layout.summary()).unwrap(),
            "species_id\tgenome_length\tcovered_bases\tfraction_covered\tmean_coverage\n\
             sp1\t3\t1\t0.3333333333333333\t5.0\n\
             sp2\t2\t1\t0.5\t2.0\n"
        );
    }

    #[test]
    fn test_failed_species_does_not_stop_siblings() {
        let db = tempdir().unwrap();
        let out = tempdir().unwrap();
        let (layout, mut species) = prepared_run(db.path(), out.path());
        let cancel = CancelToken::new();
        partition_stage(&layout, &cancel).unwrap();

        // No representative genome and no partition
        species.push("sp3".to_string());
        let outcome = format_stage(&layout, db.path(), &species, false, &cancel).unwrap();

        assert_eq!(outcome.summaries.len(), 2);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].species_id, "sp3");
        assert!(!layout.profile("sp3").exists());
    }

    #[test]
    fn test_cancelled_run_leaves_no_profiles() {
        let db = tempdir().unwrap();
        let out = tempdir().unwrap();
        let (layout, species) = prepared_run(db.path(), out.path());
        let cancel = CancelToken::new();
        partition_stage(&layout, &cancel).unwrap();

        cancel.cancel();
        let outcome = format_stage(&layout, db.path(), &species, true, &cancel).unwrap();
        assert!(outcome.summaries.is_empty());
        assert_eq!(outcome.failures.len(), 2);
        assert!(!layout.profile("sp1").exists());
        assert!(!layout.profile("sp2").exists());
    }

    #[test]
    fn test_run_log_records_failed_stage() {
        let out = tempdir().unwrap();
        let mut run_log = RunLog::new();
        run_log
            .stage("ok", |commands| {
                commands.push("true".to_string());
                Ok(())
            })
            .unwrap();
        assert!(run_log.stage("bad", |_| anyhow::bail!("boom")).is_err());

        let path = out.path().join("log.json");
        run_log.write(&path).unwrap();
        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["stages"][0]["commands"][0], "true");
        assert_eq!(json["stages"][1]["success"], false);
    }
}
