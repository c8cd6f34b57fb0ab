//! panprofile: reference-anchored SNP profiles and cross-sample merges
//!
//! `snps` aligns one metagenomic sample against the representative genomes
//! of selected species and writes one full-length variant profile per
//! species. `merge-genes` and `merge-species` combine per-sample gene and
//! species profiles into multi-sample matrices.

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use log::info;
use std::path::PathBuf;

mod cancel;
mod config;
mod error;
mod fasta;
mod genes;
mod genome_db;
mod io;
mod matrix;
mod partition;
mod pileup;
mod profile;
mod reference;
mod snps;
mod species;
mod summary;
mod table;
mod tools;

use crate::config::Config;
use crate::matrix::{MissingValue, RowSet};

#[derive(Parser, Debug)]
#[command(name = "panprofile")]
#[command(version)]
#[command(about = "Per-species SNP profiles and cross-sample gene/species matrices from metagenomes")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build the genome database, align reads and write per-species SNP profiles
    Snps(SnpsArgs),

    /// Merge per-sample gene profiles into presence/absence, copy-number and depth matrices
    MergeGenes(MergeGenesArgs),

    /// Merge per-sample species profiles into abundance, coverage and prevalence tables
    MergeSpecies(MergeSpeciesArgs),
}

/// Options shared by every subcommand
#[derive(Args, Debug)]
struct CommonArgs {
    /// YAML configuration file (tool paths, aligner, pileup and merge settings)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of threads for parallel processing
    #[arg(short, long, default_value_t = num_cpus::get())]
    threads: usize,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

/// Command-line overrides of the `merge` config section
#[derive(Args, Debug)]
struct MergePolicyArgs {
    /// Rows of the matrices: keys of the first sample, or the union over samples
    #[arg(long, value_enum)]
    row_set: Option<RowSet>,

    /// How a key absent from a sample is written
    #[arg(long, value_enum)]
    missing_value: Option<MissingValue>,
}

#[derive(Args, Debug)]
struct SnpsArgs {
    /// Output directory; results go to <outdir>/snps/
    outdir: PathBuf,

    /// Reference database directory (contains rep_genomes/<species_id>/)
    #[arg(short, long)]
    db: PathBuf,

    /// Species ids to profile (default: species.txt from a previous run)
    #[arg(long, num_args = 1.., value_delimiter = ',')]
    species: Option<Vec<String>>,

    /// Build the genome database and bowtie2 index
    #[arg(long)]
    build_db: bool,

    /// Align reads to the genome database
    #[arg(long)]
    align: bool,

    /// Pileup, partition by species, format profiles and summarize
    #[arg(long)]
    call: bool,

    /// Remove the temp directory when done
    #[arg(long)]
    remove_temp: bool,

    /// FASTA/FASTQ reads (first mate when paired)
    #[arg(short = '1', long)]
    m1: Option<PathBuf>,

    /// Second mate of paired-end reads
    #[arg(short = '2', long, requires = "m1")]
    m2: Option<PathBuf>,

    /// Cancel the remaining species as soon as one fails
    #[arg(long)]
    fail_fast: bool,

    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Args, Debug)]
struct MergeGenesArgs {
    /// Output directory; one subdirectory per species
    #[arg(short, long)]
    outdir: PathBuf,

    /// Sample directories (each containing genes/output/)
    #[arg(short, long, num_args = 1.., required = true)]
    samples: Vec<PathBuf>,

    /// Species ids to merge (default: every species found in any sample)
    #[arg(long, num_args = 1.., value_delimiter = ',')]
    species: Option<Vec<String>>,

    /// Copy number at or above which a gene counts as present
    #[arg(long)]
    min_copy: Option<f64>,

    #[command(flatten)]
    policy: MergePolicyArgs,

    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Args, Debug)]
struct MergeSpeciesArgs {
    /// Directory of <sample_id>.species files
    #[arg(short, long)]
    input: PathBuf,

    /// Output base name: <out_base>.species_{abundance,coverage,prevalence}
    #[arg(short, long)]
    out_base: PathBuf,

    /// Species annotation table (cluster_id, consensus_name)
    #[arg(short, long)]
    annotations: PathBuf,

    /// Genome coverage at or above which a sample counts toward prevalence
    #[arg(short, long)]
    min_cov: Option<f64>,

    #[command(flatten)]
    policy: MergePolicyArgs,

    #[command(flatten)]
    common: CommonArgs,
}

/// Logging, thread pool and configuration shared by every subcommand
fn init(common: &CommonArgs) -> Result<Config> {
    let log_level = if common.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    rayon::ThreadPoolBuilder::new()
        .num_threads(common.threads)
        .build_global()?;

    info!("panprofile v{}", env!("CARGO_PKG_VERSION"));
    if let Some(path) = &common.config {
        info!("Loading configuration: {}", path.display());
    }
    Config::load(common.config.as_deref())
}

fn apply_policy(config: &mut Config, policy: &MergePolicyArgs) {
    if let Some(row_set) = policy.row_set {
        config.merge.row_set = row_set;
    }
    if let Some(missing) = policy.missing_value {
        config.merge.missing_value = missing;
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Snps(args) => run_snps(args),
        Commands::MergeGenes(args) => run_merge_genes(args),
        Commands::MergeSpecies(args) => run_merge_species(args),
    }
}

fn run_snps(args: SnpsArgs) -> Result<()> {
    let config = init(&args.common)?;

    if !(args.build_db || args.align || args.call || args.remove_temp) {
        anyhow::bail!("Nothing to do: specify at least one of --build-db, --align, --call, --remove-temp");
    }

    let reads = args.m1.map(|m1| tools::ReadInput { m1, m2: args.m2 });
    let opts = snps::SnpsOptions {
        outdir: args.outdir,
        db_dir: args.db,
        species: args.species,
        reads,
        build_db: args.build_db,
        align: args.align,
        call: args.call,
        remove_temp: args.remove_temp,
        threads: args.common.threads,
        fail_fast: args.fail_fast,
    };
    snps::run_snps(&opts, &config)
}

fn run_merge_genes(args: MergeGenesArgs) -> Result<()> {
    let mut config = init(&args.common)?;
    apply_policy(&mut config, &args.policy);
    if let Some(min_copy) = args.min_copy {
        config.merge.min_copy = min_copy;
    }
    config.validate()?;

    let opts = genes::GenesMergeOptions {
        sample_dirs: args.samples,
        species: args.species,
        outdir: args.outdir,
        merge: config.merge,
    };
    genes::run_merge_genes(&opts)
}

fn run_merge_species(args: MergeSpeciesArgs) -> Result<()> {
    let mut config = init(&args.common)?;
    apply_policy(&mut config, &args.policy);
    if let Some(min_cov) = args.min_cov {
        config.merge.min_cov = min_cov;
    }
    config.validate()?;

    let opts = species::SpeciesMergeOptions {
        in_dir: args.input,
        out_base: args.out_base,
        annotations: args.annotations,
        merge: config.merge,
    };
    species::run_merge_species(&opts)
}
