//! Configuration parsing
//!
//! An optional YAML file carries external tool paths, aligner and pileup
//! settings, and the cross-sample merge policy. Every section has defaults,
//! so an empty file (or no file) is a valid configuration.

use crate::matrix::{MissingValue, RowSet};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub tools: ToolPaths,

    #[serde(default)]
    pub align: AlignOptions,

    #[serde(default)]
    pub pileup: PileupOptions,

    #[serde(default)]
    pub merge: MergeOptions,
}

/// Paths of the external executables (default: looked up in PATH)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolPaths {
    #[serde(default = "default_bowtie2")]
    pub bowtie2: PathBuf,

    #[serde(default = "default_bowtie2_build")]
    pub bowtie2_build: PathBuf,

    #[serde(default = "default_samtools")]
    pub samtools: PathBuf,
}

impl Default for ToolPaths {
    fn default() -> Self {
        ToolPaths {
            bowtie2: default_bowtie2(),
            bowtie2_build: default_bowtie2_build(),
            samtools: default_samtools(),
        }
    }
}

fn default_bowtie2() -> PathBuf {
    "bowtie2".into()
}

fn default_bowtie2_build() -> PathBuf {
    "bowtie2-build".into()
}

fn default_samtools() -> PathBuf {
    "samtools".into()
}

/// Bowtie2 alignment settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlignOptions {
    /// Preset passed as `--<speed>` (very-fast, fast, sensitive, very-sensitive)
    #[serde(default = "default_speed")]
    pub speed: String,

    /// Only align the first N reads
    #[serde(default)]
    pub max_reads: Option<u64>,

    /// Trim N bases from the 3' end of each read
    #[serde(default)]
    pub trim: Option<u32>,
}

impl Default for AlignOptions {
    fn default() -> Self {
        AlignOptions {
            speed: default_speed(),
            max_reads: None,
            trim: None,
        }
    }
}

fn default_speed() -> String {
    "very-sensitive".to_string()
}

const SPEED_PRESETS: [&str; 4] = ["very-fast", "fast", "sensitive", "very-sensitive"];

/// samtools mpileup settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PileupOptions {
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,

    #[serde(default = "default_min_baseq")]
    pub min_baseq: u32,

    #[serde(default = "default_min_mapq")]
    pub min_mapq: u32,

    /// Enable base alignment quality computation
    #[serde(default)]
    pub baq: bool,

    /// Adjust mapping quality (`-C 50`)
    #[serde(default)]
    pub adjust_mq: bool,

    /// Discard anomalous read pairs
    #[serde(default)]
    pub discard_discordant: bool,
}

impl Default for PileupOptions {
    fn default() -> Self {
        PileupOptions {
            max_depth: default_max_depth(),
            min_baseq: default_min_baseq(),
            min_mapq: default_min_mapq(),
            baq: false,
            adjust_mq: false,
            discard_discordant: false,
        }
    }
}

fn default_max_depth() -> u32 {
    10000
}

fn default_min_baseq() -> u32 {
    30
}

fn default_min_mapq() -> u32 {
    20
}

/// Cross-sample merge policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeOptions {
    /// Copy number at or above which a gene counts as present
    #[serde(default = "default_min_copy")]
    pub min_copy: f64,

    /// Genome coverage at or above which a sample counts toward prevalence
    #[serde(default = "default_min_cov")]
    pub min_cov: f64,

    #[serde(default)]
    pub row_set: RowSet,

    #[serde(default)]
    pub missing_value: MissingValue,
}

impl Default for MergeOptions {
    fn default() -> Self {
        MergeOptions {
            min_copy: default_min_copy(),
            min_cov: default_min_cov(),
            row_set: RowSet::default(),
            missing_value: MissingValue::default(),
        }
    }
}

fn default_min_copy() -> f64 {
    0.35
}

fn default_min_cov() -> f64 {
    1.0
}

impl Config {
    /// Load configuration from YAML file
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse YAML config: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Load from `path` when given, defaults otherwise
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::from_yaml(p),
            None => Ok(Config::default()),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if !SPEED_PRESETS.contains(&self.align.speed.as_str()) {
            anyhow::bail!(
                "Unknown bowtie2 speed preset '{}' (expected one of {})",
                self.align.speed,
                SPEED_PRESETS.join(", ")
            );
        }

        if self.pileup.max_depth == 0 {
            anyhow::bail!("pileup.max_depth must be greater than 0");
        }

        if self.merge.min_copy.is_nan() || self.merge.min_copy < 0.0 {
            anyhow::bail!("merge.min_copy must be >= 0, got {}", self.merge.min_copy);
        }

        if self.merge.min_cov.is_nan() || self.merge.min_cov < 0.0 {
            anyhow::bail!("merge.min_cov must be >= 0, got {}", self.merge.min_cov);
        }

        Ok(())
    }
}
