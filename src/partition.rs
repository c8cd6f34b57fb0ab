//! Contig-to-species map and per-species pileup partitioning
//!
//! The combined pileup covers every species in the genome database. One
//! forward pass routes each line to its species' partition file, keeping the
//! order of the combined stream within every destination.

use crate::cancel::CancelToken;
use crate::error::{PipelineError, Result};
use crate::io::{open_text, StagedOutput};
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

/// Lines between two cancellation checks
const CANCEL_CHECK_INTERVAL: u64 = 1 << 16;

/// Mapping from sequence (contig) id to owning species id
#[derive(Debug, Clone, Default)]
pub struct ContigSpeciesMap {
    map: HashMap<String, String>,
}

impl ContigSpeciesMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a contig. A contig cannot belong to two species.
    pub fn insert(&mut self, contig_id: &str, species_id: &str) -> Result<()> {
        if self.map.contains_key(contig_id) {
            return Err(PipelineError::DuplicateContig(contig_id.to_string()));
        }
        self.map.insert(contig_id.to_string(), species_id.to_string());
        Ok(())
    }

    /// Read a `ref_id<TAB>species_id` file (no header)
    pub fn read(path: &Path) -> Result<Self> {
        let reader = open_text(path)?;
        let source = path.display().to_string();
        let mut map = ContigSpeciesMap::new();

        for (i, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() != 2 {
                return Err(PipelineError::malformed(
                    source.as_str(),
                    i as u64 + 1,
                    format!("expected ref_id and species_id, found {} fields", fields.len()),
                ));
            }
            map.insert(fields[0], fields[1])?;
        }
        Ok(map)
    }

    pub fn write<W: Write>(&self, out: &mut W) -> Result<()> {
        let mut entries: Vec<(&String, &String)> = self.map.iter().collect();
        entries.sort();
        for (contig, species) in entries {
            writeln!(out, "{}\t{}", contig, species)?;
        }
        Ok(())
    }

    pub fn species_of(&self, contig_id: &str) -> Option<&str> {
        self.map.get(contig_id).map(String::as_str)
    }

    /// Distinct species ids, sorted
    pub fn species_ids(&self) -> BTreeSet<&str> {
        self.map.values().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Partition file path for a species
pub fn partition_path(dir: &Path, species_id: &str) -> PathBuf {
    dir.join(format!("{}.mpileup.gz", species_id))
}

/// Line counts written per species
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionSummary {
    pub lines_per_species: BTreeMap<String, u64>,
    pub total_lines: u64,
}

/// Owned set of open per-species outputs.
///
/// Outputs are staged; `commit` publishes all of them, while dropping the
/// sinks on any error path discards every partially written partition.
struct PartitionSinks {
    dir: PathBuf,
    sinks: HashMap<String, StagedOutput>,
}

impl PartitionSinks {
    fn new(dir: &Path) -> Self {
        PartitionSinks {
            dir: dir.to_path_buf(),
            sinks: HashMap::new(),
        }
    }

    fn sink_for(&mut self, species_id: &str) -> Result<&mut StagedOutput> {
        match self.sinks.entry(species_id.to_string()) {
            Entry::Occupied(e) => Ok(e.into_mut()),
            Entry::Vacant(e) => {
                let out = StagedOutput::create(&partition_path(&self.dir, species_id))?;
                Ok(e.insert(out))
            }
        }
    }

    /// Publish every partition. Species of the map that received no line
    /// get an empty partition so the formatter sees every species.
    fn commit<'a>(mut self, all_species: impl Iterator<Item = &'a str>) -> Result<()> {
        for species_id in all_species {
            self.sink_for(species_id)?;
        }
        for (_, sink) in self.sinks.drain() {
            sink.commit()?;
        }
        Ok(())
    }
}

/// Route every line of `input` to `<out_dir>/<species>.mpileup.gz`.
///
/// The first whitespace-delimited field of each line is its contig id; a
/// contig missing from `map` is fatal, never silently dropped.
pub fn partition_pileup<R: BufRead>(
    input: R,
    map: &ContigSpeciesMap,
    out_dir: &Path,
    cancel: &CancelToken,
) -> Result<PartitionSummary> {
    std::fs::create_dir_all(out_dir)?;

    let mut sinks = PartitionSinks::new(out_dir);
    let mut summary = PartitionSummary::default();

    for (i, line) in input.lines().enumerate() {
        let line = line?;
        let line_no = i as u64 + 1;

        let contig = line.split_whitespace().next().ok_or_else(|| {
            PipelineError::malformed("combined pileup", line_no, "empty pileup line")
        })?;
        let species_id = map
            .species_of(contig)
            .ok_or_else(|| PipelineError::UnmappedContig {
                contig: contig.to_string(),
                line: line_no,
            })?;

        let sink = sinks.sink_for(species_id)?;
        sink.write_all(line.as_bytes())?;
        sink.write_all(b"\n")?;

        *summary
            .lines_per_species
            .entry(species_id.to_string())
            .or_insert(0) += 1;
        summary.total_lines += 1;

        if line_no % CANCEL_CHECK_INTERVAL == 0 {
            cancel.check()?;
        }
    }

    cancel.check()?;
    sinks.commit(map.species_ids().into_iter())?;
    Ok(summary)
}
