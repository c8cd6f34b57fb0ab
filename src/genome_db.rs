//! Combined genome database of the selected species
//!
//! Concatenates the representative genome of every species into one FASTA
//! for the aligner and records which species owns each contig.

use crate::error::{PipelineError, Result};
use crate::fasta::load_genome;
use crate::io::StagedOutput;
use crate::partition::ContigSpeciesMap;
use crate::reference::sort_contigs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// A species and the location of its representative genome
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Species {
    pub id: String,
    pub rep_genome: PathBuf,
}

impl Species {
    /// Locate `<db>/rep_genomes/<id>/genome.fna`, falling back to `genome.fna.gz`
    pub fn resolve(db_dir: &Path, id: &str) -> Result<Self> {
        let dir = db_dir.join("rep_genomes").join(id);
        let plain = dir.join("genome.fna");
        let gzipped = dir.join("genome.fna.gz");

        let rep_genome = if plain.exists() {
            plain
        } else if gzipped.exists() {
            gzipped
        } else {
            return Err(PipelineError::MissingInput(plain));
        };

        Ok(Species {
            id: id.to_string(),
            rep_genome,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GenomeDbStats {
    pub species: usize,
    pub contigs: usize,
    pub bases: u64,
}

/// Write the combined FASTA and the `ref_id<TAB>species_id` contig map.
///
/// Contigs of each species are written sorted by id so the alignment (and
/// therefore the pileup) visits them in reference index order.
pub fn build_genome_db(species: &[Species], fasta: &Path, map_path: &Path) -> Result<GenomeDbStats> {
    let mut fa_out = StagedOutput::create(fasta)?;
    let mut map = ContigSpeciesMap::new();
    let mut stats = GenomeDbStats::default();

    for sp in species {
        let mut genome = load_genome(&sp.rep_genome)?;
        sort_contigs(&mut genome.contigs);

        for contig in &genome.contigs {
            map.insert(&contig.id, &sp.id)?;
            writeln!(fa_out, ">{}", contig.id)?;
            for chunk in contig.sequence.chunks(80) {
                fa_out.write_all(chunk)?;
                writeln!(fa_out)?;
            }
        }

        stats.species += 1;
        stats.contigs += genome.num_contigs();
        stats.bases += genome.total_length() as u64;
    }

    let mut map_out = StagedOutput::create(map_path)?;
    map.write(&mut map_out)?;

    fa_out.commit()?;
    map_out.commit()?;

    log::info!(
        "Genome database: {} species, {} contigs, {} bp",
        stats.species,
        stats.contigs,
        stats.bases
    );
    Ok(stats)
}
