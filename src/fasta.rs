//! Representative genome loading

use crate::error::{PipelineError, Result};
use needletail::parse_fastx_file;
use std::path::Path;

/// A single contig of a representative genome
#[derive(Debug, Clone)]
pub struct Contig {
    /// Contig id (header up to the first whitespace)
    pub id: String,
    /// Upper-cased sequence
    pub sequence: Vec<u8>,
}

/// Loaded genome with all of its contigs, in file order
#[derive(Debug, Clone)]
pub struct Genome {
    pub contigs: Vec<Contig>,
}

impl Genome {
    pub fn total_length(&self) -> usize {
        self.contigs.iter().map(|c| c.sequence.len()).sum()
    }

    pub fn num_contigs(&self) -> usize {
        self.contigs.len()
    }
}

/// Load a genome from a FASTA file (supports gzip compression).
///
/// Missing files and genomes without a single base are errors: an empty
/// genome would silently produce an empty coordinate index downstream.
pub fn load_genome(path: &Path) -> Result<Genome> {
    if !path.exists() {
        return Err(PipelineError::MissingInput(path.to_path_buf()));
    }

    let mut reader = parse_fastx_file(path).map_err(|e| PipelineError::Fasta {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    let mut contigs = Vec::new();
    while let Some(record) = reader.next() {
        let record = record.map_err(|e| PipelineError::Fasta {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        let header = String::from_utf8_lossy(record.id()).to_string();
        let id = header
            .split_whitespace()
            .next()
            .unwrap_or(&header)
            .to_string();

        contigs.push(Contig {
            id,
            sequence: record.seq().to_ascii_uppercase(),
        });
    }

    let genome = Genome { contigs };
    if genome.total_length() == 0 {
        return Err(PipelineError::EmptyGenome(path.to_path_buf()));
    }
    Ok(genome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_genome_trims_header_and_uppercases() {
        let mut fa = NamedTempFile::new().unwrap();
        write!(fa, ">c1 some description\nacgt\nNN\n>c2\nGG\n").unwrap();
        fa.flush().unwrap();

        let genome = load_genome(fa.path()).unwrap();
        assert_eq!(genome.num_contigs(), 2);
        assert_eq!(genome.contigs[0].id, "c1");
        assert_eq!(genome.contigs[0].sequence, b"ACGTNN".to_vec());
        assert_eq!(genome.total_length(), 8);
    }

    #[test]
    fn test_missing_genome_is_error() {
        let err = load_genome(Path::new("/nonexistent/genome.fna")).unwrap_err();
        assert!(matches!(err, PipelineError::MissingInput(_)));
    }
}
