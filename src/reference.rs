//! Reference coordinate index
//!
//! The canonical, ordered list of every base of one species' representative
//! genome. Positions are ordered by `(contig_id, position)` where contig ids
//! compare as plain strings: "10" sorts before "2". The genome database is
//! written in the same collation so the pileup stream agrees with it.

use crate::error::{PipelineError, Result};
use crate::fasta::{load_genome, Contig, Genome};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::path::Path;

/// One base of the reference genome (1-based position)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReferencePosition<'a> {
    pub contig_id: &'a str,
    pub position: u64,
    pub base: u8,
}

impl ReferencePosition<'_> {
    /// Compare against another `(contig_id, position)` key
    pub fn cmp_key(&self, contig_id: &str, position: u64) -> Ordering {
        self.contig_id
            .cmp(contig_id)
            .then(self.position.cmp(&position))
    }
}

/// Sorted contigs of one genome; iterating yields every position in order.
#[derive(Debug, Clone)]
pub struct ReferenceIndex {
    contigs: Vec<Contig>,
    length: u64,
}

impl ReferenceIndex {
    /// Build from contigs in any order. Duplicate ids are rejected; an empty
    /// contig list gives an empty index. Empty genome files are rejected
    /// earlier, by `load`.
    pub fn from_contigs(mut contigs: Vec<Contig>) -> Result<Self> {
        let mut seen = HashSet::new();
        for contig in &contigs {
            if !seen.insert(contig.id.as_str()) {
                return Err(PipelineError::DuplicateContig(contig.id.clone()));
            }
        }

        sort_contigs(&mut contigs);
        let length = contigs.iter().map(|c| c.sequence.len() as u64).sum();
        Ok(ReferenceIndex { contigs, length })
    }

    pub fn from_genome(genome: Genome) -> Result<Self> {
        Self::from_contigs(genome.contigs)
    }

    /// Load and index a representative genome FASTA
    pub fn load(path: &Path) -> Result<Self> {
        let genome = load_genome(path)?;
        let index = Self::from_genome(genome)?;
        log::debug!(
            "Indexed {} ({} contigs, {} bp)",
            path.display(),
            index.contigs.len(),
            index.length
        );
        Ok(index)
    }

    /// Number of reference positions
    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn iter(&self) -> impl Iterator<Item = ReferencePosition<'_>> {
        self.contigs.iter().flat_map(|contig| {
            contig
                .sequence
                .iter()
                .enumerate()
                .map(move |(i, &base)| ReferencePosition {
                    contig_id: contig.id.as_str(),
                    position: i as u64 + 1,
                    base,
                })
        })
    }
}

/// Order contigs by id, compared as strings.
pub fn sort_contigs(contigs: &mut [Contig]) {
    contigs.sort_by(|a, b| a.id.cmp(&b.id));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contig(id: &str, seq: &str) -> Contig {
        Contig {
            id: id.to_string(),
            sequence: seq.as_bytes().to_vec(),
        }
    }

    #[test]
    fn test_positions_in_string_order() {
        let index =
            ReferenceIndex::from_contigs(vec![contig("2", "AC"), contig("10", "G")]).unwrap();
        let keys: Vec<(String, u64, char)> = index
            .iter()
            .map(|p| (p.contig_id.to_string(), p.position, p.base as char))
            .collect();

        // "10" < "2" as strings
        assert_eq!(
            keys,
            vec![
                ("10".to_string(), 1, 'G'),
                ("2".to_string(), 1, 'A'),
                ("2".to_string(), 2, 'C'),
            ]
        );
        assert_eq!(index.len(), 3);
    }

    #[test]
    fn test_duplicate_contig_rejected() {
        let err = ReferenceIndex::from_contigs(vec![contig("c1", "A"), contig("c1", "C")])
            .unwrap_err();
        assert!(matches!(err, PipelineError::DuplicateContig(id) if id == "c1"));
    }

    #[test]
    fn test_empty_contig_list_gives_empty_index() {
        let index = ReferenceIndex::from_contigs(Vec::new()).unwrap();
        assert_eq!(index.len(), 0);
        assert_eq!(index.iter().count(), 0);
    }

    #[test]
    fn test_load_rejects_empty_genome() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("genome.fna");
        std::fs::write(&path, ">c1\n").unwrap();
        let err = ReferenceIndex::load(&path).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::EmptyGenome(_) | PipelineError::Fasta { .. }
        ));
    }

    #[test]
    fn test_cmp_key() {
        let pos = ReferencePosition {
            contig_id: "c1",
            position: 5,
            base: b'A',
        };
        assert_eq!(pos.cmp_key("c1", 5), Ordering::Equal);
        assert_eq!(pos.cmp_key("c1", 9), Ordering::Less);
        assert_eq!(pos.cmp_key("c0", 9), Ordering::Greater);
    }
}
