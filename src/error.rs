//! Error types for the merge/format core
//!
//! Orchestration code works with `anyhow`; the core modules return
//! `PipelineError` so callers can tell data inconsistencies apart from
//! plain I/O trouble.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Input file not found: {}", .0.display())]
    MissingInput(PathBuf),

    #[error("Genome has no sequence: {}", .0.display())]
    EmptyGenome(PathBuf),

    #[error("Contig {0} appears more than once")]
    DuplicateContig(String),

    #[error("Failed to parse FASTA {}: {message}", path.display())]
    Fasta { path: PathBuf, message: String },

    #[error("Contig {contig} (line {line}) is not in the contig-to-species map")]
    UnmappedContig { contig: String, line: u64 },

    #[error("Pileup call {call} precedes reference cursor {cursor}; upstream sort order is broken")]
    OutOfOrder { cursor: String, call: String },

    #[error("Pileup call {0} lies past the end of the reference")]
    CallOutsideReference(String),

    #[error("Malformed record in {source_name} line {line}: {reason}")]
    Malformed {
        source_name: String,
        line: u64,
        reason: String,
    },

    #[error("Operation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, PipelineError>;

impl PipelineError {
    pub fn malformed(source_name: impl Into<String>, line: u64, reason: impl Into<String>) -> Self {
        PipelineError::Malformed {
            source_name: source_name.into(),
            line,
            reason: reason.into(),
        }
    }

    /// True for errors that stem from inconsistent inputs rather than I/O.
    pub fn is_data_inconsistency(&self) -> bool {
        matches!(
            self,
            PipelineError::UnmappedContig { .. }
                | PipelineError::OutOfOrder { .. }
                | PipelineError::CallOutsideReference(_)
                | PipelineError::DuplicateContig(_)
                | PipelineError::Malformed { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_message() {
        let err = PipelineError::malformed("sample.genes.gz", 12, "expected 4 fields, found 2");
        assert_eq!(
            err.to_string(),
            "Malformed record in sample.genes.gz line 12: expected 4 fields, found 2"
        );
        assert!(err.is_data_inconsistency());
    }

    #[test]
    fn test_io_is_not_inconsistency() {
        let err: PipelineError = std::io::Error::new(std::io::ErrorKind::Other, "disk").into();
        assert!(!err.is_data_inconsistency());
        assert!(!PipelineError::Cancelled.is_data_inconsistency());
    }
}
