//! Per-species coverage summary computed from a persisted variant profile

use crate::error::Result;
use crate::io::fmt_float;
use crate::table::{Delimiter, TableReader};
use std::io::{BufRead, Write};
use std::path::Path;

pub const SUMMARY_FIELDS: [&str; 5] = [
    "species_id",
    "genome_length",
    "covered_bases",
    "fraction_covered",
    "mean_coverage",
];

/// Coverage statistics of one species
#[derive(Debug, Clone, PartialEq)]
pub struct SpeciesSummary {
    pub species_id: String,
    /// Number of profile rows (reference positions)
    pub genome_length: u64,
    /// Rows with depth > 0
    pub covered_bases: u64,
    /// covered_bases / genome_length, 0 for an empty profile
    pub fraction_covered: f64,
    /// Mean depth over covered bases, 0 when nothing is covered
    pub mean_coverage: f64,
}

impl SpeciesSummary {
    pub fn from_counts(species_id: &str, genome_length: u64, covered_bases: u64, total_depth: u64) -> Self {
        let fraction_covered = if genome_length > 0 {
            covered_bases as f64 / genome_length as f64
        } else {
            0.0
        };
        let mean_coverage = if covered_bases > 0 {
            total_depth as f64 / covered_bases as f64
        } else {
            0.0
        };

        SpeciesSummary {
            species_id: species_id.to_string(),
            genome_length,
            covered_bases,
            fraction_covered,
            mean_coverage,
        }
    }
}

/// Aggregate a profile table from any reader
pub fn summarize_reader<R: BufRead>(species_id: &str, table: &mut TableReader<R>) -> Result<SpeciesSummary> {
    let depth_col = table.require("depth")?;

    let mut genome_length = 0u64;
    let mut covered_bases = 0u64;
    let mut total_depth = 0u64;

    while let Some(record) = table.next_record() {
        let record = record?;
        let depth = table.parse_u64(&record, depth_col)?;
        genome_length += 1;
        if depth > 0 {
            covered_bases += 1;
            total_depth += depth;
        }
    }

    Ok(SpeciesSummary::from_counts(species_id, genome_length, covered_bases, total_depth))
}

/// Re-read a finished `<species>.snps.gz` profile and summarise it
pub fn summarize_profile(species_id: &str, profile: &Path) -> Result<SpeciesSummary> {
    let mut table = TableReader::open(profile, Delimiter::Tab)?;
    summarize_reader(species_id, &mut table)
}

/// Write summary rows sorted by species id
pub fn write_summaries<W: Write>(summaries: &[SpeciesSummary], out: &mut W) -> Result<()> {
    writeln!(out, "{}", SUMMARY_FIELDS.join("\t"))?;

    let mut sorted: Vec<&SpeciesSummary> = summaries.iter().collect();
    sorted.sort_by(|a, b| a.species_id.cmp(&b.species_id));

    for s in sorted {
        writeln!(
            out,
            "{}\t{}\t{}\t{}\t{}",
            s.species_id,
            s.genome_length,
            s.covered_bases,
            fmt_float(s.fraction_covered),
            fmt_float(s.mean_coverage)
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::io::Cursor;

    fn table(text: &str) -> TableReader<Cursor<Vec<u8>>> {
        TableReader::new(Cursor::new(text.as_bytes().to_vec()), "profile".into(), Delimiter::Tab)
            .unwrap()
    }

    const HEADER: &str = "ref_id\tref_pos\tref_allele\talt_allele\tref_freq\tdepth\tcount_atcg\n";

    #[test]
    fn test_three_position_profile() {
        let text = format!(
            "{}c1\t1\tA\tNA\t0.0\t0\t0,0,0,0\nc1\t2\tC\tT\t0.8\t5\t0,1,4,0\nc1\t3\tG\tNA\t0.0\t0\t0,0,0,0\n",
            HEADER
        );
        let summary = summarize_reader("sp1", &mut table(&text)).unwrap();

        assert_eq!(summary.genome_length, 3);
        assert_eq!(summary.covered_bases, 1);
        assert_relative_eq!(summary.fraction_covered, 1.0 / 3.0);
        assert_relative_eq!(summary.mean_coverage, 5.0);
    }

    #[test]
    fn test_no_coverage_has_defined_values() {
        let text = format!("{}c1\t1\tA\tNA\t0.0\t0\t0,0,0,0\n", HEADER);
        let summary = summarize_reader("sp1", &mut table(&text)).unwrap();
        assert_eq!(summary.covered_bases, 0);
        assert_eq!(summary.fraction_covered, 0.0);
        assert_eq!(summary.mean_coverage, 0.0);

        let empty = SpeciesSummary::from_counts("sp0", 0, 0, 0);
        assert_eq!(empty.fraction_covered, 0.0);
    }

    #[test]
    fn test_non_numeric_depth_is_fatal() {
        let text = format!("{}c1\t1\tA\tNA\t0.0\tdeep\t0,0,0,0\n", HEADER);
        assert!(summarize_reader("sp1", &mut table(&text)).is_err());
    }

    #[test]
    fn test_write_sorted() {
        let summaries = vec![
            SpeciesSummary::from_counts("sp2", 4, 2, 6),
            SpeciesSummary::from_counts("sp1", 3, 1, 5),
        ];
        let mut buf = Vec::new();
        write_summaries(&summaries, &mut buf).unwrap();
        assert_eq!(
            String::from_utf8(buf).unwrap(),
            "species_id\tgenome_length\tcovered_bases\tfraction_covered\tmean_coverage\n\
             sp1\t3\t1\t0.3333333333333333\t5.0\n\
             sp2\t4\t2\t0.5\t3.0\n"
        );
    }
}
