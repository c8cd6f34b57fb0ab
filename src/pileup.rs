//! samtools mpileup line parsing
//!
//! Turns one mpileup record into a per-position call with A/T/C/G counts,
//! depth, reference frequency and the dominant alternative allele.

use crate::error::{PipelineError, Result};
use crate::io::fmt_float;
use std::fmt;

/// Count order used in the `count_atcg` column
pub const BASE_ORDER: [u8; 4] = [b'A', b'T', b'C', b'G'];

/// Variant call at one covered reference position
#[derive(Debug, Clone, PartialEq)]
pub struct PileupCall {
    pub ref_id: String,
    /// 1-based position
    pub ref_pos: u64,
    pub ref_allele: u8,
    /// Most frequent non-reference base, `None` when no read disagrees
    pub alt_allele: Option<u8>,
    pub ref_freq: f64,
    pub depth: u32,
    /// A, T, C, G counts
    pub counts: [u32; 4],
}

fn base_slot(base: u8) -> Option<usize> {
    BASE_ORDER.iter().position(|&b| b == base)
}

/// Count A/T/C/G occurrences in an mpileup read-base column.
///
/// `.` and `,` are reference matches, `^` is followed by a mapping-quality
/// character, `+n`/`-n` introduce n inserted/deleted bases that belong to
/// the next position and are skipped.
pub fn count_bases(ref_base: u8, bases: &str) -> [u32; 4] {
    let mut counts = [0u32; 4];
    let bytes = bases.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        match c {
            b'^' => {
                i += 2;
                continue;
            }
            b'+' | b'-' => {
                let start = i + 1;
                let mut end = start;
                while end < bytes.len() && bytes[end].is_ascii_digit() {
                    end += 1;
                }
                let len: usize = bases[start..end].parse().unwrap_or(0);
                i = end + len;
                continue;
            }
            b'$' | b'*' | b'<' | b'>' => {}
            b'.' | b',' => {
                if let Some(slot) = base_slot(ref_base) {
                    counts[slot] += 1;
                }
            }
            _ => {
                if let Some(slot) = base_slot(c.to_ascii_uppercase()) {
                    counts[slot] += 1;
                }
            }
        }
        i += 1;
    }

    counts
}

/// Parse one mpileup line: `contig pos ref depth bases quals`.
pub fn parse_mpileup_line(line: &str, source_name: &str, line_no: u64) -> Result<PileupCall> {
    let fields: Vec<&str> = line.split('\t').collect();
    if fields.len() < 5 {
        return Err(PipelineError::malformed(
            source_name,
            line_no,
            format!("expected at least 5 mpileup fields, found {}", fields.len()),
        ));
    }

    let ref_pos: u64 = fields[1].parse().map_err(|_| {
        PipelineError::malformed(source_name, line_no, format!("invalid position '{}'", fields[1]))
    })?;
    if ref_pos == 0 {
        return Err(PipelineError::malformed(source_name, line_no, "position 0 in 1-based pileup"));
    }

    let ref_allele = fields[2]
        .bytes()
        .next()
        .map(|b| b.to_ascii_uppercase())
        .ok_or_else(|| PipelineError::malformed(source_name, line_no, "empty reference base"))?;

    let counts = count_bases(ref_allele, fields[4]);
    Ok(PileupCall::from_counts(fields[0].to_string(), ref_pos, ref_allele, counts))
}

impl PileupCall {
    /// Derive depth, reference frequency and alternative allele from counts
    pub fn from_counts(ref_id: String, ref_pos: u64, ref_allele: u8, counts: [u32; 4]) -> Self {
        let depth: u32 = counts.iter().sum();
        let ref_slot = base_slot(ref_allele);

        let ref_freq = match ref_slot {
            Some(slot) if depth > 0 => counts[slot] as f64 / depth as f64,
            _ => 0.0,
        };

        // First maximum in A,T,C,G order wins ties
        let mut alt: Option<(u8, u32)> = None;
        for (slot, &count) in counts.iter().enumerate() {
            if Some(slot) == ref_slot || count == 0 {
                continue;
            }
            if alt.map(|(_, best)| count > best).unwrap_or(true) {
                alt = Some((BASE_ORDER[slot], count));
            }
        }

        PileupCall {
            ref_id,
            ref_pos,
            ref_allele,
            alt_allele: alt.map(|(b, _)| b),
            ref_freq,
            depth,
            counts,
        }
    }
}

/// Renders the `ref_id .. count_atcg` profile columns
impl fmt::Display for PileupCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let alt = match self.alt_allele {
            Some(b) => (b as char).to_string(),
            None => "NA".to_string(),
        };
        write!(
            f,
            "{}\t{}\t{}\t{}\t{}\t{}\t{},{},{},{}",
            self.ref_id,
            self.ref_pos,
            self.ref_allele as char,
            alt,
            fmt_float(self.ref_freq),
            self.depth,
            self.counts[0],
            self.counts[1],
            self.counts[2],
            self.counts[3]
        )
    }
}
