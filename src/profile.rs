//! Merge-fill formatting of per-species variant profiles
//!
//! The pileup tool only reports covered positions. `MergeFill` walks the
//! reference index and the sparse, ordered call stream side by side and
//! emits exactly one row per reference position: the call itself where one
//! exists, a no-coverage placeholder everywhere else.

use crate::cancel::CancelToken;
use crate::error::{PipelineError, Result};
use crate::io::{open_text, StagedOutput};
use crate::pileup::{parse_mpileup_line, PileupCall};
use crate::reference::{ReferenceIndex, ReferencePosition};
use std::cmp::Ordering;
use std::fmt;
use std::io::{BufRead, Write};
use std::path::Path;

/// Header of the variant profile file
pub const PROFILE_FIELDS: [&str; 7] = [
    "ref_id",
    "ref_pos",
    "ref_allele",
    "alt_allele",
    "ref_freq",
    "depth",
    "count_atcg",
];

/// Rows between two cancellation checks
const CANCEL_CHECK_INTERVAL: u64 = 1 << 16;

/// One row of a variant profile
#[derive(Debug, Clone, PartialEq)]
pub enum ProfileRow<'a> {
    /// A call from the pileup stream, emitted verbatim
    Call(PileupCall),
    /// Position without any aligned read
    NoCoverage(ReferencePosition<'a>),
}

impl fmt::Display for ProfileRow<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProfileRow::Call(call) => write!(f, "{}", call),
            ProfileRow::NoCoverage(pos) => write!(
                f,
                "{}\t{}\t{}\tNA\t0.0\t0\t0,0,0,0",
                pos.contig_id, pos.position, pos.base as char
            ),
        }
    }
}

/// Streaming merge-join of a dense reference against a sparse call stream.
///
/// State is the reference cursor plus at most one pending call. A call
/// whose key sorts before the cursor, or that remains once the reference is
/// exhausted, is a fatal ordering error; after any error the iterator is
/// fused.
pub struct MergeFill<'a, R, C> {
    reference: R,
    calls: C,
    pending: Option<PileupCall>,
    calls_done: bool,
    failed: bool,
    _marker: std::marker::PhantomData<&'a ()>,
}

impl<'a, R, C> MergeFill<'a, R, C>
where
    R: Iterator<Item = ReferencePosition<'a>>,
    C: Iterator<Item = Result<PileupCall>>,
{
    pub fn new(reference: R, calls: C) -> Self {
        MergeFill {
            reference,
            calls,
            pending: None,
            calls_done: false,
            failed: false,
            _marker: std::marker::PhantomData,
        }
    }

    fn fail(&mut self, err: PipelineError) -> Option<Result<ProfileRow<'a>>> {
        self.failed = true;
        Some(Err(err))
    }
}

impl<'a, R, C> Iterator for MergeFill<'a, R, C>
where
    R: Iterator<Item = ReferencePosition<'a>>,
    C: Iterator<Item = Result<PileupCall>>,
{
    type Item = Result<ProfileRow<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }

        if self.pending.is_none() && !self.calls_done {
            match self.calls.next() {
                Some(Ok(call)) => self.pending = Some(call),
                Some(Err(e)) => return self.fail(e),
                None => self.calls_done = true,
            }
        }

        let Some(pos) = self.reference.next() else {
            return match self.pending.take() {
                Some(call) => self.fail(PipelineError::CallOutsideReference(format!(
                    "{}:{}",
                    call.ref_id, call.ref_pos
                ))),
                None => None,
            };
        };

        let Some(call) = self.pending.as_ref() else {
            return Some(Ok(ProfileRow::NoCoverage(pos)));
        };

        match pos.cmp_key(&call.ref_id, call.ref_pos) {
            Ordering::Less => Some(Ok(ProfileRow::NoCoverage(pos))),
            Ordering::Equal => self.pending.take().map(|call| Ok(ProfileRow::Call(call))),
            Ordering::Greater => {
                let err = PipelineError::OutOfOrder {
                    cursor: format!("{}:{}", pos.contig_id, pos.position),
                    call: format!("{}:{}", call.ref_id, call.ref_pos),
                };
                self.fail(err)
            }
        }
    }
}

/// Counts reported after formatting one species
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FormatStats {
    pub rows: u64,
    pub calls: u64,
}

/// Write the header and every merge-fill row; stops at the first error.
pub fn write_profile<'a, I, W>(rows: I, out: &mut W, cancel: &CancelToken) -> Result<FormatStats>
where
    I: Iterator<Item = Result<ProfileRow<'a>>>,
    W: Write,
{
    writeln!(out, "{}", PROFILE_FIELDS.join("\t"))?;

    let mut stats = FormatStats::default();
    for row in rows {
        let row = row?;
        if let ProfileRow::Call(_) = row {
            stats.calls += 1;
        }
        writeln!(out, "{}", row)?;
        stats.rows += 1;

        if stats.rows % CANCEL_CHECK_INTERVAL == 0 {
            cancel.check()?;
        }
    }
    Ok(stats)
}

/// Adapt an mpileup reader into a call stream
pub fn mpileup_calls<R: BufRead>(
    reader: R,
    source_name: String,
) -> impl Iterator<Item = Result<PileupCall>> {
    reader.lines().enumerate().map(move |(i, line)| {
        let line = line?;
        parse_mpileup_line(&line, &source_name, i as u64 + 1)
    })
}

/// Format one species: merge its partitioned pileup against its reference
/// and persist the profile. The output only appears under `output` once
/// every row has been written.
pub fn format_species(
    reference: &ReferenceIndex,
    partition: &Path,
    output: &Path,
    cancel: &CancelToken,
) -> Result<FormatStats> {
    cancel.check()?;

    let reader = open_text(partition)?;
    let calls = mpileup_calls(reader, partition.display().to_string());
    let rows = MergeFill::new(reference.iter(), calls);

    let mut out = StagedOutput::create(output)?;
    let stats = write_profile(rows, &mut out, cancel)?;
    cancel.check()?;
    out.commit()?;
    Ok(stats)
}
