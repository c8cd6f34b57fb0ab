//! Header-keyed reader for tab- or whitespace-delimited text tables

use crate::error::{PipelineError, Result};
use crate::io::open_text;
use std::collections::HashMap;
use std::io::BufRead;
use std::path::Path;

/// Column separator of a table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delimiter {
    Tab,
    Whitespace,
}

impl Delimiter {
    fn split<'a>(&self, line: &'a str) -> Vec<&'a str> {
        match self {
            Delimiter::Tab => line.split('\t').collect(),
            Delimiter::Whitespace => line.split_whitespace().collect(),
        }
    }
}

/// Streaming table reader: the first line is the header, every following
/// line must carry exactly as many fields.
pub struct TableReader<R> {
    source_name: String,
    header: Vec<String>,
    index: HashMap<String, usize>,
    reader: R,
    delimiter: Delimiter,
    line_no: u64,
    buf: String,
}

impl TableReader<Box<dyn BufRead + Send>> {
    pub fn open(path: &Path, delimiter: Delimiter) -> Result<Self> {
        let reader = open_text(path)?;
        TableReader::new(reader, path.display().to_string(), delimiter)
    }
}

impl<R: BufRead> TableReader<R> {
    pub fn new(mut reader: R, source_name: String, delimiter: Delimiter) -> Result<Self> {
        let mut buf = String::new();
        if reader.read_line(&mut buf)? == 0 {
            return Err(PipelineError::malformed(source_name, 1, "missing header line"));
        }

        let header: Vec<String> = delimiter
            .split(buf.trim_end_matches(['\n', '\r']))
            .into_iter()
            .map(str::to_string)
            .collect();
        let index = header
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();

        Ok(TableReader {
            source_name,
            header,
            index,
            reader,
            delimiter,
            line_no: 1,
            buf,
        })
    }

    pub fn column(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// Index of the first column present among `names` (aliases in priority order).
    pub fn require_any(&self, names: &[&str]) -> Result<usize> {
        names
            .iter()
            .find_map(|n| self.column(n))
            .ok_or_else(|| {
                PipelineError::malformed(
                    self.source_name.clone(),
                    1,
                    format!("missing required column {}", names.join(" / ")),
                )
            })
    }

    pub fn require(&self, name: &str) -> Result<usize> {
        self.require_any(&[name])
    }

    /// Next record, or `None` at end of input. Blank lines are skipped.
    pub fn next_record(&mut self) -> Option<Result<Vec<String>>> {
        loop {
            self.buf.clear();
            match self.reader.read_line(&mut self.buf) {
                Ok(0) => return None,
                Ok(_) => {}
                Err(e) => return Some(Err(e.into())),
            }
            self.line_no += 1;

            let line = self.buf.trim_end_matches(['\n', '\r']);
            if line.trim().is_empty() {
                continue;
            }

            let fields = self.delimiter.split(line);
            if fields.len() != self.header.len() {
                return Some(Err(PipelineError::malformed(
                    self.source_name.clone(),
                    self.line_no,
                    format!("expected {} fields, found {}", self.header.len(), fields.len()),
                )));
            }
            return Some(Ok(fields.into_iter().map(str::to_string).collect()));
        }
    }

    /// Parse a numeric field, reporting the column and line on failure.
    pub fn parse_f64(&self, record: &[String], col: usize) -> Result<f64> {
        record[col].parse::<f64>().map_err(|_| {
            PipelineError::malformed(
                self.source_name.clone(),
                self.line_no,
                format!("non-numeric {} value '{}'", self.header[col], record[col]),
            )
        })
    }

    pub fn parse_u64(&self, record: &[String], col: usize) -> Result<u64> {
        record[col].parse::<u64>().map_err(|_| {
            PipelineError::malformed(
                self.source_name.clone(),
                self.line_no,
                format!("non-integer {} value '{}'", self.header[col], record[col]),
            )
        })
    }
}
