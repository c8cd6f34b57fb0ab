//! Gzip-aware readers and staged (commit-or-discard) output files

use crate::error::{PipelineError, Result};
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::TempPath;

/// True when the path carries a `.gz` extension
pub fn is_gzip(path: &Path) -> bool {
    path.extension().map(|e| e == "gz").unwrap_or(false)
}

/// Open a text file for line reading, transparently decompressing `.gz`.
///
/// A missing file is reported as `MissingInput` so callers never mistake it
/// for an empty dataset.
pub fn open_text(path: &Path) -> Result<Box<dyn BufRead + Send>> {
    let file = File::open(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => PipelineError::MissingInput(path.to_path_buf()),
        _ => PipelineError::Io(e),
    })?;

    if is_gzip(path) {
        Ok(Box::new(BufReader::new(MultiGzDecoder::new(BufReader::new(file)))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

enum Sink {
    Plain(BufWriter<File>),
    Gzip(GzEncoder<BufWriter<File>>),
}

impl Write for Sink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Sink::Plain(w) => w.write(buf),
            Sink::Gzip(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Sink::Plain(w) => w.flush(),
            Sink::Gzip(w) => w.flush(),
        }
    }
}

impl Sink {
    fn finish(self) -> io::Result<()> {
        match self {
            Sink::Plain(mut w) => w.flush(),
            Sink::Gzip(w) => w.finish()?.flush(),
        }
    }
}

/// Output written to a hidden temporary next to its destination.
///
/// `commit` flushes and renames it into place. Dropping without committing
/// removes the temporary, so a failed or cancelled writer never leaves a
/// truncated file under the final name.
pub struct StagedOutput {
    sink: Sink,
    temp_path: TempPath,
    dest: PathBuf,
}

impl StagedOutput {
    pub fn create(dest: &Path) -> Result<Self> {
        let dir = match dest.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let temp = tempfile::Builder::new()
            .prefix(".panprofile-")
            .suffix(".partial")
            .tempfile_in(&dir)?;
        let (file, temp_path) = temp.into_parts();

        let writer = BufWriter::new(file);
        let sink = if is_gzip(dest) {
            Sink::Gzip(GzEncoder::new(writer, Compression::default()))
        } else {
            Sink::Plain(writer)
        };

        Ok(StagedOutput {
            sink,
            temp_path,
            dest: dest.to_path_buf(),
        })
    }

    /// Finish compression, flush and atomically move onto the destination.
    pub fn commit(self) -> Result<PathBuf> {
        let StagedOutput {
            sink,
            temp_path,
            dest,
        } = self;
        sink.finish()?;
        temp_path.persist(&dest).map_err(|e| PipelineError::Io(e.error))?;
        Ok(dest)
    }
}

impl Write for StagedOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.sink.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.sink.flush()
    }
}

/// Render a float the way the profile and matrix files expect: integral
/// values keep one decimal (`5.0`), everything else uses the shortest
/// round-trip representation.
pub fn fmt_float(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 {
        format!("{:.1}", value)
    } else {
        format!("{}", value)
    }
}
