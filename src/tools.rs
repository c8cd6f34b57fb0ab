//! External aligner and pileup tool invocation
//!
//! bowtie2 and samtools run as subprocesses. Each call returns the rendered
//! command line for the run log; stderr of every tool goes to a file under
//! the log directory and its tail is quoted when the tool fails.

use crate::config::{AlignOptions, PileupOptions, ToolPaths};
use crate::io::StagedOutput;
use anyhow::{Context, Result};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};

/// Lines of tool stderr quoted in error messages
const STDERR_TAIL_LINES: usize = 10;

/// Reads to align: single-end (`m1`) or paired-end (`m1` + `m2`)
#[derive(Debug, Clone)]
pub struct ReadInput {
    pub m1: PathBuf,
    pub m2: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadsFormat {
    Fasta,
    Fastq,
}

/// Guess the reads format from the file name, ignoring compression suffixes
pub fn detect_reads_format(path: &Path) -> ReadsFormat {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("")
        .to_lowercase();
    let name = name
        .strip_suffix(".gz")
        .or_else(|| name.strip_suffix(".bz2"))
        .unwrap_or(&name);

    if name.ends_with(".fa") || name.ends_with(".fasta") || name.ends_with(".fna") {
        ReadsFormat::Fasta
    } else {
        ReadsFormat::Fastq
    }
}

/// Render a command the way it would be typed in a shell
fn render(cmd: &Command) -> String {
    std::iter::once(cmd.get_program())
        .chain(cmd.get_args())
        .map(|a| a.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

fn stderr_tail(path: &Path) -> String {
    let text = std::fs::read_to_string(path).unwrap_or_default();
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("\n")
}

/// Kill a child that is no longer needed and collect its exit status
fn reap(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

/// Copy a child's stdout into `out`, then wait for it. A failed write kills
/// the child, which would otherwise block on a pipe nobody reads.
fn drain_into<W: Write>(child: &mut Child, out: &mut W, command: &str) -> Result<ExitStatus> {
    let mut stdout = child
        .stdout
        .take()
        .with_context(|| format!("stdout of {} was not captured", command))?;

    if let Err(e) = std::io::copy(&mut stdout, out) {
        drop(stdout);
        reap(child);
        return Err(e).with_context(|| format!("Failed to write output of {}", command));
    }
    child
        .wait()
        .with_context(|| format!("{} did not exit", command))
}

pub struct Toolchain {
    paths: ToolPaths,
    log_dir: PathBuf,
}

impl Toolchain {
    pub fn new(paths: ToolPaths, log_dir: &Path) -> Self {
        Toolchain {
            paths,
            log_dir: log_dir.to_path_buf(),
        }
    }

    fn stderr_file(&self, name: &str) -> Result<(Stdio, PathBuf)> {
        std::fs::create_dir_all(&self.log_dir)
            .with_context(|| format!("Failed to create {}", self.log_dir.display()))?;
        let path = self.log_dir.join(format!("{}.stderr", name));
        let file = File::create(&path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        Ok((Stdio::from(file), path))
    }

    fn check(&self, status: ExitStatus, command: &str, stderr: &Path) -> Result<()> {
        if !status.success() {
            anyhow::bail!(
                "Command failed ({}): {}\n{}",
                status,
                command,
                stderr_tail(stderr)
            );
        }
        Ok(())
    }

    /// Run a single command to completion
    fn run(&self, mut cmd: Command, name: &str) -> Result<String> {
        let rendered = render(&cmd);
        log::info!("command: {}", rendered);

        let (stderr, stderr_path) = self.stderr_file(name)?;
        let status = cmd
            .stdout(Stdio::null())
            .stderr(stderr)
            .status()
            .with_context(|| format!("Failed to run {}", rendered))?;
        self.check(status, &rendered, &stderr_path)?;
        Ok(rendered)
    }

    /// `bowtie2-build <fasta> <prefix>`
    pub fn build_index(&self, fasta: &Path, prefix: &Path) -> Result<String> {
        let mut cmd = Command::new(&self.paths.bowtie2_build);
        cmd.arg(fasta).arg(prefix);
        self.run(cmd, "bowtie2-build")
    }

    /// `bowtie2 ... | samtools view -b - | samtools sort -o <bam> -`
    pub fn align(
        &self,
        index_prefix: &Path,
        reads: &ReadInput,
        opts: &AlignOptions,
        threads: usize,
        bam: &Path,
    ) -> Result<String> {
        let mut bowtie2 = Command::new(&self.paths.bowtie2);
        bowtie2.arg("--no-unal").arg("-x").arg(index_prefix);
        if let Some(max_reads) = opts.max_reads {
            bowtie2.arg("-u").arg(max_reads.to_string());
        }
        if let Some(trim) = opts.trim {
            bowtie2.arg("--trim3").arg(trim.to_string());
        }
        bowtie2
            .arg(format!("--{}", opts.speed))
            .arg("--threads")
            .arg(threads.to_string());
        bowtie2.arg(match detect_reads_format(&reads.m1) {
            ReadsFormat::Fasta => "-f",
            ReadsFormat::Fastq => "-q",
        });
        match &reads.m2 {
            Some(m2) => {
                bowtie2.arg("-1").arg(&reads.m1).arg("-2").arg(m2);
            }
            None => {
                bowtie2.arg("-U").arg(&reads.m1);
            }
        }

        let mut view = Command::new(&self.paths.samtools);
        view.args(["view", "-b", "-"]);
        let mut sort = Command::new(&self.paths.samtools);
        sort.args(["sort", "-o"]).arg(bam).arg("-");

        let rendered = format!("{} | {} | {}", render(&bowtie2), render(&view), render(&sort));
        log::info!("command: {}", rendered);

        let (bt2_err, bt2_err_path) = self.stderr_file("bowtie2")?;
        let (view_err, view_err_path) = self.stderr_file("samtools-view")?;
        let (sort_err, sort_err_path) = self.stderr_file("samtools-sort")?;

        let mut bt2_child = bowtie2
            .stdout(Stdio::piped())
            .stderr(bt2_err)
            .spawn()
            .with_context(|| format!("Failed to start {}", self.paths.bowtie2.display()))?;
        let Some(bt2_out) = bt2_child.stdout.take() else {
            reap(&mut bt2_child);
            anyhow::bail!("bowtie2 stdout was not captured");
        };

        let mut view_child = match view
            .stdin(Stdio::from(bt2_out))
            .stdout(Stdio::piped())
            .stderr(view_err)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                reap(&mut bt2_child);
                return Err(e).context("Failed to start samtools view");
            }
        };
        let Some(view_out) = view_child.stdout.take() else {
            reap(&mut view_child);
            reap(&mut bt2_child);
            anyhow::bail!("samtools view stdout was not captured");
        };

        let sort_status = match sort
            .stdin(Stdio::from(view_out))
            .stdout(Stdio::null())
            .stderr(sort_err)
            .status()
        {
            Ok(status) => status,
            Err(e) => {
                reap(&mut view_child);
                reap(&mut bt2_child);
                return Err(e).context("Failed to run samtools sort");
            }
        };
        let view_status = view_child.wait().context("samtools view did not exit")?;
        let bt2_status = bt2_child.wait().context("bowtie2 did not exit")?;

        self.check(bt2_status, &rendered, &bt2_err_path)?;
        self.check(view_status, &rendered, &view_err_path)?;
        self.check(sort_status, &rendered, &sort_err_path)?;
        Ok(rendered)
    }

    /// `samtools quickcheck <bam>`: fails on truncated or corrupt BAM files
    pub fn check_bam(&self, bam: &Path) -> Result<String> {
        let mut cmd = Command::new(&self.paths.samtools);
        cmd.arg("quickcheck").arg(bam);
        self.run(cmd, "samtools-quickcheck")
            .with_context(|| format!("BAM integrity check failed: {}", bam.display()))
    }

    /// `samtools mpileup ... <bam>`, gzip-compressed into `output`.
    ///
    /// Reads are filtered only by mapping quality (`-q`) and base quality
    /// (`-Q`); there is no percent-identity or mean read-quality filter.
    pub fn mpileup(
        &self,
        bam: &Path,
        fasta: &Path,
        opts: &PileupOptions,
        output: &Path,
    ) -> Result<String> {
        let mut cmd = Command::new(&self.paths.samtools);
        cmd.arg("mpileup").arg("-d").arg(opts.max_depth.to_string());
        if !opts.baq {
            cmd.arg("-B");
        }
        if opts.adjust_mq {
            cmd.args(["-C", "50"]);
        }
        if !opts.discard_discordant {
            cmd.arg("-A");
        }
        cmd.arg("-q")
            .arg(opts.min_mapq.to_string())
            .arg("-Q")
            .arg(opts.min_baseq.to_string())
            .arg("-f")
            .arg(fasta)
            .arg(bam);

        let rendered = render(&cmd);
        log::info!("command: {}", rendered);

        let (stderr, stderr_path) = self.stderr_file("samtools-mpileup")?;
        let mut child = cmd
            .stdout(Stdio::piped())
            .stderr(stderr)
            .spawn()
            .context("Failed to start samtools mpileup")?;

        let mut out = match StagedOutput::create(output) {
            Ok(out) => out,
            Err(e) => {
                reap(&mut child);
                return Err(e.into());
            }
        };
        let status = drain_into(&mut child, &mut out, "samtools mpileup")
            .with_context(|| format!("Failed to write {}", output.display()))?;
        self.check(status, &rendered, &stderr_path)?;
        out.commit()?;
        Ok(rendered)
    }
}
