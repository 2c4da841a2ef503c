//! Per-sample result log.
//!
//! One CSV file per session, named after the session start time
//! (`output_YYYYmmdd-HHMMSS.csv`). A header row precedes the records; each
//! record is one processed sample.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::committee::SampleIndex;

/// Suffixed names tried when sessions share a start second.
const MAX_NAME_ATTEMPTS: u32 = 100;

/// Error type for result sink operations
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("Failed to write result log {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Result row has {got} committee labels, log expects {expected}")]
    MemberCount { got: usize, expected: usize },
}

/// Result type for result sink operations
pub type SinkResult<T> = Result<T, SinkError>;

/// Outcome of one sample, as written to the result log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRow {
    pub index: SampleIndex,
    /// Each member's predicted label, translated to the dataset vocabulary.
    pub committee: Vec<String>,
    pub truth: String,
    pub score: f64,
    pub decision: bool,
}

/// Append-only destination for per-sample results.
pub trait ResultSink: Send {
    fn record(&mut self, row: &ResultRow) -> SinkResult<()>;

    /// Where the records end up, if they are persisted.
    fn location(&self) -> Option<&Path> {
        None
    }
}

/// CSV result log.
pub struct CsvResultSink {
    path: PathBuf,
    members: usize,
    writer: BufWriter<File>,
}

impl CsvResultSink {
    /// Create `output_<timestamp>.csv` under `log_dir` and write the header.
    /// If that name is taken, `output_<timestamp>-1.csv`, `-2`, ... are tried.
    pub fn create(log_dir: &Path, started: DateTime<Local>, members: usize) -> SinkResult<Self> {
        let stamp = started.format("%Y%m%d-%H%M%S").to_string();
        let mut attempt = 0;
        loop {
            let name = match attempt {
                0 => format!("output_{stamp}.csv"),
                n => format!("output_{stamp}-{n}.csv"),
            };
            match Self::create_at(log_dir.join(name), members) {
                Err(SinkError::Io { source, .. })
                    if source.kind() == ErrorKind::AlreadyExists && attempt < MAX_NAME_ATTEMPTS =>
                {
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    /// Create the log at an explicit path and write the header. Never
    /// overwrites an existing file.
    pub fn create_at(path: impl Into<PathBuf>, members: usize) -> SinkResult<Self> {
        let path = path.into();
        let io_err = |source: std::io::Error| SinkError::Io {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(io_err)?;
            }
        }
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(io_err)?;
        let mut sink = Self {
            path: path.clone(),
            members,
            writer: BufWriter::new(file),
        };

        let mut header = vec!["Sample Count".to_string()];
        header.extend((1..=members).map(|i| format!("Learner {i}")));
        header.extend(
            ["Truth", "Max Disagreement", "Query Decision"]
                .iter()
                .map(|s| s.to_string()),
        );
        sink.write_line(&header)?;

        info!(path = %path.display(), "The logfile for this session is ready");
        Ok(sink)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_line(&mut self, fields: &[String]) -> SinkResult<()> {
        let line = fields
            .iter()
            .map(|f| escape_field(f))
            .collect::<Vec<_>>()
            .join(",");
        writeln!(self.writer, "{line}")
            .and_then(|_| self.writer.flush())
            .map_err(|source| SinkError::Io {
                path: self.path.clone(),
                source,
            })
    }
}

impl ResultSink for CsvResultSink {
    fn record(&mut self, row: &ResultRow) -> SinkResult<()> {
        if row.committee.len() != self.members {
            return Err(SinkError::MemberCount {
                got: row.committee.len(),
                expected: self.members,
            });
        }
        let mut fields = Vec::with_capacity(self.members + 4);
        fields.push(row.index.to_string());
        fields.extend(row.committee.iter().cloned());
        fields.push(row.truth.clone());
        fields.push(row.score.to_string());
        fields.push(if row.decision { "True" } else { "False" }.to_string());
        self.write_line(&fields)
    }

    fn location(&self) -> Option<&Path> {
        Some(&self.path)
    }
}

/// Quote a CSV field if it contains a delimiter, quote or line break.
fn escape_field(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}
