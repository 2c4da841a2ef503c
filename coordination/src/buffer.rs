//! Annotation buffer: accumulates samples awaiting a label.
//!
//! Every sample the committee sees is pushed here, queried or not. When a
//! query is issued the buffer is locked; the answer to that query then labels
//! the whole run of buffered samples at once on `unlock_and_commit`. The lock
//! is what guarantees at most one query is in flight.
//!
//! ```text
//!   add(s1) add(s2) lock()   add(s3)   unlock_and_commit("Relax")
//!   [s1]    [s1,s2] [s1,s2]* [s1,s2,s3]*  → (s1,Relax) (s2,Relax) (s3,Relax), []
//! ```

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::{debug, warn};

use crate::committee::{Sample, SampleIndex};

/// Error type for buffer operations
#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    #[error("Annotation buffer is already locked by an in-flight query")]
    AlreadyLocked,

    #[error("Annotation buffer is not locked")]
    NotLocked,

    #[error("Annotation store failed for {failed} of {total} samples: {message}")]
    Store {
        failed: usize,
        total: usize,
        message: String,
    },
}

impl BufferError {
    /// Lock-state violations indicate broken controller logic, not a bad
    /// query cycle.
    pub fn is_lock_state(&self) -> bool {
        matches!(self, Self::AlreadyLocked | Self::NotLocked)
    }
}

/// Result type for buffer operations
pub type BufferResult<T> = Result<T, BufferError>;

/// Persistent destination for labelled samples.
pub trait AnnotationStore: Send {
    /// Persist one labelled sample.
    fn append(&mut self, sample: &Sample, label: &str) -> std::io::Result<()>;

    /// Flush anything buffered by the store.
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }

    /// Location of the accumulated annotations, handed to retraining.
    fn handle(&self) -> PathBuf;
}

/// One line of the JSONL annotation file.
#[derive(Debug, Serialize)]
struct AnnotationLine<'a> {
    index: SampleIndex,
    label: &'a str,
    features: &'a [f64],
}

/// Append-only JSONL annotation file.
pub struct JsonlAnnotationStore {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JsonlAnnotationStore {
    /// Open (or create) the annotation file at `path`, appending to it.
    pub fn open(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AnnotationStore for JsonlAnnotationStore {
    fn append(&mut self, sample: &Sample, label: &str) -> std::io::Result<()> {
        let line = AnnotationLine {
            index: sample.index,
            label,
            features: &sample.features,
        };
        let json = serde_json::to_string(&line)?;
        writeln!(self.writer, "{json}")
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }

    fn handle(&self) -> PathBuf {
        self.path.clone()
    }
}

/// Summary of a committed lock window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitReport {
    pub label: String,
    pub committed: usize,
}

/// Ordered queue of samples awaiting a label, guarded by a lock flag.
pub struct AnnotationBuffer {
    samples: VecDeque<Sample>,
    locked: bool,
    store: Box<dyn AnnotationStore>,
}

/// Buffer shared between the session loop and a background query task.
pub type SharedAnnotationBuffer = Arc<Mutex<AnnotationBuffer>>;

impl AnnotationBuffer {
    pub fn new(store: Box<dyn AnnotationStore>) -> Self {
        Self {
            samples: VecDeque::new(),
            locked: false,
            store,
        }
    }

    /// Wrap in `Arc<Mutex<_>>` for sharing with a query task.
    pub fn shared(self) -> SharedAnnotationBuffer {
        Arc::new(Mutex::new(self))
    }

    /// Append a sample. Accepted whether or not the buffer is locked.
    pub fn add(&mut self, sample: Sample) {
        self.samples.push_back(sample);
    }

    /// Take the lock for a new query.
    pub fn lock(&mut self) -> BufferResult<()> {
        if self.locked {
            return Err(BufferError::AlreadyLocked);
        }
        self.locked = true;
        debug!(buffered = self.samples.len(), "Annotation buffer locked");
        Ok(())
    }

    /// Label every buffered sample with `label`, persist each pair in arrival
    /// order, clear the buffer and release the lock.
    ///
    /// Store failures are reported after the window has been closed: the
    /// buffer is cleared and unlocked either way.
    pub fn unlock_and_commit(&mut self, label: impl Into<String>) -> BufferResult<CommitReport> {
        if !self.locked {
            return Err(BufferError::NotLocked);
        }
        let label = label.into();
        let total = self.samples.len();
        let mut failed = 0;
        let mut first_error = None;

        for sample in self.samples.drain(..) {
            if let Err(e) = self.store.append(&sample, &label) {
                failed += 1;
                first_error.get_or_insert_with(|| e.to_string());
            }
        }
        if let Err(e) = self.store.flush() {
            failed = total;
            first_error.get_or_insert_with(|| e.to_string());
        }
        self.locked = false;

        if let Some(message) = first_error {
            warn!(failed, total, %label, "Annotation commit incomplete");
            return Err(BufferError::Store {
                failed,
                total,
                message,
            });
        }

        debug!(committed = total, %label, "Annotation buffer committed");
        Ok(CommitReport {
            label,
            committed: total,
        })
    }

    /// Release the lock without labelling; buffered samples are kept for the
    /// next query. Used when a query fails to produce a label.
    pub fn release(&mut self) -> BufferResult<()> {
        if !self.locked {
            return Err(BufferError::NotLocked);
        }
        self.locked = false;
        debug!(
            buffered = self.samples.len(),
            "Annotation buffer released without commit"
        );
        Ok(())
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Where committed annotations accumulate.
    pub fn annotations_handle(&self) -> PathBuf {
        self.store.handle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Default)]
    struct RecordingStore {
        emitted: Arc<Mutex<Vec<(SampleIndex, String)>>>,
        fail_on: Option<SampleIndex>,
    }

    impl AnnotationStore for RecordingStore {
        fn append(&mut self, sample: &Sample, label: &str) -> std::io::Result<()> {
            if self.fail_on == Some(sample.index) {
                return Err(std::io::Error::other("disk full"));
            }
            self.emitted
                .lock()
                .unwrap()
                .push((sample.index, label.to_string()));
            Ok(())
        }

        fn handle(&self) -> PathBuf {
            PathBuf::from("memory")
        }
    }

    fn buffer_with(store: RecordingStore, count: u64) -> AnnotationBuffer {
        let mut buffer = AnnotationBuffer::new(Box::new(store));
        for i in 0..count {
            buffer.add(Sample::new(i, vec![i as f64]));
        }
        buffer
    }

    #[test]
    fn test_lock_twice_fails() {
        let mut buffer = buffer_with(RecordingStore::default(), 0);
        buffer.lock().unwrap();
        let err = buffer.lock().unwrap_err();
        assert!(matches!(err, BufferError::AlreadyLocked));
        assert!(err.is_lock_state());
    }

    #[test]
    fn test_commit_without_lock_fails() {
        let mut buffer = buffer_with(RecordingStore::default(), 2);
        let err = buffer.unlock_and_commit("Relax").unwrap_err();
        assert!(matches!(err, BufferError::NotLocked));
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn test_commit_emits_every_sample_in_order() {
        let store = RecordingStore::default();
        let emitted = store.emitted.clone();
        let mut buffer = buffer_with(store, 4);

        buffer.lock().unwrap();
        let report = buffer.unlock_and_commit("Sleeping").unwrap();

        assert_eq!(report.committed, 4);
        assert!(buffer.is_empty());
        assert!(!buffer.is_locked());
        let emitted = emitted.lock().unwrap();
        let indices: Vec<_> = emitted.iter().map(|(i, _)| *i).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);
        assert!(emitted.iter().all(|(_, l)| l == "Sleeping"));
    }

    #[test]
    fn test_add_while_locked_joins_window() {
        let store = RecordingStore::default();
        let emitted = store.emitted.clone();
        let mut buffer = buffer_with(store, 1);

        buffer.lock().unwrap();
        buffer.add(Sample::new(1, vec![]));
        buffer.add(Sample::new(2, vec![]));
        let report = buffer.unlock_and_commit("Eating").unwrap();

        assert_eq!(report.committed, 3);
        assert_eq!(emitted.lock().unwrap().len(), 3);
    }

    #[test]
    fn test_store_failure_still_closes_window() {
        let store = RecordingStore {
            fail_on: Some(1),
            ..Default::default()
        };
        let emitted = store.emitted.clone();
        let mut buffer = buffer_with(store, 3);

        buffer.lock().unwrap();
        let err = buffer.unlock_and_commit("Work").unwrap_err();

        assert!(matches!(err, BufferError::Store { failed: 1, total: 3, .. }));
        assert!(!err.is_lock_state());
        assert!(buffer.is_empty());
        assert!(!buffer.is_locked());
        assert_eq!(emitted.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_release_keeps_samples() {
        let mut buffer = buffer_with(RecordingStore::default(), 2);
        assert!(matches!(buffer.release(), Err(BufferError::NotLocked)));

        buffer.lock().unwrap();
        buffer.release().unwrap();
        assert!(!buffer.is_locked());
        assert_eq!(buffer.len(), 2);
        buffer.lock().unwrap();
    }

    #[test]
    fn test_jsonl_store_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("annotations").join("session.jsonl");
        let store = JsonlAnnotationStore::open(&path).unwrap();
        let mut buffer = AnnotationBuffer::new(Box::new(store));
        assert_eq!(buffer.annotations_handle(), path);

        buffer.add(Sample::new(7, vec![0.5, 1.5]));
        buffer.add(Sample::new(8, vec![2.0]));
        buffer.lock().unwrap();
        buffer.unlock_and_commit("Relax").unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = contents
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["index"], 7);
        assert_eq!(lines[0]["label"], "Relax");
        assert_eq!(lines[1]["features"][0], 2.0);
    }
}
