//! Query resolution: how a locked annotation window gets its label.
//!
//! The strategy is chosen once when the session is built:
//!
//! | Mode                      | Strategy             | Loop blocks? |
//! |---------------------------|----------------------|--------------|
//! | oracle                    | `Oracle`             | no (instant) |
//! | real-time, no oracle      | `BackgroundDialogue` | no           |
//! | batch, no oracle          | `BlockingDialogue`   | yes          |
//!
//! A background resolution runs as a spawned task holding a clone of the
//! shared buffer. Its [`PendingQuery`] handle is kept by the controller, so
//! the in-flight state is observable and joined exactly once.

use std::sync::{Arc, MutexGuard, PoisonError};

use async_trait::async_trait;
use coordination::{AnnotationBuffer, BufferError, CommitReport, SampleIndex, SharedAnnotationBuffer};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::ConfigError;

/// Asks a human for the label of the buffered samples.
#[async_trait]
pub trait DialogueService: Send + Sync {
    /// `votes` holds each committee member's label, in member order.
    async fn start_query(&self, votes: &[String]) -> anyhow::Result<String>;
}

/// Everything a strategy may use to answer one query.
#[derive(Debug, Clone)]
pub struct QueryContext {
    /// Sequence index of the sample that triggered the query.
    pub index: SampleIndex,
    /// Committee labels for that sample, in member order.
    pub votes: Vec<String>,
    /// Ground-truth label, used only by the oracle.
    pub truth: String,
}

/// The closed set of ways a query gets answered.
#[derive(Clone)]
pub enum QueryResolutionStrategy {
    /// Answer immediately from ground truth (offline evaluation).
    Oracle,
    /// Ask a human and wait for the answer inside the loop.
    BlockingDialogue(Arc<dyn DialogueService>),
    /// Ask a human on a spawned task while the loop keeps sampling.
    BackgroundDialogue(Arc<dyn DialogueService>),
}

impl QueryResolutionStrategy {
    /// Pick the strategy for a session's mode flags.
    pub fn select(
        oracle: bool,
        real_time: bool,
        dialogue: Option<Arc<dyn DialogueService>>,
    ) -> Result<Self, ConfigError> {
        if oracle {
            return Ok(Self::Oracle);
        }
        let dialogue = dialogue.ok_or_else(|| {
            ConfigError::Invalid("a dialogue service is required when oracle mode is off".into())
        })?;
        Ok(if real_time {
            Self::BackgroundDialogue(dialogue)
        } else {
            Self::BlockingDialogue(dialogue)
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Oracle => "oracle",
            Self::BlockingDialogue(_) => "blocking_dialogue",
            Self::BackgroundDialogue(_) => "background_dialogue",
        }
    }

    pub fn is_background(&self) -> bool {
        matches!(self, Self::BackgroundDialogue(_))
    }

    /// Produce the label for `ctx`.
    pub async fn resolve(&self, ctx: &QueryContext) -> anyhow::Result<String> {
        match self {
            Self::Oracle => Ok(ctx.truth.clone()),
            Self::BlockingDialogue(dialogue) | Self::BackgroundDialogue(dialogue) => {
                dialogue.start_query(&ctx.votes).await
            }
        }
    }
}

impl std::fmt::Debug for QueryResolutionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// How one query ended.
#[derive(Debug)]
pub enum QueryResolution {
    /// Every buffered sample received the label.
    Committed(CommitReport),
    /// The window closed but persisting some samples failed.
    StoreFailed(BufferError),
    /// No label was produced; the lock was released and samples kept.
    Abandoned { reason: String },
    /// The buffer was not locked when the answer arrived.
    LockViolation(BufferError),
}

/// Lock the shared buffer, recovering from a poisoned mutex.
pub fn lock_buffer(buffer: &SharedAnnotationBuffer) -> MutexGuard<'_, AnnotationBuffer> {
    buffer.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Close the lock window opened for query `index` with `answer`.
pub fn finish_query(
    buffer: &SharedAnnotationBuffer,
    index: SampleIndex,
    answer: anyhow::Result<String>,
) -> QueryResolution {
    let mut guard = lock_buffer(buffer);
    match answer {
        Ok(label) => match guard.unlock_and_commit(label) {
            Ok(report) => {
                info!(
                    query_sample = index,
                    label = %report.label,
                    committed = report.committed,
                    "Query answered"
                );
                QueryResolution::Committed(report)
            }
            Err(e) if e.is_lock_state() => {
                error!(query_sample = index, "Query answered with no open window: {e}");
                QueryResolution::LockViolation(e)
            }
            Err(e) => QueryResolution::StoreFailed(e),
        },
        Err(e) => {
            warn!(query_sample = index, "Query got no label: {e:#}");
            match guard.release() {
                Ok(()) => QueryResolution::Abandoned {
                    reason: format!("{e:#}"),
                },
                Err(lock_err) => {
                    error!(query_sample = index, "Abandoned query had no open window: {lock_err}");
                    QueryResolution::LockViolation(lock_err)
                }
            }
        }
    }
}

/// A query being answered on a background task.
pub struct PendingQuery {
    index: SampleIndex,
    buffer: SharedAnnotationBuffer,
    handle: JoinHandle<QueryResolution>,
}

impl PendingQuery {
    /// Resolve `ctx` with `strategy` on a new task. The buffer must already
    /// be locked for this query.
    pub fn spawn(
        strategy: QueryResolutionStrategy,
        ctx: QueryContext,
        buffer: SharedAnnotationBuffer,
    ) -> Self {
        let index = ctx.index;
        let task_buffer = buffer.clone();
        let handle = tokio::spawn(async move {
            let answer = strategy.resolve(&ctx).await;
            finish_query(&task_buffer, ctx.index, answer)
        });
        Self {
            index,
            buffer,
            handle,
        }
    }

    /// Sequence index of the sample that triggered this query.
    pub fn index(&self) -> SampleIndex {
        self.index
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the answer. A task that died without answering has its
    /// window released so the session can keep querying.
    pub async fn join(self) -> QueryResolution {
        match self.handle.await {
            Ok(resolution) => resolution,
            Err(e) => {
                warn!(query_sample = self.index, "Query task ended without an answer: {e}");
                finish_query(
                    &self.buffer,
                    self.index,
                    Err(anyhow::anyhow!("query task failed: {e}")),
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coordination::{AnnotationStore, Sample};
    use std::path::PathBuf;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct MemoryStore(Arc<Mutex<Vec<(SampleIndex, String)>>>);

    impl AnnotationStore for MemoryStore {
        fn append(&mut self, sample: &Sample, label: &str) -> std::io::Result<()> {
            self.0.lock().unwrap().push((sample.index, label.to_string()));
            Ok(())
        }

        fn handle(&self) -> PathBuf {
            PathBuf::from("memory")
        }
    }

    struct FixedAnswer(&'static str);

    #[async_trait]
    impl DialogueService for FixedAnswer {
        async fn start_query(&self, _votes: &[String]) -> anyhow::Result<String> {
            Ok(self.0.to_string())
        }
    }

    struct NoAnswer;

    #[async_trait]
    impl DialogueService for NoAnswer {
        async fn start_query(&self, _votes: &[String]) -> anyhow::Result<String> {
            anyhow::bail!("annotator walked away")
        }
    }

    fn ctx() -> QueryContext {
        QueryContext {
            index: 4,
            votes: vec!["Relax".into(), "Eating".into(), "Work".into()],
            truth: "Eating".into(),
        }
    }

    fn locked_buffer(store: MemoryStore, samples: u64) -> SharedAnnotationBuffer {
        let mut buffer = AnnotationBuffer::new(Box::new(store));
        for i in 0..samples {
            buffer.add(Sample::new(i, vec![]));
        }
        buffer.lock().unwrap();
        buffer.shared()
    }

    #[test]
    fn test_select_strategy() {
        let dialogue: Arc<dyn DialogueService> = Arc::new(FixedAnswer("Relax"));
        assert_eq!(
            QueryResolutionStrategy::select(true, true, None).unwrap().name(),
            "oracle"
        );
        assert!(QueryResolutionStrategy::select(false, true, Some(dialogue.clone()))
            .unwrap()
            .is_background());
        assert_eq!(
            QueryResolutionStrategy::select(false, false, Some(dialogue))
                .unwrap()
                .name(),
            "blocking_dialogue"
        );
        assert!(matches!(
            QueryResolutionStrategy::select(false, false, None),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn test_oracle_answers_with_truth() {
        let label = QueryResolutionStrategy::Oracle.resolve(&ctx()).await.unwrap();
        assert_eq!(label, "Eating");
    }

    #[tokio::test]
    async fn test_dialogue_answer_is_used() {
        let strategy = QueryResolutionStrategy::BlockingDialogue(Arc::new(FixedAnswer("Work")));
        assert_eq!(strategy.resolve(&ctx()).await.unwrap(), "Work");
    }

    #[test]
    fn test_finish_commits_window() {
        let store = MemoryStore::default();
        let emitted = store.0.clone();
        let buffer = locked_buffer(store, 3);

        let resolution = finish_query(&buffer, 2, Ok("Relax".into()));

        assert!(matches!(
            resolution,
            QueryResolution::Committed(CommitReport { committed: 3, .. })
        ));
        assert!(!lock_buffer(&buffer).is_locked());
        assert_eq!(emitted.lock().unwrap().len(), 3);
    }

    #[test]
    fn test_finish_without_answer_releases() {
        let buffer = locked_buffer(MemoryStore::default(), 2);
        let resolution = finish_query(&buffer, 1, Err(anyhow::anyhow!("timeout")));

        assert!(matches!(resolution, QueryResolution::Abandoned { .. }));
        let guard = lock_buffer(&buffer);
        assert!(!guard.is_locked());
        assert_eq!(guard.len(), 2);
    }

    #[test]
    fn test_finish_on_unlocked_buffer_is_violation() {
        let buffer = AnnotationBuffer::new(Box::new(MemoryStore::default())).shared();
        let resolution = finish_query(&buffer, 0, Ok("Relax".into()));
        assert!(matches!(
            resolution,
            QueryResolution::LockViolation(BufferError::NotLocked)
        ));
    }

    #[tokio::test]
    async fn test_pending_query_commits_on_join() {
        let store = MemoryStore::default();
        let emitted = store.0.clone();
        let buffer = locked_buffer(store, 2);
        let strategy = QueryResolutionStrategy::BackgroundDialogue(Arc::new(FixedAnswer("Sleeping")));

        let pending = PendingQuery::spawn(strategy, ctx(), buffer.clone());
        assert_eq!(pending.index(), 4);
        let resolution = pending.join().await;

        assert!(matches!(resolution, QueryResolution::Committed(_)));
        assert!(!lock_buffer(&buffer).is_locked());
        assert!(emitted
            .lock()
            .unwrap()
            .iter()
            .all(|(_, label)| label == "Sleeping"));
    }

    #[tokio::test]
    async fn test_pending_query_failure_releases_lock() {
        let buffer = locked_buffer(MemoryStore::default(), 1);
        let strategy = QueryResolutionStrategy::BackgroundDialogue(Arc::new(NoAnswer));

        let resolution = PendingQuery::spawn(strategy, ctx(), buffer.clone())
            .join()
            .await;

        assert!(matches!(
            resolution,
            QueryResolution::Abandoned { ref reason } if reason.contains("walked away")
        ));
        assert!(!lock_buffer(&buffer).is_locked());
    }
}
