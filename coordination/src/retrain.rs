//! Retrain scheduling: fires committee retraining every `cadence` queries.
//!
//! The scheduler fires at most once per distinct multiple of the cadence, no
//! matter how often it is consulted for the same query count. The checkpoint
//! advances on every attempt; a failed retrain is logged and not retried.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::committee::CommitteeOracle;

/// Default number of confirmed queries between retrains.
pub const DEFAULT_RETRAIN_CADENCE: u32 = 25;

/// What a call to [`RetrainScheduler::maybe_retrain`] did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RetrainOutcome {
    /// No retrain due at this query count.
    NotDue,
    /// Retrain ran and the collaborator reported success.
    Retrained { at_queries: u32 },
    /// Retrain ran and failed; the checkpoint advanced anyway.
    Failed { at_queries: u32, reason: String },
}

impl RetrainOutcome {
    pub fn attempted(&self) -> bool {
        !matches!(self, Self::NotDue)
    }
}

/// Counts confirmed queries against a retrain cadence.
#[derive(Debug, Clone)]
pub struct RetrainScheduler {
    cadence: u32,
    last_checkpoint: u32,
    attempts: u32,
    failures: u32,
}

impl RetrainScheduler {
    /// `cadence` of zero is treated as one.
    pub fn new(cadence: u32) -> Self {
        Self {
            cadence: cadence.max(1),
            last_checkpoint: 0,
            attempts: 0,
            failures: 0,
        }
    }

    pub fn cadence(&self) -> u32 {
        self.cadence
    }

    /// Query count at the last retrain attempt (0 before the first).
    pub fn last_checkpoint(&self) -> u32 {
        self.last_checkpoint
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Whether a retrain is due at `query_count`.
    pub fn is_due(&self, query_count: u32) -> bool {
        query_count > 0 && query_count % self.cadence == 0 && query_count != self.last_checkpoint
    }

    /// Retrain `committee` on `annotations` if one is due at `query_count`.
    pub async fn maybe_retrain(
        &mut self,
        query_count: u32,
        annotations: &Path,
        committee: &mut dyn CommitteeOracle,
    ) -> RetrainOutcome {
        if !self.is_due(query_count) {
            return RetrainOutcome::NotDue;
        }

        self.last_checkpoint = query_count;
        self.attempts += 1;
        info!(
            queries = query_count,
            annotations = %annotations.display(),
            "Retraining committee"
        );

        match committee.retrain(annotations).await {
            Ok(()) => {
                info!(queries = query_count, "Committee retrained");
                RetrainOutcome::Retrained {
                    at_queries: query_count,
                }
            }
            Err(e) => {
                self.failures += 1;
                warn!(queries = query_count, "Committee retrain failed: {e:#}");
                RetrainOutcome::Failed {
                    at_queries: query_count,
                    reason: format!("{e:#}"),
                }
            }
        }
    }
}

impl Default for RetrainScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_RETRAIN_CADENCE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::committee::MockCommitteeOracle;

    #[tokio::test]
    async fn test_fires_once_per_multiple() {
        let mut committee = MockCommitteeOracle::new();
        committee.expect_retrain().times(3).returning(|_| Ok(()));

        let mut scheduler = RetrainScheduler::new(25);
        let path = Path::new("annotations.jsonl");
        let mut fired = Vec::new();

        for count in 0..=80u32 {
            // Consult twice per count, as the loop does when no query happens.
            for _ in 0..2 {
                if let RetrainOutcome::Retrained { at_queries } =
                    scheduler.maybe_retrain(count, path, &mut committee).await
                {
                    fired.push(at_queries);
                }
            }
        }

        assert_eq!(fired, vec![25, 50, 75]);
        assert_eq!(scheduler.attempts(), 3);
        assert_eq!(scheduler.last_checkpoint(), 75);
    }

    #[tokio::test]
    async fn test_never_fires_at_zero_or_non_multiples() {
        let mut committee = MockCommitteeOracle::new();
        committee.expect_retrain().never();

        let mut scheduler = RetrainScheduler::new(25);
        for count in [0, 1, 24, 26, 49] {
            let outcome = scheduler.maybe_retrain(count, Path::new("a"), &mut committee).await;
            assert_eq!(outcome, RetrainOutcome::NotDue);
            assert!(!outcome.attempted());
        }
    }

    #[tokio::test]
    async fn test_failure_advances_checkpoint_without_retry() {
        let mut committee = MockCommitteeOracle::new();
        committee
            .expect_retrain()
            .times(1)
            .returning(|_| Err(anyhow::anyhow!("trainer crashed")));

        let mut scheduler = RetrainScheduler::new(5);
        let first = scheduler.maybe_retrain(5, Path::new("a"), &mut committee).await;
        let again = scheduler.maybe_retrain(5, Path::new("a"), &mut committee).await;

        assert!(matches!(
            first,
            RetrainOutcome::Failed { at_queries: 5, ref reason } if reason.contains("trainer crashed")
        ));
        assert_eq!(again, RetrainOutcome::NotDue);
        assert_eq!(scheduler.failures(), 1);
        assert_eq!(scheduler.last_checkpoint(), 5);
    }

    #[tokio::test]
    async fn test_passes_annotation_handle() {
        let mut committee = MockCommitteeOracle::new();
        committee
            .expect_retrain()
            .withf(|path| path.to_str() == Some("logs/annotations.jsonl"))
            .times(1)
            .returning(|_| Ok(()));

        let mut scheduler = RetrainScheduler::new(1);
        let outcome = scheduler
            .maybe_retrain(1, Path::new("logs/annotations.jsonl"), &mut committee)
            .await;
        assert_eq!(outcome, RetrainOutcome::Retrained { at_queries: 1 });
    }

    #[test]
    fn test_zero_cadence_clamped() {
        assert_eq!(RetrainScheduler::new(0).cadence(), 1);
        assert_eq!(RetrainScheduler::default().cadence(), 25);
    }
}
