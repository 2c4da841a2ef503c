//! Disagreement evaluation for query-by-committee
//!
//! Turns one sample's committee votes into a scalar disagreement score, a
//! classification of the split, and a boolean query decision. Everything
//! here is a pure function of its inputs: identical distributions always
//! produce identical decisions.
//!
//! Two statistics are available:
//! - **Vote entropy** over the members' hard (arg-max) votes. Zero when all
//!   members agree, `ln(N)` when every member names a different label.
//! - **Consensus KL**: vote entropy, with the mean Kullback-Leibler
//!   divergence of each member's distribution from the committee mean
//!   breaking ties between votes that split the same way. The soft term is
//!   squashed below [`KL_TIE_BREAK`], so it never reorders two different
//!   hard splits.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::committee::{Distribution, LabelIndex};

/// Scores below this are reported as exactly zero.
const SCORE_EPSILON: f64 = 1e-12;

/// Upper bound of the soft divergence term in the consensus KL score.
pub const KL_TIE_BREAK: f64 = 1e-3;

/// How committee members' votes split on one sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisagreementType {
    /// Every member predicts the same label.
    Unanimous,
    /// Some members agree, some do not.
    PartialSplit,
    /// Every member predicts a different label.
    FullSplit,
}

impl DisagreementType {
    /// Classify a set of hard votes.
    pub fn classify(labels: &[LabelIndex]) -> Self {
        let mut distinct: Vec<LabelIndex> = labels.to_vec();
        distinct.sort_unstable();
        distinct.dedup();

        if distinct.len() <= 1 {
            Self::Unanimous
        } else if distinct.len() == labels.len() {
            Self::FullSplit
        } else {
            Self::PartialSplit
        }
    }
}

impl std::fmt::Display for DisagreementType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unanimous => write!(f, "unanimous"),
            Self::PartialSplit => write!(f, "partial_split"),
            Self::FullSplit => write!(f, "full_split"),
        }
    }
}

/// Statistic used to score disagreement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisagreementMetric {
    #[default]
    VoteEntropy,
    ConsensusKl,
}

impl DisagreementMetric {
    pub fn score(&self, votes: &[Distribution]) -> f64 {
        let raw = match self {
            Self::VoteEntropy => vote_entropy(votes),
            Self::ConsensusKl => {
                let kl = consensus_kl(votes);
                vote_entropy(votes) + KL_TIE_BREAK * kl / (1.0 + kl)
            }
        };
        if raw < SCORE_EPSILON {
            0.0
        } else {
            raw
        }
    }
}

impl std::str::FromStr for DisagreementMetric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "vote_entropy" | "entropy" => Ok(Self::VoteEntropy),
            "consensus_kl" | "kl" => Ok(Self::ConsensusKl),
            other => Err(format!("unknown disagreement metric: {other}")),
        }
    }
}

fn vote_entropy(votes: &[Distribution]) -> f64 {
    if votes.is_empty() {
        return 0.0;
    }
    let mut counts: BTreeMap<LabelIndex, usize> = BTreeMap::new();
    for vote in votes {
        *counts.entry(vote.argmax()).or_insert(0) += 1;
    }
    let n = votes.len() as f64;
    counts
        .values()
        .map(|&c| {
            let p = c as f64 / n;
            -p * p.ln()
        })
        .sum()
}

fn consensus_kl(votes: &[Distribution]) -> f64 {
    if votes.is_empty() {
        return 0.0;
    }
    let width = votes.iter().map(Distribution::len).max().unwrap_or(0);
    let n = votes.len() as f64;

    let mut mean = vec![0.0; width];
    for vote in votes {
        for (m, p) in mean.iter_mut().zip(vote.probabilities()) {
            *m += p / n;
        }
    }

    let total: f64 = votes
        .iter()
        .map(|vote| {
            vote.probabilities()
                .iter()
                .zip(&mean)
                .filter(|(p, m)| **p > 0.0 && **m > 0.0)
                .map(|(p, m)| p * (p / m).ln())
                .sum::<f64>()
        })
        .sum();
    (total / n).max(0.0)
}

/// Mapping from score to query decision.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DecisionPolicy {
    /// Query whenever the score exceeds `threshold`.
    Threshold { threshold: f64 },
    /// Query when the score exceeds `threshold` and the queries used so far
    /// are within the pro-rata share of the budget plus `slack`.
    BudgetAware { threshold: f64, slack: u32 },
}

impl DecisionPolicy {
    pub fn threshold(&self) -> f64 {
        match self {
            Self::Threshold { threshold } | Self::BudgetAware { threshold, .. } => *threshold,
        }
    }

    fn allows(&self, score: f64, progress: &QueryProgress) -> bool {
        if progress.query_budget > 0 && progress.queries_used >= progress.query_budget {
            return false;
        }
        match self {
            Self::Threshold { threshold } => score > *threshold,
            Self::BudgetAware { threshold, slack } => {
                score > *threshold && progress.queries_used < progress.allowance(*slack)
            }
        }
    }
}

impl Default for DecisionPolicy {
    fn default() -> Self {
        Self::Threshold { threshold: 0.5 }
    }
}

/// Where the session stands against its budgets when a sample is scored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryProgress {
    /// Confirmed queries so far.
    pub queries_used: u32,
    /// Hard cap on queries (0 = unlimited).
    pub query_budget: u32,
    /// Samples seen including the one being scored.
    pub samples_seen: u64,
    /// Total samples the session will process.
    pub sample_budget: u64,
}

impl QueryProgress {
    /// Queries the budget-aware policy allows by this point in the stream.
    pub fn allowance(&self, slack: u32) -> u32 {
        if self.query_budget == 0 || self.sample_budget == 0 {
            return u32::MAX;
        }
        let share = (self.query_budget as u64 * self.samples_seen).div_ceil(self.sample_budget);
        (share.min(self.query_budget as u64) as u32).saturating_add(slack)
    }
}

/// Outcome of scoring one sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Disagreement {
    pub score: f64,
    pub decision: bool,
    pub kind: DisagreementType,
    /// Whether the committee's plurality label matched the ground truth.
    pub plurality_correct: bool,
}

/// Scores committee votes and decides whether to query.
#[derive(Debug, Clone, Default)]
pub struct DisagreementEvaluator {
    metric: DisagreementMetric,
    policy: DecisionPolicy,
}

impl DisagreementEvaluator {
    pub fn new(metric: DisagreementMetric, policy: DecisionPolicy) -> Self {
        Self { metric, policy }
    }

    pub fn metric(&self) -> DisagreementMetric {
        self.metric
    }

    pub fn policy(&self) -> DecisionPolicy {
        self.policy
    }

    /// Score `votes` and decide whether this sample is worth a query.
    pub fn decide(
        &self,
        votes: &[Distribution],
        truth: LabelIndex,
        progress: &QueryProgress,
    ) -> Disagreement {
        let labels: Vec<LabelIndex> = votes.iter().map(Distribution::argmax).collect();
        let kind = DisagreementType::classify(&labels);
        let score = self.metric.score(votes);
        let decision = self.policy.allows(score, progress);
        let plurality_correct = plurality(&labels) == Some(truth);

        debug!(
            score,
            decision,
            kind = %kind,
            plurality_correct,
            "Committee disagreement"
        );

        Disagreement {
            score,
            decision,
            kind,
            plurality_correct,
        }
    }
}

/// Most common label; ties go to the lowest label index.
fn plurality(labels: &[LabelIndex]) -> Option<LabelIndex> {
    let mut counts: BTreeMap<LabelIndex, usize> = BTreeMap::new();
    for label in labels {
        *counts.entry(*label).or_insert(0) += 1;
    }
    let max = counts.values().copied().max()?;
    counts
        .into_iter()
        .find(|(_, count)| *count == max)
        .map(|(label, _)| label)
}
