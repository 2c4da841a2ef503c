//! Committee data model and the collaborator seam for committee inference.
//!
//! A committee is a fixed-size ensemble of independently trained classifiers.
//! For every incoming [`Sample`] each member produces one [`Distribution`]
//! over the label space; together with the ground truth these form a
//! [`CommitteeVerdict`], produced once per sample and never mutated.

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Index into a dataset's label vocabulary.
pub type LabelIndex = usize;

/// Sequence number of a sample within a session.
pub type SampleIndex = u64;

/// One unlabelled observation from the stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Position in the stream (0-based).
    pub index: SampleIndex,
    /// Opaque feature vector, passed through untouched.
    pub features: Vec<f64>,
    /// Known ground truth, present only in evaluation datasets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub truth: Option<LabelIndex>,
}

impl Sample {
    pub fn new(index: SampleIndex, features: Vec<f64>) -> Self {
        Self {
            index,
            features,
            truth: None,
        }
    }

    pub fn with_truth(mut self, truth: LabelIndex) -> Self {
        self.truth = Some(truth);
        self
    }
}

/// A probability distribution over the label space produced by one member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Distribution(Vec<f64>);

impl Distribution {
    pub fn new(probabilities: Vec<f64>) -> Self {
        Self(probabilities)
    }

    /// A distribution with all mass on `label`.
    pub fn one_hot(label: LabelIndex, classes: usize) -> Self {
        let mut probabilities = vec![0.0; classes.max(label + 1)];
        probabilities[label] = 1.0;
        Self(probabilities)
    }

    pub fn probabilities(&self) -> &[f64] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Index of the most probable label. Ties resolve to the lowest index so
    /// that the result is deterministic. Returns 0 for an empty distribution.
    pub fn argmax(&self) -> LabelIndex {
        let mut best = 0;
        for (i, p) in self.0.iter().enumerate() {
            if *p > self.0[best] {
                best = i;
            }
        }
        best
    }
}

impl From<Vec<f64>> for Distribution {
    fn from(probabilities: Vec<f64>) -> Self {
        Self(probabilities)
    }
}

/// All member votes for one sample plus its ground truth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitteeVerdict {
    pub votes: Vec<Distribution>,
    pub truth: LabelIndex,
}

impl CommitteeVerdict {
    pub fn new(votes: Vec<Distribution>, truth: LabelIndex) -> Self {
        Self { votes, truth }
    }

    /// Hard vote of every member, in member order.
    pub fn predicted_labels(&self) -> Vec<LabelIndex> {
        self.votes.iter().map(Distribution::argmax).collect()
    }

    pub fn members(&self) -> usize {
        self.votes.len()
    }
}

/// The committee classifiers, treated as an external collaborator.
///
/// Implementations own feature extraction, training and per-sample
/// prediction. The session drives them strictly sequentially.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CommitteeOracle: Send {
    /// Rewind to the start of the session stream.
    fn reset_counter(&mut self);

    /// Number of samples available in this session.
    fn get_max_predictions(&self) -> usize;

    /// Advance to the next sample and return every member's vote for it.
    fn next_prediction(&mut self) -> anyhow::Result<CommitteeVerdict>;

    /// The sample most recently returned by [`Self::next_prediction`].
    fn get_current_sample(&self) -> Sample;

    /// Translate a label index into the dataset's label value.
    fn get_label(&self, index: LabelIndex) -> String;

    /// Retrain the committee on the annotations accumulated at `annotations`.
    /// May take minutes; implementations must not block the runtime.
    async fn retrain(&mut self, annotations: &Path) -> anyhow::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_argmax_picks_highest_probability() {
        let d = Distribution::new(vec![0.1, 0.7, 0.2]);
        assert_eq!(d.argmax(), 1);
    }

    #[test]
    fn test_argmax_tie_prefers_lowest_index() {
        let d = Distribution::new(vec![0.4, 0.4, 0.2]);
        assert_eq!(d.argmax(), 0);
        assert_eq!(Distribution::new(vec![]).argmax(), 0);
    }

    #[test]
    fn test_one_hot_extends_to_label() {
        let d = Distribution::one_hot(4, 3);
        assert_eq!(d.len(), 5);
        assert_eq!(d.argmax(), 4);
    }

    #[test]
    fn test_verdict_predicted_labels() {
        let verdict = CommitteeVerdict::new(
            vec![
                Distribution::one_hot(0, 3),
                Distribution::one_hot(2, 3),
                Distribution::new(vec![0.2, 0.5, 0.3]),
            ],
            2,
        );
        assert_eq!(verdict.predicted_labels(), vec![0, 2, 1]);
        assert_eq!(verdict.members(), 3);
    }

    #[test]
    fn test_sample_serializes_without_missing_truth() {
        let json = serde_json::to_string(&Sample::new(3, vec![1.0])).unwrap();
        assert!(!json.contains("truth"));
        let back: Sample = serde_json::from_str(&json).unwrap();
        assert_eq!(back.index, 3);
        assert_eq!(back.truth, None);
    }
}
