//! Replay committee: a `CommitteeOracle` over precomputed predictions.
//!
//! Each line of the predictions file is one sample:
//!
//! ```json
//! {"features": [0.1, 3.0], "votes": [[0.7, 0.3], [0.4, 0.6], [0.9, 0.1]], "truth": 0}
//! ```
//!
//! Retraining is delegated to an external command, which receives the
//! annotations path as its last argument.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use coordination::{
    CommitteeOracle, CommitteeVerdict, Dataset, Distribution, LabelIndex, Sample, SampleIndex,
};
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info};

/// One precomputed committee prediction.
#[derive(Debug, Clone, Deserialize)]
pub struct PredictionRecord {
    #[serde(default)]
    pub features: Vec<f64>,
    pub votes: Vec<Vec<f64>>,
    pub truth: LabelIndex,
}

/// Committee that replays a recorded prediction stream.
pub struct ReplayCommittee {
    dataset: Dataset,
    records: Vec<PredictionRecord>,
    cursor: usize,
    current: Option<Sample>,
    retrain_argv: Option<Vec<String>>,
}

impl ReplayCommittee {
    pub fn new(dataset: Dataset, records: Vec<PredictionRecord>) -> Self {
        Self {
            dataset,
            records,
            cursor: 0,
            current: None,
            retrain_argv: None,
        }
    }

    /// Load a JSONL predictions file. Blank lines are skipped.
    pub fn open(path: &Path, dataset: Dataset) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read predictions file {}", path.display()))?;
        let records = contents
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(i, line)| {
                serde_json::from_str::<PredictionRecord>(line)
                    .map(|record| (i + 1, record))
                    .with_context(|| format!("{}:{}: invalid prediction record", path.display(), i + 1))
            })
            .collect::<Result<Vec<_>>>()?;

        // Every row of the result log has one column per member.
        if let Some((_, first)) = records.first() {
            let members = first.votes.len();
            if let Some((line, record)) = records.iter().find(|(_, r)| r.votes.len() != members) {
                bail!(
                    "{}:{}: {} committee votes, earlier records have {}",
                    path.display(),
                    line,
                    record.votes.len(),
                    members
                );
            }
        }
        let records: Vec<PredictionRecord> = records.into_iter().map(|(_, r)| r).collect();

        info!(
            path = %path.display(),
            samples = records.len(),
            dataset = %dataset,
            "Loaded committee predictions"
        );
        Ok(Self::new(dataset, records))
    }

    /// Committee size, taken from the first record (3 for an empty stream).
    pub fn members(&self) -> usize {
        self.records.first().map_or(3, |r| r.votes.len())
    }

    /// Program and arguments run on `retrain`.
    pub fn with_retrain_command(mut self, argv: Vec<String>) -> Self {
        self.retrain_argv = Some(argv);
        self
    }
}

#[async_trait]
impl CommitteeOracle for ReplayCommittee {
    fn reset_counter(&mut self) {
        self.cursor = 0;
        self.current = None;
    }

    fn get_max_predictions(&self) -> usize {
        self.records.len()
    }

    fn next_prediction(&mut self) -> Result<CommitteeVerdict> {
        let Some(record) = self.records.get(self.cursor) else {
            bail!(
                "prediction stream exhausted after {} samples",
                self.records.len()
            );
        };
        let sample = Sample::new(self.cursor as SampleIndex, record.features.clone())
            .with_truth(record.truth);
        let verdict = CommitteeVerdict::new(
            record.votes.iter().cloned().map(Distribution::new).collect(),
            record.truth,
        );
        self.current = Some(sample);
        self.cursor += 1;
        Ok(verdict)
    }

    fn get_current_sample(&self) -> Sample {
        self.current
            .clone()
            .unwrap_or_else(|| Sample::new(self.cursor as SampleIndex, Vec::new()))
    }

    fn get_label(&self, index: LabelIndex) -> String {
        self.dataset
            .label(index)
            .map(str::to_string)
            .unwrap_or_else(|| format!("label_{index}"))
    }

    async fn retrain(&mut self, annotations: &Path) -> Result<()> {
        let Some((program, args)) = self.retrain_argv.as_ref().and_then(|a| a.split_first()) else {
            bail!("no retrain command configured");
        };
        let annotations: PathBuf = annotations.to_path_buf();
        debug!(program = %program, annotations = %annotations.display(), "Running retrain command");

        let status = Command::new(program)
            .args(args)
            .arg(&annotations)
            .status()
            .await
            .with_context(|| format!("Failed to start retrain command {program}"))?;
        if !status.success() {
            bail!("retrain command {program} exited with {status}");
        }
        Ok(())
    }
}
