//! Query Coordination Library
//!
//! Deterministic building blocks for a streaming query-by-committee loop:
//! - Committee data model and the `CommitteeOracle` collaborator seam
//! - Disagreement scoring and query decision policies
//! - The annotation buffer that labels a run of samples per query
//! - Retrain scheduling on a fixed query cadence
//! - Real-time pacing of the sample loop
//! - The per-sample CSV result log
//! - Dataset vocabularies and label translation
//!
//! # Loop shape
//!
//! ```text
//! committee.next_prediction → buffer.add → evaluator.decide → sink.record
//!      → [query] buffer.lock → resolve label → buffer.unlock_and_commit
//!      → pacer.pace → scheduler.maybe_retrain
//! ```
//!
//! The session controller that drives this loop lives in the `al-session`
//! crate.

#![allow(clippy::uninlined_format_args)]

pub mod buffer;
pub mod committee;
pub mod dataset;
pub mod disagreement;
pub mod labels;
pub mod pacer;
pub mod retrain;
pub mod sink;

pub use buffer::{
    AnnotationBuffer, AnnotationStore, BufferError, BufferResult, CommitReport,
    JsonlAnnotationStore, SharedAnnotationBuffer,
};
pub use committee::{
    CommitteeOracle, CommitteeVerdict, Distribution, LabelIndex, Sample, SampleIndex,
};
pub use dataset::{Dataset, UnknownDataset};
pub use disagreement::{
    DecisionPolicy, Disagreement, DisagreementEvaluator, DisagreementMetric, DisagreementType,
    QueryProgress,
};
pub use labels::LabelLinker;
pub use pacer::{PaceDecision, Pacer};
pub use retrain::{RetrainOutcome, RetrainScheduler, DEFAULT_RETRAIN_CADENCE};
pub use sink::{CsvResultSink, ResultRow, ResultSink, SinkError, SinkResult};
