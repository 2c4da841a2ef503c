//! Session report: what a session did, written next to its result log.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Why the loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// Every sample up to the session length (or debug cap) was processed.
    SampleBudgetExhausted,
    /// The confirmed query count reached the query budget.
    QueryBudgetReached,
}

impl std::fmt::Display for EndReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SampleBudgetExhausted => write!(f, "sample budget exhausted"),
            Self::QueryBudgetReached => write!(f, "query budget reached"),
        }
    }
}

/// Summary of one completed session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionReport {
    pub session_id: String,
    pub started_at: DateTime<Local>,
    pub elapsed_ms: u64,
    pub end_reason: EndReason,
    pub resolution: String,
    /// Samples processed through the full loop.
    pub samples_processed: u64,
    /// Samples the session intended to process.
    pub sample_limit: u64,
    /// Confirmed queries (QueryRecord).
    pub queries: u32,
    /// Positive decisions dropped because a query was already in flight.
    pub suppressed_queries: u32,
    /// Queries that ended without a label.
    pub abandoned_queries: u32,
    /// Samples labelled through committed queries.
    pub annotated_samples: u64,
    pub annotation_store_failures: u32,
    pub result_log_failures: u32,
    pub committee_failures: u32,
    pub pacing_overruns: u32,
    pub retrain_attempts: u32,
    pub retrain_failures: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_path: Option<PathBuf>,
    pub annotations_path: PathBuf,
}

impl SessionReport {
    /// Emit the report as a single structured log line.
    pub fn emit(&self) {
        info!(
            session_id = %self.session_id,
            end_reason = %self.end_reason,
            samples = self.samples_processed,
            queries = self.queries,
            suppressed = self.suppressed_queries,
            annotated = self.annotated_samples,
            retrains = self.retrain_attempts,
            retrain_failures = self.retrain_failures,
            overruns = self.pacing_overruns,
            elapsed_ms = self.elapsed_ms,
            "Session finished"
        );
    }
}

/// `output_X.csv` → `output_X.summary.json`.
pub fn report_path_for(result_path: &Path) -> PathBuf {
    result_path.with_extension("summary.json")
}

/// Write `report` as pretty JSON next to its result log (or into `fallback_dir`).
pub fn write_session_report(report: &SessionReport, fallback_dir: &Path) -> Option<PathBuf> {
    let path = match &report.result_path {
        Some(result_path) => report_path_for(result_path),
        None => fallback_dir.join(format!("session_{}.summary.json", report.session_id)),
    };
    match serde_json::to_string_pretty(report) {
        Ok(json) => match std::fs::write(&path, json) {
            Ok(()) => {
                info!(path = %path.display(), "Wrote session report");
                Some(path)
            }
            Err(e) => {
                warn!("Failed to write session report: {e}");
                None
            }
        },
        Err(e) => {
            warn!("Failed to serialize session report: {e}");
            None
        }
    }
}
