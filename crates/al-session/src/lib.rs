//! Active-learning session runtime.
//!
//! Drives a query-by-committee session over a stream of samples: consults
//! the committee per sample, queries an oracle or a human when members
//! disagree, labels the buffered run of samples with the answer, and
//! retrains the committee on a fixed query cadence.
//!
//! # Usage
//!
//! ```bash
//! # Offline evaluation: answers come from ground truth, no pacing
//! al-session --dataset CASAS --oracle --predictions data/casas_predictions.jsonl
//!
//! # Live: one sample per second, questions asked on the terminal
//! al-session --dataset ARAS --real-time
//! ```

pub mod config;
pub mod controller;
pub mod dialogue;
pub mod error;
pub mod replay;
pub mod resolution;
pub mod telemetry;

pub use config::{PolicyKind, SessionConfig, SessionSettings};
pub use controller::SessionController;
pub use dialogue::ConsoleDialogue;
pub use error::{ConfigError, ConfigResult, SessionError, SessionResult};
pub use replay::{PredictionRecord, ReplayCommittee};
pub use resolution::{
    DialogueService, PendingQuery, QueryContext, QueryResolution, QueryResolutionStrategy,
};
pub use telemetry::{write_session_report, EndReason, SessionReport};
