//! `al-session`: run one active-learning session.
//!
//! ```bash
//! # Replay predictions against ground truth, as fast as possible
//! al-session --dataset CASAS --oracle --predictions data/casas_predictions.jsonl
//!
//! # Live session with a retrain hook every 25 queries
//! al-session --dataset ARAS --real-time --retrain-command "python3 retrain.py"
//!
//! # Everything from a file, with verbose logging
//! AL_DEBUG=1 al-session --config session.toml
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use al_session::{
    write_session_report, ConsoleDialogue, DialogueService, PolicyKind, SessionConfig,
    SessionController,
};
use anyhow::Result;
use clap::Parser;
use coordination::{DisagreementMetric, LabelLinker};
use tracing::{info, warn};

/// Command-line arguments. Each flag overrides the config file and `AL_*` environment.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML session configuration
    #[arg(long)]
    config: Option<PathBuf>,

    /// Dataset: CASAS or ARAS (overrides AL_DATASET)
    #[arg(long)]
    dataset: Option<String>,

    /// Pace one sample per second and ask questions off-loop
    #[arg(long, overrides_with = "no_real_time")]
    real_time: bool,

    /// Process samples as fast as possible
    #[arg(long, overrides_with = "real_time")]
    no_real_time: bool,

    /// Answer queries from ground truth
    #[arg(long, overrides_with = "no_oracle")]
    oracle: bool,

    /// Ask a human instead of answering from ground truth
    #[arg(long, overrides_with = "oracle")]
    no_oracle: bool,

    /// Retrain the committee every `retrain_cadence` queries
    #[arg(long, overrides_with = "no_auto_retrain")]
    auto_retrain: bool,

    /// Never retrain the committee
    #[arg(long, overrides_with = "auto_retrain")]
    no_auto_retrain: bool,

    /// Verbose logging
    #[arg(long, overrides_with = "no_debug")]
    debug: bool,

    /// Default logging
    #[arg(long, overrides_with = "debug")]
    no_debug: bool,

    /// Stop after this many samples (0 = whole stream)
    #[arg(long)]
    max_predictions: Option<usize>,

    /// Maximum confirmed queries (overrides AL_QUERY_BUDGET)
    #[arg(long)]
    query_budget: Option<u32>,

    /// Retrain every N queries (overrides AL_RETRAIN_CADENCE)
    #[arg(long)]
    retrain_cadence: Option<u32>,

    /// Disagreement score above which a query is issued
    #[arg(long)]
    threshold: Option<f64>,

    /// Disagreement statistic: vote_entropy or consensus_kl
    #[arg(long)]
    metric: Option<DisagreementMetric>,

    /// Decision policy: threshold or budget_aware
    #[arg(long)]
    policy: Option<PolicyKind>,

    /// Precomputed committee predictions (JSONL)
    #[arg(long)]
    predictions: Option<PathBuf>,

    /// Annotation output (JSONL)
    #[arg(long)]
    annotations: Option<PathBuf>,

    /// Directory for result logs and session reports
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Command run on retrain; the annotations path is appended
    #[arg(long)]
    retrain_command: Option<String>,
}

/// `Some` when either side of a `--x` / `--no-x` pair was given; the last one wins.
fn switch(on: bool, off: bool) -> Option<bool> {
    match (on, off) {
        (true, _) => Some(true),
        (_, true) => Some(false),
        _ => None,
    }
}

impl Args {
    fn apply(self, config: &mut SessionConfig) {
        if let Some(dataset) = self.dataset {
            config.dataset = dataset;
        }
        if let Some(on) = switch(self.real_time, self.no_real_time) {
            config.real_time = on;
        }
        if let Some(on) = switch(self.oracle, self.no_oracle) {
            config.oracle = on;
        }
        if let Some(on) = switch(self.auto_retrain, self.no_auto_retrain) {
            config.auto_retrain = on;
        }
        if let Some(on) = switch(self.debug, self.no_debug) {
            config.debug = on;
        }
        if let Some(n) = self.max_predictions {
            config.max_predictions = n;
        }
        if let Some(n) = self.query_budget {
            config.query_budget = n;
        }
        if let Some(n) = self.retrain_cadence {
            config.retrain_cadence = n;
        }
        if let Some(t) = self.threshold {
            config.threshold = t;
        }
        if let Some(metric) = self.metric {
            config.metric = metric;
        }
        if let Some(policy) = self.policy {
            config.policy = policy;
        }
        if let Some(path) = self.predictions {
            config.predictions_path = Some(path);
        }
        if let Some(path) = self.annotations {
            config.annotations_path = Some(path);
        }
        if let Some(dir) = self.log_dir {
            config.log_dir = dir;
        }
        if let Some(command) = self.retrain_command {
            config.retrain_command = Some(command);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = SessionConfig::load(args.config.as_deref())?;
    args.apply(&mut config);

    let default_level = if config.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_level.into()),
        )
        .init();

    let dataset = match config.dataset() {
        Ok(dataset) => dataset,
        Err(e) => {
            warn!("Invalid dataset configuration.");
            return Err(e.into());
        }
    };
    let dialogue: Option<Arc<dyn DialogueService>> = if config.oracle {
        None
    } else {
        Some(Arc::new(ConsoleDialogue::stdin(LabelLinker::new(dataset))))
    };

    let mut controller = SessionController::from_config(&config, dialogue)?;

    let report = controller.run().await?;
    if let Some(path) = write_session_report(&report, &config.log_dir) {
        info!(path = %path.display(), "Session report saved");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configured() -> SessionConfig {
        SessionConfig {
            real_time: true,
            oracle: true,
            auto_retrain: false,
            debug: true,
            ..SessionConfig::default()
        }
    }

    #[test]
    fn test_flags_turn_settings_off() {
        let mut config = configured();
        Args::parse_from([
            "al-session",
            "--no-real-time",
            "--no-oracle",
            "--auto-retrain",
            "--no-debug",
        ])
        .apply(&mut config);

        assert!(!config.real_time);
        assert!(!config.oracle);
        assert!(config.auto_retrain);
        assert!(!config.debug);
    }

    #[test]
    fn test_absent_flags_keep_configuration() {
        let mut config = configured();
        Args::parse_from(["al-session", "--query-budget", "9"]).apply(&mut config);

        assert!(config.real_time);
        assert!(config.oracle);
        assert!(!config.auto_retrain);
        assert!(config.debug);
        assert_eq!(config.query_budget, 9);
    }

    #[test]
    fn test_last_of_a_pair_wins() {
        let mut config = configured();
        Args::parse_from(["al-session", "--oracle", "--no-oracle"]).apply(&mut config);
        assert!(!config.oracle);

        Args::parse_from(["al-session", "--no-oracle", "--oracle"]).apply(&mut config);
        assert!(config.oracle);
    }
}
