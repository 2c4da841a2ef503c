//! Session configuration.
//!
//! Values are layered, lowest precedence first: built-in defaults,
//! `AL_*` environment variables, an optional TOML file, then command-line
//! flags (applied by the binary).

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use coordination::{Dataset, DecisionPolicy, DisagreementMetric, DEFAULT_RETRAIN_CADENCE};
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

/// Hard cap on confirmed queries per session.
pub const DEFAULT_QUERY_BUDGET: u32 = 4000;

/// Default disagreement threshold (vote entropy of a 2-1 split is ~0.64).
pub const DEFAULT_THRESHOLD: f64 = 0.5;

/// Which decision policy maps scores to queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    #[default]
    Threshold,
    BudgetAware,
}

impl FromStr for PolicyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "threshold" => Ok(Self::Threshold),
            "budget_aware" | "budget" => Ok(Self::BudgetAware),
            other => Err(format!("unknown decision policy: {other}")),
        }
    }
}

/// Top-level session configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Dataset selector, CASAS or ARAS.
    pub dataset: String,
    /// Pace the loop to one sample per second and ask humans off-loop.
    pub real_time: bool,
    /// Answer queries from ground truth instead of asking a human.
    pub oracle: bool,
    /// Retrain the committee every `retrain_cadence` queries.
    pub auto_retrain: bool,
    /// Verbose logging.
    pub debug: bool,
    /// Cap on processed samples for debugging (0 = no cap).
    pub max_predictions: usize,
    pub query_budget: u32,
    pub retrain_cadence: u32,
    pub threshold: f64,
    pub metric: DisagreementMetric,
    pub policy: PolicyKind,
    /// Queries allowed above the pro-rata share in budget-aware mode.
    pub budget_slack: u32,
    /// Precomputed committee predictions (JSONL).
    pub predictions_path: Option<PathBuf>,
    /// Where committed annotations accumulate (JSONL).
    pub annotations_path: Option<PathBuf>,
    /// Directory for result logs and session reports.
    pub log_dir: PathBuf,
    /// External retrain command; the annotations path is appended.
    pub retrain_command: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            dataset: std::env::var("AL_DATASET").unwrap_or_else(|_| "CASAS".into()),
            real_time: env_flag("AL_REAL_TIME", false),
            oracle: env_flag("AL_ORACLE", false),
            auto_retrain: env_flag("AL_AUTO_RETRAIN", true),
            debug: env_flag("AL_DEBUG", false),
            max_predictions: env_parse("AL_MAX_PREDICTIONS", 0),
            query_budget: env_parse("AL_QUERY_BUDGET", DEFAULT_QUERY_BUDGET),
            retrain_cadence: env_parse("AL_RETRAIN_CADENCE", DEFAULT_RETRAIN_CADENCE),
            threshold: env_parse("AL_THRESHOLD", DEFAULT_THRESHOLD),
            metric: DisagreementMetric::default(),
            policy: PolicyKind::default(),
            budget_slack: 5,
            predictions_path: None,
            annotations_path: None,
            log_dir: PathBuf::from("logs"),
            retrain_command: std::env::var("AL_RETRAIN_COMMAND").ok(),
        }
    }
}

fn env_flag(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl SessionConfig {
    /// Defaults and environment, overlaid with `path` when given.
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        match path {
            Some(path) => Self::from_toml_file(path),
            None => Ok(Self::default()),
        }
    }

    pub fn from_toml_file(path: &Path) -> ConfigResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn dataset(&self) -> ConfigResult<Dataset> {
        Ok(self.dataset.parse::<Dataset>()?)
    }

    /// Check every value; returns the parsed dataset on success.
    pub fn validate(&self) -> ConfigResult<Dataset> {
        let dataset = self.dataset()?;
        if self.query_budget == 0 {
            return Err(ConfigError::Invalid("query_budget must be positive".into()));
        }
        if self.retrain_cadence == 0 {
            return Err(ConfigError::Invalid(
                "retrain_cadence must be positive".into(),
            ));
        }
        if !self.threshold.is_finite() || self.threshold < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "threshold must be a non-negative number, got {}",
                self.threshold
            )));
        }
        if let Some(command) = &self.retrain_command {
            self.retrain_argv()?;
            if command.trim().is_empty() {
                return Err(ConfigError::Invalid("retrain_command is empty".into()));
            }
        }
        Ok(dataset)
    }

    pub fn decision_policy(&self) -> DecisionPolicy {
        match self.policy {
            PolicyKind::Threshold => DecisionPolicy::Threshold {
                threshold: self.threshold,
            },
            PolicyKind::BudgetAware => DecisionPolicy::BudgetAware {
                threshold: self.threshold,
                slack: self.budget_slack,
            },
        }
    }

    /// Retrain command split into program and arguments.
    pub fn retrain_argv(&self) -> ConfigResult<Option<Vec<String>>> {
        match &self.retrain_command {
            None => Ok(None),
            Some(command) => shlex::split(command)
                .map(Some)
                .ok_or_else(|| ConfigError::Invalid(format!("cannot parse retrain_command: {command}"))),
        }
    }

    pub fn predictions_path(&self, dataset: Dataset) -> PathBuf {
        self.predictions_path.clone().unwrap_or_else(|| {
            PathBuf::from("data").join(format!(
                "{}_predictions.jsonl",
                dataset.name().to_ascii_lowercase()
            ))
        })
    }

    pub fn annotations_path(&self, dataset: Dataset) -> PathBuf {
        self.annotations_path.clone().unwrap_or_else(|| {
            self.log_dir.join(format!(
                "annotations_{}.jsonl",
                dataset.name().to_ascii_lowercase()
            ))
        })
    }
}

/// Loop settings derived from a validated [`SessionConfig`].
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub real_time: bool,
    pub auto_retrain: bool,
    pub max_predictions: usize,
    pub query_budget: u32,
    pub retrain_cadence: u32,
    pub metric: DisagreementMetric,
    pub policy: DecisionPolicy,
    pub pacing_period: Duration,
}

impl SessionSettings {
    pub fn from_config(config: &SessionConfig) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self {
            real_time: config.real_time,
            auto_retrain: config.auto_retrain,
            max_predictions: config.max_predictions,
            query_budget: config.query_budget,
            retrain_cadence: config.retrain_cadence,
            metric: config.metric,
            policy: config.decision_policy(),
            pacing_period: coordination::pacer::DEFAULT_PERIOD,
        })
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            real_time: false,
            auto_retrain: true,
            max_predictions: 0,
            query_budget: DEFAULT_QUERY_BUDGET,
            retrain_cadence: DEFAULT_RETRAIN_CADENCE,
            metric: DisagreementMetric::default(),
            policy: DecisionPolicy::Threshold {
                threshold: DEFAULT_THRESHOLD,
            },
            pacing_period: coordination::pacer::DEFAULT_PERIOD,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> SessionConfig {
        SessionConfig {
            dataset: "CASAS".into(),
            ..SessionConfig::default()
        }
    }

    #[test]
    fn test_toml_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.toml");
        std::fs::write(
            &path,
            r#"
dataset = "ARAS"
oracle = true
query_budget = 3
metric = "consensus_kl"
policy = "budget_aware"
retrain_command = "python3 retrain.py --epochs 2"
"#,
        )
        .unwrap();

        let config = SessionConfig::load(Some(&path)).unwrap();
        assert_eq!(config.validate().unwrap(), Dataset::Aras);
        assert!(config.oracle);
        assert_eq!(config.query_budget, 3);
        assert_eq!(config.metric, DisagreementMetric::ConsensusKl);
        assert!(matches!(
            config.decision_policy(),
            DecisionPolicy::BudgetAware { .. }
        ));
        assert_eq!(
            config.retrain_argv().unwrap().unwrap(),
            vec!["python3", "retrain.py", "--epochs", "2"]
        );
    }

    #[test]
    fn test_unknown_dataset_is_config_error() {
        let config = SessionConfig {
            dataset: "OPPORTUNITY".into(),
            ..base()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnknownDataset(_))
        ));
    }

    #[test]
    fn test_invalid_values_rejected() {
        for config in [
            SessionConfig {
                query_budget: 0,
                ..base()
            },
            SessionConfig {
                retrain_cadence: 0,
                ..base()
            },
            SessionConfig {
                threshold: -1.0,
                ..base()
            },
            SessionConfig {
                threshold: f64::NAN,
                ..base()
            },
            SessionConfig {
                retrain_command: Some("train \"unterminated".into()),
                ..base()
            },
        ] {
            assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        }
    }

    #[test]
    fn test_malformed_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "query_budget = \"lots\"").unwrap();
        assert!(matches!(
            SessionConfig::load(Some(&path)),
            Err(ConfigError::Parse { .. })
        ));
        assert!(matches!(
            SessionConfig::load(Some(&dir.path().join("missing.toml"))),
            Err(ConfigError::Io { .. })
        ));
    }

    #[test]
    fn test_default_paths_follow_dataset() {
        let config = SessionConfig {
            log_dir: PathBuf::from("out"),
            ..base()
        };
        assert_eq!(
            config.predictions_path(Dataset::Aras),
            PathBuf::from("data/aras_predictions.jsonl")
        );
        assert_eq!(
            config.annotations_path(Dataset::Casas),
            PathBuf::from("out/annotations_casas.jsonl")
        );
    }

    #[test]
    fn test_policy_kind_from_str() {
        assert_eq!("budget-aware".parse::<PolicyKind>().unwrap(), PolicyKind::BudgetAware);
        assert!("random".parse::<PolicyKind>().is_err());
    }
}
