//! Session error types
//!
//! Startup errors abort construction: a session that fails to build never
//! touches the committee or the annotator. Per-sample failures are logged by
//! the controller and do not appear here, except lock-state violations,
//! which mean the controller's own invariants are broken.

use std::path::PathBuf;

use coordination::{BufferError, SinkError, UnknownDataset};
use thiserror::Error;

/// Result type alias for configuration loading
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Result type alias for session operations
pub type SessionResult<T> = Result<T, SessionError>;

/// Errors raised while loading or validating session configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Dataset selector is not one of the supported datasets
    #[error(transparent)]
    UnknownDataset(#[from] UnknownDataset),

    /// Config file could not be read
    #[error("Failed to read config file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid TOML for a session
    #[error("Failed to parse config file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// A value is out of range
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Errors that stop a session
#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    ResultLog(#[from] SinkError),

    #[error("Failed to open annotation store {}: {source}", .path.display())]
    AnnotationStore {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to load committee predictions: {0:#}")]
    Committee(anyhow::Error),

    /// The annotation buffer was used out of protocol
    #[error("Annotation buffer protocol violated: {0}")]
    LockState(#[source] BufferError),
}
