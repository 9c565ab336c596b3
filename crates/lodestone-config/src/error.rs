//! Configuration error types

use std::path::PathBuf;
use thiserror::Error;

use lodestone_types::QuorumConfigError;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse TOML config at {path}: {source}")]
    ParseError {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Invalid quorum configuration: {0}")]
    Quorum(#[from] QuorumConfigError),

    #[error("XDG directory error: {0}")]
    XdgError(String),
}
