//! Unified error types for Harbormaster

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::manifest::TargetKind;
use crate::sickbay::probe::ProbeError;

/// Main error type for Harbormaster operations
#[derive(Error, Debug)]
pub enum Error {
    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // Config errors
    #[error("Failed to read config file '{path}': {source}")]
    ConfigRead { path: PathBuf, source: io::Error },

    #[error("Failed to write config file '{path}': {source}")]
    ConfigWrite { path: PathBuf, source: io::Error },

    #[error("Failed to parse config: {0}")]
    ConfigParse(#[from] serde_json::Error),

    #[error("Config validation failed: {0}")]
    ConfigValidation(String),

    // Target errors
    #[error("{kind} '{name}' not found")]
    TargetNotFound { kind: TargetKind, name: String },

    // Probe errors
    #[error("Probe failed: {0}")]
    Probe(#[from] ProbeError),

    // Service manager errors
    #[error("Command '{command}' failed: {message}")]
    CommandFailed { command: String, message: String },

    #[error("Command '{command}' timed out after {seconds} seconds")]
    CommandTimeout { command: String, seconds: u64 },

    // Remediation errors
    #[error("Restart of {kind} '{name}' failed: {message}")]
    Remediation {
        kind: TargetKind,
        name: String,
        message: String,
    },

    // Engine errors
    #[error("Monitor thread could not be spawned: {0}")]
    Spawn(String),

    #[error("Invalid monitor transition: {0}")]
    Lifecycle(String),

    #[error("Monitor is busy: {0}")]
    Busy(String),
}

/// Result type alias for Harbormaster operations
pub type Result<T> = std::result::Result<T, Error>;
