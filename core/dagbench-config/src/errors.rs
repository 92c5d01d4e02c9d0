//! Error types for run configuration
//!
//! Everything in this crate runs before any remote action, so these errors
//! are fatal for the whole run: a malformed or partial committee would
//! corrupt every subsequent measurement.

use std::path::PathBuf;
use thiserror::Error;

/// Configuration-stage errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Settings file missing, unreadable or malformed
    #[error("Invalid settings: {0}")]
    SettingsError(String),

    /// External key generation binary failed
    #[error("Key generation failed for node {index}: {reason}")]
    KeyGenerationFailed { index: u32, reason: String },

    /// Key file already exists and overwrite was not requested
    #[error("Key file already exists: {0}")]
    KeyFileExists(PathBuf),

    /// Identities and topology do not align one-to-one
    #[error("Topology mismatch: {0}")]
    TopologyMismatch(String),

    /// Protocol parameter outside its sane range
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;
