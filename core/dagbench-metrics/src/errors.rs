//! Error types for metrics processing

use thiserror::Error;

/// Metrics-stage errors
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Result record with this name already exists; results are append-only
    #[error("Result record already exists: {0}")]
    RecordExists(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Result type for metrics operations
pub type MetricsResult<T> = Result<T, MetricsError>;
