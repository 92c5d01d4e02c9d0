//! Error types for remote orchestration
//!
//! Node-stage errors (launch, distribution, collection) are isolated to the
//! affected node so a single flaky machine does not invalidate a whole-fleet
//! run; only configuration-stage errors abort the pipeline.

use thiserror::Error;

/// Control-stage errors
#[derive(Error, Debug)]
pub enum ControlError {
    /// Credential could not be provisioned on one node
    #[error("Credential missing for {host}: {reason}")]
    CredentialMissing { host: String, reason: String },

    /// Remote process could not be started
    #[error("Launch failed on {host} (session {session}): {reason}")]
    LaunchFailed {
        host: String,
        session: String,
        reason: String,
    },

    /// Log collection failed for one node
    #[error("Collection failed for {host}: {reason}")]
    CollectionFailed { host: String, reason: String },

    /// Remote operation exceeded its timeout
    #[error("Remote operation on {host} timed out after {seconds}s")]
    RemoteTimeout { host: String, seconds: u64 },

    /// Remote command returned a non-zero exit status
    #[error("Remote command failed on {host}: {stderr}")]
    RemoteCommandFailed { host: String, stderr: String },

    /// Remote transport could not be spawned or reached
    #[error("Transport error for {host}: {reason}")]
    TransportError { host: String, reason: String },

    /// Illegal node state transition
    #[error("Invalid state transition for node {node}: {from} -> {to}")]
    InvalidTransition {
        node: u32,
        from: &'static str,
        to: &'static str,
    },

    /// Run aborted by the operator
    #[error("Run aborted by operator")]
    Aborted,

    /// Every node was excluded before the run could start
    #[error("No nodes available to run the benchmark")]
    NoParticipants,

    /// Configuration-stage error
    #[error(transparent)]
    Config(#[from] dagbench_config::ConfigError),

    /// Metrics-stage error
    #[error(transparent)]
    Metrics(#[from] dagbench_metrics::MetricsError),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Result type for control operations
pub type ControlResult<T> = Result<T, ControlError>;
