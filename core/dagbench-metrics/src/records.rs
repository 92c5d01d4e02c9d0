//! Parsed log records
//!
//! One `LogRecord` per recognized log line; never mutated after creation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Process role that produced a log line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Coordinates ordering
    Primary,
    /// Disseminates payloads
    Worker,
    /// External load generator
    Client,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Primary => write!(f, "primary"),
            Role::Worker => write!(f, "worker"),
            Role::Client => write!(f, "client"),
        }
    }
}

/// Recognized event kinds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogEvent {
    /// A primary/worker created a batch
    BatchCreated { round: u64, digest: String },

    /// A batch was committed
    BatchCommitted { round: u64, digest: String },

    /// The protocol advanced to a new round
    RoundAdvanced { round: u64 },

    /// A worker sealed a batch of the given size
    BatchSize { digest: String, bytes: u64 },

    /// A client submitted a sample transaction
    TxSubmitted { id: u64 },

    /// A client observed confirmation of a sample transaction
    TxConfirmed { id: u64 },
}

/// One parsed line from a remote process's output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Role of the emitting process
    pub role: Role,

    /// Index of the node that produced the line
    pub node_index: u32,

    /// Timestamp of the line
    pub timestamp: DateTime<Utc>,

    /// What happened
    pub event: LogEvent,
}
