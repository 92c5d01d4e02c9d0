//! Submission/confirmation matching
//!
//! End-to-end latency pairs each sample submission with its confirmation by
//! transaction id. Sample ids are only unique within one client, so pairs
//! are keyed by (node, id). Submissions whose confirmation never showed up
//! (the run ended first, or the batch was lost) are counted as in-flight
//! instead of being dropped, so the latency distribution is not biased
//! toward fast transactions.

use crate::records::{LogEvent, LogRecord};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// One matched submission/confirmation pair
#[derive(Debug, Clone, PartialEq)]
pub struct LatencySample {
    /// Node whose client submitted the transaction
    pub node_index: u32,
    /// Sample transaction id within that client
    pub tx_id: u64,
    /// Confirmation time
    pub confirmed_at: DateTime<Utc>,
    /// End-to-end latency in seconds
    pub seconds: f64,
}

/// Matched latency samples plus the unmatched remainder
#[derive(Debug, Clone, Default)]
pub struct MatchedSamples {
    /// Matched pairs, ordered by (node, id)
    pub samples: Vec<LatencySample>,
    /// Submitted but never confirmed
    pub in_flight: usize,
    /// Total distinct submissions observed
    pub submitted: usize,
}

impl MatchedSamples {
    /// Latency values in seconds
    pub fn latencies(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.seconds).collect()
    }
}

/// Pairs submissions with confirmations across all client records
pub struct LatencyMatcher;

impl LatencyMatcher {
    /// Match sample transactions by shared (node, id), keeping the earliest
    /// timestamp when an id appears more than once on either side.
    pub fn match_samples(records: &[LogRecord]) -> MatchedSamples {
        let mut submissions: BTreeMap<(u32, u64), DateTime<Utc>> = BTreeMap::new();
        let mut confirmations: BTreeMap<(u32, u64), DateTime<Utc>> = BTreeMap::new();

        for record in records {
            match &record.event {
                LogEvent::TxSubmitted { id } => {
                    submissions
                        .entry((record.node_index, *id))
                        .and_modify(|ts| *ts = (*ts).min(record.timestamp))
                        .or_insert(record.timestamp);
                }
                LogEvent::TxConfirmed { id } => {
                    confirmations
                        .entry((record.node_index, *id))
                        .and_modify(|ts| *ts = (*ts).min(record.timestamp))
                        .or_insert(record.timestamp);
                }
                _ => {}
            }
        }

        let submitted = submissions.len();
        let mut samples = Vec::new();
        let mut in_flight = 0;
        for ((node_index, tx_id), sent) in submissions {
            match confirmations.get(&(node_index, tx_id)) {
                Some(&confirmed) if confirmed >= sent => {
                    let seconds = (confirmed - sent)
                        .to_std()
                        .map(|d| d.as_secs_f64())
                        .unwrap_or_default();
                    samples.push(LatencySample {
                        node_index,
                        tx_id,
                        confirmed_at: confirmed,
                        seconds,
                    });
                }
                // A confirmation before its submission means clock skew we
                // cannot repair; the sample stays unmatched.
                _ => in_flight += 1,
            }
        }

        MatchedSamples { samples, in_flight, submitted }
    }
}
