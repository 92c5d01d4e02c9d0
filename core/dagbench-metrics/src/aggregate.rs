//! Result aggregation and persistence
//!
//! Reduces parsed records to throughput and latency statistics over the
//! steady-state portion of the run window, and writes one immutable,
//! timestamped result record per run. Re-runs produce new records; nothing
//! is ever updated in place.

use crate::errors::{MetricsError, MetricsResult};
use crate::latency::LatencyMatcher;
use crate::records::{LogEvent, LogRecord};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// Wall-clock window of one run, with the margins excluded from throughput
#[derive(Debug, Clone, Copy)]
pub struct RunWindow {
    /// Run start
    pub start: DateTime<Utc>,
    /// Full run duration in seconds
    pub duration_secs: u64,
    /// Startup margin excluded from the steady state
    pub warmup_secs: u64,
    /// Shutdown margin excluded from the steady state
    pub cooldown_secs: u64,
}

impl RunWindow {
    /// Bounds of the steady-state window
    pub fn steady(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        let start = self.start + Duration::seconds(self.warmup_secs as i64);
        let end = self.start
            + Duration::seconds((self.duration_secs.saturating_sub(self.cooldown_secs)) as i64);
        (start, end)
    }

    /// Steady-state duration in seconds
    pub fn steady_secs(&self) -> u64 {
        self.duration_secs
            .saturating_sub(self.warmup_secs)
            .saturating_sub(self.cooldown_secs)
    }
}

/// Run metadata the aggregator cannot derive from the logs alone
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    /// Unique run identifier
    pub run_id: String,
    /// Crash faults configured for the run
    pub faults: usize,
    /// Nodes planned for the run
    pub nodes_total: usize,
    /// Nodes that were excluded or whose logs could not be collected
    pub nodes_degraded: usize,
    /// Malformed lines encountered during parsing
    pub malformed_records: usize,
}

/// Latency statistics over matched pairs only
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LatencyStats {
    pub mean_ms: f64,
    pub median_ms: f64,
    pub p99_ms: f64,
    /// Number of matched pairs behind the statistics
    pub samples: usize,
}

/// Raw event counts backing the headline numbers
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawCounts {
    pub submitted: usize,
    pub confirmed_total: usize,
    pub confirmed_in_window: usize,
    pub committed_batches: usize,
    /// Bytes across committed batches whose size was observed
    pub committed_bytes: u64,
    pub highest_round: u64,
}

/// Aggregate outcome of one benchmark run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkResult {
    pub run_id: String,
    pub start_time: DateTime<Utc>,
    pub duration_secs: u64,
    pub throughput_tx_per_sec: f64,
    pub latency: LatencyStats,
    /// Submitted but never confirmed before the run ended
    pub in_flight: usize,
    pub faults: usize,
    pub nodes_total: usize,
    pub nodes_degraded: usize,
    pub malformed_records: usize,
    pub raw: RawCounts,
}

impl BenchmarkResult {
    /// Human-readable banner, appended to run reports
    pub fn summary(&self) -> String {
        format!(
            "\n\
             -----------------------------------------\n\
             SUMMARY\n\
             -----------------------------------------\n\
             + CONFIG:\n\
             Run id: {}\n\
             Faults: {} node(s)\n\
             Committee size: {} node(s)\n\
             Degraded nodes: {} node(s)\n\
             Execution time: {} s\n\
             \n\
             + RESULTS:\n\
             Throughput: {:.0} tx/s\n\
             Committed: {} batch(es), {} B\n\
             Latency (mean): {:.0} ms\n\
             Latency (median): {:.0} ms\n\
             Latency (p99): {:.0} ms\n\
             In-flight transactions: {}\n\
             Malformed log records: {}\n\
             -----------------------------------------\n",
            self.run_id,
            self.faults,
            self.nodes_total,
            self.nodes_degraded,
            self.duration_secs,
            self.throughput_tx_per_sec,
            self.raw.committed_batches,
            self.raw.committed_bytes,
            self.latency.mean_ms,
            self.latency.median_ms,
            self.latency.p99_ms,
            self.in_flight,
            self.malformed_records,
        )
    }
}

/// Reduces parsed records into a `BenchmarkResult`
pub struct ResultAggregator;

impl ResultAggregator {
    /// Aggregate all records of one run over its window.
    ///
    /// Throughput counts confirmations inside the steady-state window only;
    /// latency statistics cover matched submission/confirmation pairs.
    pub fn aggregate(records: &[LogRecord], window: &RunWindow, ctx: &RunContext) -> BenchmarkResult {
        let matched = LatencyMatcher::match_samples(records);
        let (steady_start, steady_end) = window.steady();

        // A re-collected or duplicated log repeats confirmation lines for
        // the same transaction; each transaction counts once, at its
        // earliest confirmation.
        let mut confirmations: BTreeMap<(u32, u64), DateTime<Utc>> = BTreeMap::new();
        for record in records {
            if let LogEvent::TxConfirmed { id } = record.event {
                confirmations
                    .entry((record.node_index, id))
                    .and_modify(|ts| *ts = (*ts).min(record.timestamp))
                    .or_insert(record.timestamp);
            }
        }
        let confirmed_total = confirmations.len();
        let confirmed_in_window = confirmations
            .values()
            .filter(|ts| **ts >= steady_start && **ts < steady_end)
            .count();

        let mut committed_digests = BTreeSet::new();
        let mut batch_sizes: BTreeMap<String, u64> = BTreeMap::new();
        let mut highest_round = 0u64;
        for record in records {
            match &record.event {
                LogEvent::BatchCommitted { round, digest } => {
                    committed_digests.insert(digest.clone());
                    highest_round = highest_round.max(*round);
                }
                LogEvent::BatchSize { digest, bytes } => {
                    batch_sizes.entry(digest.clone()).or_insert(*bytes);
                }
                LogEvent::RoundAdvanced { round } => highest_round = highest_round.max(*round),
                _ => {}
            }
        }
        let committed_bytes = committed_digests
            .iter()
            .filter_map(|digest| batch_sizes.get(digest))
            .sum::<u64>();

        let steady_secs = window.steady_secs();
        let throughput = if steady_secs > 0 {
            confirmed_in_window as f64 / steady_secs as f64
        } else {
            0.0
        };

        let result = BenchmarkResult {
            run_id: ctx.run_id.clone(),
            start_time: window.start,
            duration_secs: window.duration_secs,
            throughput_tx_per_sec: throughput,
            latency: Self::latency_stats(&matched.latencies()),
            in_flight: matched.in_flight,
            faults: ctx.faults,
            nodes_total: ctx.nodes_total,
            nodes_degraded: ctx.nodes_degraded,
            malformed_records: ctx.malformed_records,
            raw: RawCounts {
                submitted: matched.submitted,
                confirmed_total,
                confirmed_in_window,
                committed_batches: committed_digests.len(),
                committed_bytes,
                highest_round,
            },
        };
        info!(
            run_id = %result.run_id,
            throughput = result.throughput_tx_per_sec,
            samples = result.latency.samples,
            "aggregated run"
        );
        result
    }

    fn latency_stats(latencies: &[f64]) -> LatencyStats {
        if latencies.is_empty() {
            return LatencyStats::default();
        }
        let mut sorted = latencies.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));

        let mean = sorted.iter().sum::<f64>() / sorted.len() as f64;
        let median = if sorted.len() % 2 == 0 {
            (sorted[sorted.len() / 2 - 1] + sorted[sorted.len() / 2]) / 2.0
        } else {
            sorted[sorted.len() / 2]
        };
        // Nearest-rank percentile.
        let rank = ((sorted.len() as f64) * 0.99).ceil() as usize;
        let p99 = sorted[rank.clamp(1, sorted.len()) - 1];

        LatencyStats {
            mean_ms: mean * 1_000.0,
            median_ms: median * 1_000.0,
            p99_ms: p99 * 1_000.0,
            samples: sorted.len(),
        }
    }
}

/// Append-only store of timestamped result records
pub struct ResultStore {
    dir: PathBuf,
}

impl ResultStore {
    /// Store writing under the given directory (typically `results/`)
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    /// Persist one result under a unique, timestamped name.
    ///
    /// The file is created exclusively; concurrent runs can never land in
    /// the same record.
    pub fn persist(&self, result: &BenchmarkResult) -> MetricsResult<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let name = format!(
            "result-{}-{}.json",
            result.start_time.format("%Y%m%d-%H%M%S"),
            result.run_id
        );
        let path = self.dir.join(name);
        let file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::AlreadyExists {
                    MetricsError::RecordExists(path.display().to_string())
                } else {
                    MetricsError::IoError(e)
                }
            })?;
        serde_json::to_writer_pretty(file, result)?;
        info!(path = %path.display(), "persisted benchmark result");
        Ok(path)
    }

    /// Directory the store writes into
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}
