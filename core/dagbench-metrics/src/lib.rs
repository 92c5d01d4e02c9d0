//! Log parsing and performance aggregation for dagbench runs
//!
//! Turns the raw text emitted by primaries, workers and clients into
//! numeric series, matches transaction submissions to confirmations, and
//! reduces everything to a persisted benchmark result.

pub mod aggregate;
pub mod errors;
pub mod latency;
pub mod parser;
pub mod records;

pub use aggregate::{BenchmarkResult, LatencyStats, RawCounts, ResultAggregator, ResultStore, RunWindow};
pub use errors::{MetricsError, MetricsResult};
pub use latency::{LatencyMatcher, MatchedSamples};
pub use parser::{LogParser, ParsedLog};
pub use records::{LogEvent, LogRecord, Role};
