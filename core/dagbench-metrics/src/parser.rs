//! Structured log parsing
//!
//! Node logs are plain text; each recognized line becomes one `LogRecord`.
//! Lines that match no known pattern are skipped. Lines that match a known
//! pattern but carry values we cannot read are counted as malformed and
//! excluded, so a single corrupt line never aborts a parse.

use crate::records::{LogEvent, LogRecord, Role};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

/// Line envelope: `[<timestamp> <LEVEL> <module>] <message>`
static LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\[(\S+) +([A-Z]+) +([^\]]+)\] (.*)$").unwrap());

static BATCH_CREATED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^Created B(\d+)\(([^)]+)\)").unwrap());
static BATCH_COMMITTED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^Committed B(\d+)\(([^)]+)\)").unwrap());
static ROUND_ADVANCED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^Advanced to round (\d+)").unwrap());
static BATCH_SIZE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^Batch (\S+) contains (\d+) B").unwrap());
static TX_SUBMITTED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^Sending sample transaction (\d+)").unwrap());
static TX_CONFIRMED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^Confirmed sample transaction (\d+)").unwrap());

/// Outcome of parsing one log file
#[derive(Debug, Clone, Default)]
pub struct ParsedLog {
    /// Records in file order
    pub records: Vec<LogRecord>,
    /// Recognized lines whose values could not be read
    pub malformed: usize,
}

impl ParsedLog {
    /// Merge another parse into this one
    pub fn extend(&mut self, other: ParsedLog) {
        self.records.extend(other.records);
        self.malformed += other.malformed;
    }
}

/// Parses the text output of one remote process
pub struct LogParser;

enum Recognized {
    Event(LogEvent),
    Malformed,
    Unknown,
}

impl LogParser {
    /// Parse the full text of one log file. The text is consumed once;
    /// records are not re-derivable if the source is truncated afterwards.
    pub fn parse(text: &str, role: Role, node_index: u32) -> ParsedLog {
        let mut parsed = ParsedLog::default();
        for line in text.lines() {
            let Some(caps) = LINE.captures(line) else {
                continue;
            };
            let message = &caps[4];
            match Self::recognize(message, role) {
                Recognized::Unknown => continue,
                Recognized::Malformed => parsed.malformed += 1,
                Recognized::Event(event) => match Self::parse_timestamp(&caps[1]) {
                    Some(timestamp) => parsed.records.push(LogRecord {
                        role,
                        node_index,
                        timestamp,
                        event,
                    }),
                    None => parsed.malformed += 1,
                },
            }
        }
        debug!(
            role = %role,
            node_index,
            records = parsed.records.len(),
            malformed = parsed.malformed,
            "parsed log"
        );
        parsed
    }

    fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|ts| ts.with_timezone(&Utc))
    }

    fn recognize(message: &str, role: Role) -> Recognized {
        match role {
            Role::Primary | Role::Worker => {
                if let Some(caps) = BATCH_CREATED.captures(message) {
                    return match caps[1].parse() {
                        Ok(round) => Recognized::Event(LogEvent::BatchCreated {
                            round,
                            digest: caps[2].to_string(),
                        }),
                        Err(_) => Recognized::Malformed,
                    };
                }
                if let Some(caps) = BATCH_COMMITTED.captures(message) {
                    return match caps[1].parse() {
                        Ok(round) => Recognized::Event(LogEvent::BatchCommitted {
                            round,
                            digest: caps[2].to_string(),
                        }),
                        Err(_) => Recognized::Malformed,
                    };
                }
                if let Some(caps) = ROUND_ADVANCED.captures(message) {
                    return match caps[1].parse() {
                        Ok(round) => Recognized::Event(LogEvent::RoundAdvanced { round }),
                        Err(_) => Recognized::Malformed,
                    };
                }
                if let Some(caps) = BATCH_SIZE.captures(message) {
                    return match caps[2].parse() {
                        Ok(bytes) => Recognized::Event(LogEvent::BatchSize {
                            digest: caps[1].to_string(),
                            bytes,
                        }),
                        Err(_) => Recognized::Malformed,
                    };
                }
                Recognized::Unknown
            }
            Role::Client => {
                if let Some(caps) = TX_SUBMITTED.captures(message) {
                    return match caps[1].parse() {
                        Ok(id) => Recognized::Event(LogEvent::TxSubmitted { id }),
                        Err(_) => Recognized::Malformed,
                    };
                }
                if let Some(caps) = TX_CONFIRMED.captures(message) {
                    return match caps[1].parse() {
                        Ok(id) => Recognized::Event(LogEvent::TxConfirmed { id }),
                        Err(_) => Recognized::Malformed,
                    };
                }
                Recognized::Unknown
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_primary_events() {
        let text = "\
[2026-08-27T12:00:00.000Z INFO primary::core] Created B5(q3Zx=)\n\
[2026-08-27T12:00:01.500Z INFO primary::core] Committed B5(q3Zx=)\n\
[2026-08-27T12:00:01.600Z INFO primary::core] Advanced to round 6\n\
[2026-08-27T12:00:01.700Z DEBUG primary::sync] requesting missing parents\n";

        let parsed = LogParser::parse(text, Role::Primary, 2);
        assert_eq!(parsed.malformed, 0);
        assert_eq!(parsed.records.len(), 3);
        assert_eq!(
            parsed.records[0].event,
            LogEvent::BatchCreated { round: 5, digest: "q3Zx=".into() }
        );
        assert_eq!(
            parsed.records[1].event,
            LogEvent::BatchCommitted { round: 5, digest: "q3Zx=".into() }
        );
        assert_eq!(parsed.records[2].event, LogEvent::RoundAdvanced { round: 6 });
        assert_eq!(parsed.records[0].node_index, 2);
    }

    #[test]
    fn parse_worker_batch_sizes() {
        let text = "[2026-08-27T12:00:00.000Z INFO worker::batch_maker] Batch q3Zx= contains 512000 B\n";
        let parsed = LogParser::parse(text, Role::Worker, 0);
        assert_eq!(
            parsed.records[0].event,
            LogEvent::BatchSize { digest: "q3Zx=".into(), bytes: 512_000 }
        );
    }

    #[test]
    fn unknown_lines_are_skipped_not_fatal() {
        let text = "\
random noise without envelope\n\
[2026-08-27T12:00:00.000Z INFO client] Start sending transactions\n\
[2026-08-27T12:00:00.100Z INFO client] Sending sample transaction 1\n";

        let parsed = LogParser::parse(text, Role::Client, 0);
        assert_eq!(parsed.malformed, 0);
        assert_eq!(parsed.records.len(), 1);
        assert_eq!(parsed.records[0].event, LogEvent::TxSubmitted { id: 1 });
    }

    #[test]
    fn malformed_values_are_counted_and_excluded() {
        // Transaction id overflows u64; timestamp is unreadable.
        let text = "\
[2026-08-27T12:00:00.000Z INFO client] Sending sample transaction 99999999999999999999999\n\
[not-a-timestamp INFO client] Confirmed sample transaction 7\n\
[2026-08-27T12:00:02.000Z INFO client] Confirmed sample transaction 8\n";

        let parsed = LogParser::parse(text, Role::Client, 0);
        assert_eq!(parsed.malformed, 2);
        assert_eq!(parsed.records.len(), 1);
        assert_eq!(parsed.records[0].event, LogEvent::TxConfirmed { id: 8 });
    }

    #[test]
    fn client_patterns_are_not_recognized_in_node_logs() {
        let text = "[2026-08-27T12:00:00.000Z INFO worker] Sending sample transaction 1\n";
        let parsed = LogParser::parse(text, Role::Worker, 0);
        assert!(parsed.records.is_empty());
        assert_eq!(parsed.malformed, 0);
    }
}
