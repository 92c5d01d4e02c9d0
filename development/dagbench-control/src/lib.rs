//! Remote orchestration and end-to-end pipeline for dagbench
//!
//! Drives a fleet of machines through one benchmark run: distribute the
//! configuration, boot primaries, workers and clients in order, hold the
//! run window, shut everything down, pull the logs back and reduce them to
//! a persisted result.

pub mod collector;
pub mod distributor;
pub mod errors;
pub mod orchestrator;
pub mod remote;
pub mod runner;

pub use collector::{CollectionReport, LogCollector, NodeCollection};
pub use distributor::{Distributor, NodeOutcomes, PushPlan};
pub use errors::{ControlError, ControlResult};
pub use orchestrator::{NodeState, ProcessHandle, ProcessOrchestrator, ProcessRole};
pub use remote::{with_retry, CommandOutput, RemoteChannel, SshChannel};
pub use runner::{BenchmarkRunner, RunOptions};
