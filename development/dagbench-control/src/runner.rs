//! End-to-end benchmark pipeline
//!
//! Wires the stages together: identities, committee, distribution, launch,
//! run window, shutdown, collection, parsing, aggregation. Node-stage
//! failures degrade single nodes; the final result reports how many nodes
//! fully participated so the operator can judge whether to trust the
//! numbers.

use crate::collector::LogCollector;
use crate::distributor::{Distributor, PushPlan};
use crate::errors::{ControlError, ControlResult};
use crate::orchestrator::{NodeState, ProcessOrchestrator};
use crate::remote::RemoteChannel;
use chrono::{DateTime, Utc};
use dagbench_config::{
    BenchParameters, ClusterTopology, CommitteeBuilder, IdentityGenerator, Parameters,
    RemoteTarget, TestbedSettings,
};
use dagbench_metrics::aggregate::{ResultAggregator, ResultStore, RunContext, RunWindow};
use dagbench_metrics::{BenchmarkResult, LogParser, ParsedLog, Role};
use futures::stream::{self, StreamExt};
use std::collections::BTreeSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Operator-facing toggles for one run
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub bench: BenchParameters,
    /// Protocol tuning pushed to every node
    pub tuning: Parameters,
    /// Re-download logs that already exist locally
    pub force_collect: bool,
    /// Aggregate but do not persist the result record
    pub skip_persist: bool,
    /// Credential to install on every node before the run, if any
    pub provision_credential: Option<PathBuf>,
    /// Regenerate key files even if they already exist
    pub overwrite_keys: bool,
    /// Cap on simultaneous in-flight remote operations
    pub parallelism: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            bench: BenchParameters::default(),
            tuning: Parameters::default(),
            force_collect: false,
            skip_persist: false,
            provision_credential: None,
            overwrite_keys: false,
            parallelism: 8,
        }
    }
}

/// Drives one benchmark run end to end
pub struct BenchmarkRunner {
    settings: TestbedSettings,
    channel: Arc<dyn RemoteChannel>,
    /// Local working directory: key files, committee, `logs/`, `results/`
    local_dir: PathBuf,
}

impl BenchmarkRunner {
    pub fn new(
        settings: TestbedSettings,
        channel: Arc<dyn RemoteChannel>,
        local_dir: PathBuf,
    ) -> Self {
        Self { settings, channel, local_dir }
    }

    fn logs_dir(&self) -> PathBuf {
        self.local_dir.join("logs")
    }

    fn results_dir(&self) -> PathBuf {
        self.local_dir.join("results")
    }

    /// Run the whole pipeline and return the aggregated result.
    ///
    /// Ctrl-c at any point after the first launch still broadcasts stop
    /// before returning, so an interrupted run leaves nothing behind.
    pub async fn run(&self, opts: &RunOptions) -> ControlResult<BenchmarkResult> {
        self.run_with_shutdown(opts, async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
    }

    /// Like [`run`](Self::run) with an explicit abort signal.
    pub async fn run_with_shutdown<S>(
        &self,
        opts: &RunOptions,
        shutdown: S,
    ) -> ControlResult<BenchmarkResult>
    where
        S: Future<Output = ()>,
    {
        opts.bench.validate()?;
        let topology =
            ClusterTopology::from_settings(&self.settings, opts.bench.nodes, opts.bench.workers)?;
        let targets = topology.targets(&self.settings);

        // Per-node identities, then the committee every node receives.
        let generator = IdentityGenerator::new(&self.settings.node_binary);
        let mut identities = Vec::with_capacity(topology.size());
        for placement in topology.placements() {
            let key_file = self.local_dir.join(format!(".node-{}.json", placement.index));
            identities.push(
                generator
                    .generate(placement.index, &key_file, opts.overwrite_keys)
                    .await?,
            );
        }
        let (committee, parameters) =
            CommitteeBuilder::build(&identities, &topology, opts.tuning.clone())?;
        let committee_file = self.local_dir.join(".committee.json");
        let parameters_file = self.local_dir.join(".parameters.json");
        committee.save(&committee_file)?;
        parameters.save(&parameters_file)?;

        let distributor = Distributor::new(Arc::clone(&self.channel), opts.parallelism);
        if let Some(credential) = &opts.provision_credential {
            let outcomes = distributor.provision_trust(&targets, credential).await;
            let failed = outcomes.values().filter(|r| r.is_err()).count();
            if failed > 0 {
                warn!(failed, "trust provisioning incomplete; continuing best-effort");
            }
        }

        // Config push failures exclude that node from the run.
        let plan = PushPlan {
            committee_file,
            parameters_file,
            key_files: identities.iter().map(|id| id.key_file.clone()).collect(),
            remote_workdir: self.settings.remote_workdir.clone(),
        };
        let push_outcomes = distributor.push_configs(&targets, &plan).await;
        let mut degraded: BTreeSet<u32> = push_outcomes
            .iter()
            .filter(|(_, r)| r.is_err())
            .map(|(i, _)| *i)
            .collect();

        // The last `faults` participating nodes stay down: they are the
        // crash faults the run is measuring tolerance of.
        let participating: Vec<u32> = topology
            .placements()
            .iter()
            .map(|p| p.index)
            .filter(|i| !degraded.contains(i))
            .collect();
        if participating.len() <= opts.bench.faults {
            return Err(ControlError::NoParticipants);
        }
        let booted: BTreeSet<u32> = participating
            [..participating.len() - opts.bench.faults]
            .iter()
            .copied()
            .collect();

        let orchestrator = Arc::new(ProcessOrchestrator::new(
            Arc::clone(&self.channel),
            self.settings.remote_workdir.clone(),
            self.settings.node_binary.clone(),
            self.settings.client_binary.clone(),
        ));

        // Launch and hold the window under the abort signal; every exit
        // path broadcasts stop so nothing keeps running remotely.
        let outcome = tokio::select! {
            result = self.launch_and_hold(&orchestrator, &topology, &targets, &booted, opts, &mut degraded) => result,
            _ = shutdown => Err(ControlError::Aborted),
        };
        let _ = orchestrator.stop_all().await;
        let run_start = outcome?;

        // Collect and reduce.
        let collector =
            LogCollector::new(Arc::clone(&self.channel), self.settings.remote_workdir.clone());
        let fleet: Vec<_> = topology
            .placements()
            .iter()
            .zip(&targets)
            .filter(|(p, _)| booted.contains(&p.index))
            .map(|(p, t)| (p.clone(), t.clone()))
            .collect();
        let report = collector.collect(&fleet, &self.logs_dir(), opts.force_collect).await?;
        for (index, outcome) in &report.nodes {
            if outcome.is_err() {
                degraded.insert(*index);
            }
        }

        let parsed = parse_local_logs(&self.logs_dir())?;
        // Anchor the window to the logs' own clock; the controller may be
        // skewed from the fleet.
        let start = parsed
            .records
            .iter()
            .map(|r| r.timestamp)
            .min()
            .unwrap_or(run_start);
        let window = RunWindow {
            start,
            duration_secs: opts.bench.duration_secs,
            warmup_secs: opts.bench.warmup_secs,
            cooldown_secs: opts.bench.cooldown_secs,
        };
        let ctx = RunContext {
            run_id: new_run_id(),
            faults: opts.bench.faults,
            nodes_total: opts.bench.nodes,
            nodes_degraded: degraded.len(),
            malformed_records: parsed.malformed,
        };
        let result = ResultAggregator::aggregate(&parsed.records, &window, &ctx);
        if !opts.skip_persist {
            ResultStore::new(self.results_dir()).persist(&result)?;
        }
        Ok(result)
    }

    /// Boot the fleet, start the clients, hold the run window. Returns
    /// the window start; the caller broadcasts stop regardless of how
    /// this future ends.
    async fn launch_and_hold(
        &self,
        orchestrator: &Arc<ProcessOrchestrator>,
        topology: &ClusterTopology,
        targets: &[RemoteTarget],
        booted: &BTreeSet<u32>,
        opts: &RunOptions,
        degraded: &mut BTreeSet<u32>,
    ) -> ControlResult<DateTime<Utc>> {
        // Boot primaries and workers across the fleet, bounded fan-out.
        info!(nodes = booted.len(), "booting primaries and workers");
        let boot_results = stream::iter(
            topology
                .placements()
                .iter()
                .zip(targets)
                .filter(|(p, _)| booted.contains(&p.index))
                .map(|(p, t)| (p.clone(), t.clone())),
        )
        .map(|(placement, target)| {
            let orchestrator = Arc::clone(orchestrator);
            async move {
                let index = placement.index;
                (index, orchestrator.start_node(&placement, &target).await)
            }
        })
        .buffer_unordered(opts.parallelism.max(1))
        .collect::<Vec<_>>()
        .await;
        for (index, result) in boot_results {
            if result.is_err() {
                degraded.insert(index);
            }
        }

        // All primaries are up before any client generates load.
        let running: Vec<u32> = booted
            .iter()
            .copied()
            .filter(|i| orchestrator.node_state(*i) == NodeState::WorkersRunning)
            .collect();
        if running.is_empty() {
            return Err(ControlError::NoParticipants);
        }
        let peers: Vec<String> = topology
            .placements()
            .iter()
            .filter(|p| running.contains(&p.index))
            .flat_map(|p| {
                p.worker_ports
                    .iter()
                    .map(|port| format!("{}:{port}", p.host))
                    .collect::<Vec<_>>()
            })
            .collect();
        let rate_share = opts.bench.rate.div_ceil(running.len() as u64);

        info!(clients = running.len(), rate_share, "booting clients");
        for (placement, target) in topology.placements().iter().zip(targets) {
            if !running.contains(&placement.index) {
                continue;
            }
            if let Err(e) = orchestrator
                .start_client(placement, target, rate_share, opts.bench.tx_size, &peers)
                .await
            {
                warn!(node = placement.index, error = %e, "client launch failed");
                degraded.insert(placement.index);
            }
        }

        let run_start = Utc::now();
        info!(duration = opts.bench.duration_secs, "benchmark running");
        tokio::time::sleep(Duration::from_secs(opts.bench.duration_secs)).await;
        Ok(run_start)
    }

    /// Collect-only: fetch logs for the configured fleet, nothing else.
    pub async fn collect_only(
        &self,
        bench: &BenchParameters,
        force: bool,
    ) -> ControlResult<crate::collector::CollectionReport> {
        let topology =
            ClusterTopology::from_settings(&self.settings, bench.nodes, bench.workers)?;
        let targets = topology.targets(&self.settings);
        let fleet: Vec<_> = topology
            .placements()
            .iter()
            .cloned()
            .zip(targets)
            .collect();
        let collector =
            LogCollector::new(Arc::clone(&self.channel), self.settings.remote_workdir.clone());
        collector.collect(&fleet, &self.logs_dir(), force).await
    }

    /// Process already-local logs without touching any remote machine.
    ///
    /// The run window is inferred from the records themselves: start at the
    /// earliest timestamp, end at the latest.
    pub fn report_only(
        &self,
        bench: &BenchParameters,
        skip_persist: bool,
    ) -> ControlResult<BenchmarkResult> {
        let parsed = parse_local_logs(&self.logs_dir())?;
        let (start, duration_secs) = match (
            parsed.records.iter().map(|r| r.timestamp).min(),
            parsed.records.iter().map(|r| r.timestamp).max(),
        ) {
            (Some(first), Some(last)) => {
                (first, (last - first).num_seconds().max(1) as u64)
            }
            _ => (Utc::now(), bench.duration_secs),
        };
        let window = RunWindow {
            start,
            duration_secs,
            warmup_secs: bench.warmup_secs.min(duration_secs / 4),
            cooldown_secs: bench.cooldown_secs.min(duration_secs / 4),
        };
        let ctx = RunContext {
            run_id: new_run_id(),
            faults: bench.faults,
            nodes_total: bench.nodes,
            nodes_degraded: 0,
            malformed_records: parsed.malformed,
        };
        let result = ResultAggregator::aggregate(&parsed.records, &window, &ctx);
        if !skip_persist {
            ResultStore::new(self.results_dir()).persist(&result)?;
        }
        Ok(result)
    }

    /// Ask every host which detached sessions are still alive.
    pub async fn status(&self) -> Vec<(String, String)> {
        let topology = match ClusterTopology::from_settings(
            &self.settings,
            self.settings.size(),
            1,
        ) {
            Ok(t) => t,
            Err(_) => return Vec::new(),
        };
        let mut statuses = Vec::new();
        for target in topology.targets(&self.settings) {
            let line = match self
                .channel
                .run(&target, "tmux ls 2>/dev/null || echo 'no sessions'")
                .await
            {
                Ok(output) => output.stdout.trim().to_string(),
                Err(e) => format!("unreachable: {e}"),
            };
            statuses.push((target.host, line));
        }
        statuses
    }

    /// Best-effort remote kill across the fleet, optionally wiping logs
    /// and node databases.
    pub async fn cleanup(&self, delete_logs: bool) -> Vec<(String, ControlResult<()>)> {
        let workdir = &self.settings.remote_workdir;
        let mut command = String::from("tmux kill-server 2>/dev/null || true");
        if delete_logs {
            command.push_str(&format!(" ; rm -rf {workdir}/logs {workdir}/.db-*"));
        }
        let topology = match ClusterTopology::from_settings(
            &self.settings,
            self.settings.size(),
            1,
        ) {
            Ok(t) => t,
            Err(e) => return vec![("settings".into(), Err(e.into()))],
        };
        let mut results = Vec::new();
        for target in topology.targets(&self.settings) {
            let outcome = self.channel.run(&target, &command).await.map(|_| ());
            if let Err(e) = &outcome {
                warn!(host = %target.host, error = %e, "cleanup failed");
            }
            results.push((target.host, outcome));
        }
        results
    }
}

fn new_run_id() -> String {
    format!("{:08x}", rand::random::<u32>())
}

/// Parse every recognizable log file in a directory. Role and node index
/// come from the file name (`primary-0.log`, `worker-0-1.log`,
/// `client-2.log`); anything else is ignored.
pub fn parse_local_logs(dir: &Path) -> ControlResult<ParsedLog> {
    let mut parsed = ParsedLog::default();
    if !dir.exists() {
        return Ok(parsed);
    }
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some((role, node_index)) = classify_log_file(name) else {
            continue;
        };
        let text = std::fs::read_to_string(&path)?;
        parsed.extend(LogParser::parse(&text, role, node_index));
    }
    Ok(parsed)
}

fn classify_log_file(name: &str) -> Option<(Role, u32)> {
    let stem = name.strip_suffix(".log")?;
    let (prefix, rest) = stem.split_once('-')?;
    let role = match prefix {
        "primary" => Role::Primary,
        "worker" => Role::Worker,
        "client" => Role::Client,
        _ => return None,
    };
    // Worker files carry a trailing worker id: worker-<node>-<id>.log
    let node = rest.split('-').next()?.parse().ok()?;
    Some((role, node))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockChannel;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    fn settings(dir: &Path, hosts: usize) -> TestbedSettings {
        // Stub node binary so identity generation works offline. Written
        // with fs::write so no handle stays open when it is spawned.
        let node = dir.join("node");
        fs::write(
            &node,
            "#!/bin/sh\n\
             out=\"$3\"\n\
             base=$(basename \"$out\")\n\
             printf '{\"name\": \"pk-%s\", \"secret\": \"sk\"}' \"$base\" > \"$out\"\n",
        )
        .unwrap();
        fs::set_permissions(&node, fs::Permissions::from_mode(0o755)).unwrap();

        TestbedSettings {
            key_path: "/tmp/id_rsa".into(),
            username: "ubuntu".into(),
            base_port: 9000,
            remote_workdir: "dagbench".into(),
            node_binary: node.display().to_string(),
            client_binary: "./benchmark_client".into(),
            hosts: (0..hosts).map(|i| format!("host{i}")).collect(),
        }
    }

    fn quick_bench(nodes: usize) -> BenchParameters {
        BenchParameters {
            nodes,
            workers: 1,
            rate: 1_000,
            tx_size: 512,
            duration_secs: 1,
            faults: 0,
            warmup_secs: 0,
            cooldown_secs: 0,
        }
    }

    #[test]
    fn log_file_names_classify_by_role_and_node() {
        assert_eq!(classify_log_file("primary-3.log"), Some((Role::Primary, 3)));
        assert_eq!(classify_log_file("worker-2-1.log"), Some((Role::Worker, 2)));
        assert_eq!(classify_log_file("client-0.log"), Some((Role::Client, 0)));
        assert_eq!(classify_log_file("debug-0.log"), None);
        assert_eq!(classify_log_file("primary-3.txt"), None);
    }

    #[tokio::test]
    async fn pipeline_completes_against_a_healthy_fleet() {
        let dir = tempfile::tempdir().unwrap();
        let channel = Arc::new(MockChannel::default());
        let runner = BenchmarkRunner::new(
            settings(dir.path(), 2),
            channel.clone(),
            dir.path().to_path_buf(),
        );

        let opts = RunOptions { bench: quick_bench(2), ..Default::default() };
        let result = runner.run(&opts).await.unwrap();

        assert_eq!(result.nodes_total, 2);
        assert_eq!(result.nodes_degraded, 0);
        // committee + parameters + key per node
        assert_eq!(channel.upload_count(), 6);
        // primary + worker + client log per node
        assert_eq!(channel.download_count(), 6);
        // Result record persisted under results/.
        assert_eq!(fs::read_dir(dir.path().join("results")).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn unreachable_node_degrades_but_does_not_abort() {
        let dir = tempfile::tempdir().unwrap();
        let channel = Arc::new(MockChannel::default());
        channel.set_unreachable("host2");
        let runner = BenchmarkRunner::new(
            settings(dir.path(), 3),
            channel.clone(),
            dir.path().to_path_buf(),
        );

        let opts = RunOptions {
            bench: quick_bench(3),
            skip_persist: true,
            ..Default::default()
        };
        let result = runner.run(&opts).await.unwrap();

        assert_eq!(result.nodes_total, 3);
        assert_eq!(result.nodes_degraded, 1);
    }

    #[tokio::test]
    async fn abort_broadcasts_stop_before_returning() {
        let dir = tempfile::tempdir().unwrap();
        let channel = Arc::new(MockChannel::default());
        let runner = BenchmarkRunner::new(
            settings(dir.path(), 1),
            channel.clone(),
            dir.path().to_path_buf(),
        );

        // Abort fires shortly after the fleet booted, long before the
        // window would expire on its own.
        let mut bench = quick_bench(1);
        bench.duration_secs = 600;
        let opts = RunOptions { bench, skip_persist: true, ..Default::default() };
        let shutdown = async {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        };
        let err = runner.run_with_shutdown(&opts, shutdown).await.unwrap_err();
        assert!(matches!(err, ControlError::Aborted));

        // primary, worker and client sessions all received a kill.
        let kills = channel
            .runs()
            .iter()
            .filter(|(_, command)| command.contains("tmux kill-session"))
            .count();
        assert_eq!(kills, 3);
    }

    #[tokio::test]
    async fn run_window_anchors_to_observed_records() {
        use chrono::TimeZone;

        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("logs");
        fs::create_dir_all(&logs).unwrap();
        // Pre-collected client log with timestamps far from the
        // controller's clock; the window must follow the log, not us.
        fs::write(
            logs.join("client-0.log"),
            "[2026-08-27T12:00:00.000Z INFO client] Sending sample transaction 1\n\
             [2026-08-27T12:00:00.500Z INFO client] Confirmed sample transaction 1\n",
        )
        .unwrap();

        let channel = Arc::new(MockChannel::default());
        let runner = BenchmarkRunner::new(
            settings(dir.path(), 1),
            channel,
            dir.path().to_path_buf(),
        );

        let opts = RunOptions {
            bench: quick_bench(1),
            skip_persist: true,
            ..Default::default()
        };
        let result = runner.run(&opts).await.unwrap();

        let anchor = chrono::Utc.with_ymd_and_hms(2026, 8, 27, 12, 0, 0).unwrap();
        assert_eq!(result.start_time, anchor);
        assert_eq!(result.raw.confirmed_in_window, 1);
    }

    #[tokio::test]
    async fn whole_fleet_down_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let channel = Arc::new(MockChannel::default());
        channel.set_unreachable("host0");
        channel.set_unreachable("host1");
        let runner = BenchmarkRunner::new(
            settings(dir.path(), 2),
            channel.clone(),
            dir.path().to_path_buf(),
        );

        let opts = RunOptions { bench: quick_bench(2), ..Default::default() };
        let err = runner.run(&opts).await.unwrap_err();
        assert!(matches!(err, ControlError::NoParticipants));
    }

    #[test]
    fn report_only_infers_the_window_from_the_logs() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("logs");
        fs::create_dir_all(&logs).unwrap();
        fs::write(
            logs.join("client-0.log"),
            "[2026-08-27T12:00:00.000Z INFO client] Sending sample transaction 1\n\
             [2026-08-27T12:00:02.000Z INFO client] Confirmed sample transaction 1\n\
             [2026-08-27T12:00:10.000Z INFO client] Sending sample transaction 2\n",
        )
        .unwrap();

        let channel = Arc::new(MockChannel::default());
        let runner = BenchmarkRunner::new(
            settings(dir.path(), 1),
            channel,
            dir.path().to_path_buf(),
        );

        let result = runner.report_only(&quick_bench(1), true).unwrap();
        assert_eq!(result.latency.samples, 1);
        assert_eq!(result.in_flight, 1);
    }
}
