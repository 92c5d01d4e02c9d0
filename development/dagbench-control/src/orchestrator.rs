//! Remote process orchestration
//!
//! Each node moves through its own state machine, independent of the
//! others. Processes run inside named detached sessions so they survive
//! the controlling connection closing; the handle returned by `start` is
//! the only thing needed to signal them later. Stops are idempotent.

use crate::errors::{ControlError, ControlResult};
use crate::remote::{run_checked, RemoteChannel};
use dagbench_config::{NodePlacement, RemoteTarget};
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Role of one launched process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessRole {
    Primary,
    Worker(usize),
    Client,
}

/// Per-node lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    NotStarted,
    PrimaryRunning,
    WorkersRunning,
    ClientRunning,
    Stopped,
    Failed,
}

impl NodeState {
    fn name(&self) -> &'static str {
        match self {
            NodeState::NotStarted => "NotStarted",
            NodeState::PrimaryRunning => "PrimaryRunning",
            NodeState::WorkersRunning => "WorkersRunning",
            NodeState::ClientRunning => "ClientRunning",
            NodeState::Stopped => "Stopped",
            NodeState::Failed => "Failed",
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(self, NodeState::Stopped | NodeState::Failed)
    }

    fn can_advance_to(&self, to: NodeState) -> bool {
        match (self, to) {
            // Crash or unreachable host, from any non-terminal state.
            (from, NodeState::Failed) => !from.is_terminal(),
            (NodeState::NotStarted, NodeState::PrimaryRunning) => true,
            (NodeState::PrimaryRunning, NodeState::WorkersRunning) => true,
            (NodeState::WorkersRunning, NodeState::ClientRunning) => true,
            // Shutdown can hit a node whose client never started.
            (NodeState::PrimaryRunning, NodeState::Stopped) => true,
            (NodeState::WorkersRunning, NodeState::Stopped) => true,
            (NodeState::ClientRunning, NodeState::Stopped) => true,
            _ => false,
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Handle to one detached remote process
pub struct ProcessHandle {
    pub node_index: u32,
    pub role: ProcessRole,
    /// Detached session name; doubles as the log file stem
    pub session: String,
    target: RemoteTarget,
    stopped: Mutex<bool>,
}

impl ProcessHandle {
    pub fn is_stopped(&self) -> bool {
        *self.stopped.lock()
    }
}

/// Starts and stops the distributed processes of one run
pub struct ProcessOrchestrator {
    channel: Arc<dyn RemoteChannel>,
    remote_workdir: String,
    node_binary: String,
    client_binary: String,
    ready_attempts: u32,
    ready_delay: Duration,
    states: Mutex<BTreeMap<u32, NodeState>>,
    /// Handles in start order; shutdown walks them in reverse
    handles: Mutex<Vec<Arc<ProcessHandle>>>,
}

impl ProcessOrchestrator {
    pub fn new(
        channel: Arc<dyn RemoteChannel>,
        remote_workdir: String,
        node_binary: String,
        client_binary: String,
    ) -> Self {
        Self {
            channel,
            remote_workdir,
            node_binary,
            client_binary,
            ready_attempts: 10,
            ready_delay: Duration::from_millis(500),
            states: Mutex::new(BTreeMap::new()),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Override the primary readiness poll (tests use a tight loop)
    pub fn with_ready_poll(mut self, attempts: u32, delay: Duration) -> Self {
        self.ready_attempts = attempts.max(1);
        self.ready_delay = delay;
        self
    }

    /// Current state of a node
    pub fn node_state(&self, node: u32) -> NodeState {
        *self.states.lock().get(&node).unwrap_or(&NodeState::NotStarted)
    }

    /// Handles in start order
    pub fn handles(&self) -> Vec<Arc<ProcessHandle>> {
        self.handles.lock().clone()
    }

    fn advance(&self, node: u32, to: NodeState) -> ControlResult<()> {
        let mut states = self.states.lock();
        let from = *states.get(&node).unwrap_or(&NodeState::NotStarted);
        if !from.can_advance_to(to) {
            return Err(ControlError::InvalidTransition {
                node,
                from: from.name(),
                to: to.name(),
            });
        }
        debug!(node, %from, %to, "node state transition");
        states.insert(node, to);
        Ok(())
    }

    /// Boot the primary and workers of one node, in that order.
    ///
    /// The primary must bind its listening port before the node's workers
    /// start; a node that never gets there is marked `Failed` and excluded,
    /// without affecting the rest of the fleet.
    pub async fn start_node(
        &self,
        placement: &NodePlacement,
        target: &RemoteTarget,
    ) -> ControlResult<()> {
        let i = placement.index;

        let primary_cmd = format!(
            "{} run --keys .node-{i}.json --committee .committee.json \
             --store .db-{i} --parameters .parameters.json primary",
            self.node_binary
        );
        let result = self
            .launch(target, i, ProcessRole::Primary, &format!("primary-{i}"), &primary_cmd)
            .await;
        if let Err(e) = result {
            let _ = self.advance(i, NodeState::Failed);
            return Err(e);
        }
        self.advance(i, NodeState::PrimaryRunning)?;

        if let Err(e) = self.wait_primary_ready(target, placement).await {
            let _ = self.advance(i, NodeState::Failed);
            return Err(e);
        }

        for (id, _port) in placement.worker_ports.iter().enumerate() {
            let worker_cmd = format!(
                "{} run --keys .node-{i}.json --committee .committee.json \
                 --store .db-{i}-{id} --parameters .parameters.json worker --id {id}",
                self.node_binary
            );
            let result = self
                .launch(
                    target,
                    i,
                    ProcessRole::Worker(id),
                    &format!("worker-{i}-{id}"),
                    &worker_cmd,
                )
                .await;
            if let Err(e) = result {
                let _ = self.advance(i, NodeState::Failed);
                return Err(e);
            }
        }
        self.advance(i, NodeState::WorkersRunning)?;
        info!(node = i, host = %target.host, "node booted");
        Ok(())
    }

    /// Boot the load generator for one node. Callers start every client
    /// only after the whole cluster is up: load generated before the
    /// cluster can process it is lost measurement.
    pub async fn start_client(
        &self,
        placement: &NodePlacement,
        target: &RemoteTarget,
        rate_share: u64,
        tx_size: usize,
        peers: &[String],
    ) -> ControlResult<()> {
        let i = placement.index;
        let address = format!("{}:{}", placement.host, placement.worker_ports[0]);
        let client_cmd = format!(
            "{} {address} --size {tx_size} --rate {rate_share} --nodes {}",
            self.client_binary,
            peers.join(" ")
        );
        let result = self
            .launch(target, i, ProcessRole::Client, &format!("client-{i}"), &client_cmd)
            .await;
        if let Err(e) = result {
            let _ = self.advance(i, NodeState::Failed);
            return Err(e);
        }
        self.advance(i, NodeState::ClientRunning)?;
        Ok(())
    }

    async fn launch(
        &self,
        target: &RemoteTarget,
        node: u32,
        role: ProcessRole,
        session: &str,
        command: &str,
    ) -> ControlResult<Arc<ProcessHandle>> {
        let workdir = &self.remote_workdir;
        // POSIX redirection only; the remote shell behind tmux may not be
        // bash.
        let wrapped = format!(
            "cd {workdir} && mkdir -p logs && \
             tmux new -d -s {session} '{command} 2>&1 | tee logs/{session}.log'"
        );
        run_checked(self.channel.as_ref(), target, &wrapped)
            .await
            .map_err(|e| ControlError::LaunchFailed {
                host: target.host.clone(),
                session: session.to_string(),
                reason: e.to_string(),
            })?;

        let handle = Arc::new(ProcessHandle {
            node_index: node,
            role,
            session: session.to_string(),
            target: target.clone(),
            stopped: Mutex::new(false),
        });
        self.handles.lock().push(Arc::clone(&handle));
        debug!(session, host = %target.host, "launched detached process");
        Ok(handle)
    }

    /// Ready means the primary has bound its listening port.
    async fn wait_primary_ready(
        &self,
        target: &RemoteTarget,
        placement: &NodePlacement,
    ) -> ControlResult<()> {
        let probe = format!("ss -ltn | grep -q ':{} '", placement.primary_port);
        for attempt in 0..self.ready_attempts {
            match self.channel.run(target, &probe).await {
                Ok(output) if output.success => return Ok(()),
                Ok(_) => {}
                Err(e) => warn!(host = %target.host, error = %e, "readiness probe failed"),
            }
            if attempt + 1 < self.ready_attempts {
                tokio::time::sleep(self.ready_delay).await;
            }
        }
        Err(ControlError::LaunchFailed {
            host: target.host.clone(),
            session: format!("primary-{}", placement.index),
            reason: format!(
                "primary never bound port {} after {} probes",
                placement.primary_port, self.ready_attempts
            ),
        })
    }

    /// Terminate one detached process. Stopping an already-stopped handle
    /// is a no-op with no remote side effect.
    pub async fn stop(&self, handle: &ProcessHandle) -> ControlResult<()> {
        {
            let stopped = handle.stopped.lock();
            if *stopped {
                return Ok(());
            }
        }
        // Killing a session that already exited is fine.
        let command = format!("tmux kill-session -t {} 2>/dev/null || true", handle.session);
        run_checked(self.channel.as_ref(), &handle.target, &command).await?;
        *handle.stopped.lock() = true;
        debug!(session = %handle.session, "stopped detached process");
        Ok(())
    }

    /// Stop everything, one role tier at a time (clients first, then
    /// workers, then primaries) so no load is generated against a
    /// half-shutdown cluster. Within a tier the handles belong to
    /// independent nodes, so stops fan out with bounded parallelism.
    /// Best-effort: one unreachable node does not keep the rest running.
    pub async fn stop_all(&self) -> Vec<(String, ControlResult<()>)> {
        const STOP_PARALLELISM: usize = 8;

        let handles = self.handles();
        let mut results = Vec::with_capacity(handles.len());
        for tier in [2u8, 1, 0] {
            let tier_handles: Vec<Arc<ProcessHandle>> = handles
                .iter()
                .filter(|h| Self::shutdown_tier(h.role) == tier)
                .cloned()
                .collect();
            let outcomes = stream::iter(tier_handles)
                .map(|handle| async move {
                    let outcome = self.stop(&handle).await;
                    if let Err(e) = &outcome {
                        warn!(session = %handle.session, error = %e, "stop failed");
                    }
                    (handle.session.clone(), outcome)
                })
                .buffer_unordered(STOP_PARALLELISM)
                .collect::<Vec<_>>()
                .await;
            results.extend(outcomes);
        }

        let mut states = self.states.lock();
        for handle in &handles {
            if handle.is_stopped() {
                let state = states.entry(handle.node_index).or_insert(NodeState::NotStarted);
                if !state.is_terminal() {
                    *state = NodeState::Stopped;
                }
            }
        }
        info!(stopped = results.iter().filter(|(_, r)| r.is_ok()).count(), "shutdown broadcast done");
        results
    }

    /// Shutdown order: higher tiers stop first
    fn shutdown_tier(role: ProcessRole) -> u8 {
        match role {
            ProcessRole::Primary => 0,
            ProcessRole::Worker(_) => 1,
            ProcessRole::Client => 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockChannel;

    fn placement(i: u32) -> NodePlacement {
        NodePlacement {
            index: i,
            host: format!("host{i}"),
            primary_port: 9000 + i as u16 * 2,
            worker_ports: vec![9001 + i as u16 * 2],
        }
    }

    fn target(i: u32) -> RemoteTarget {
        RemoteTarget {
            host: format!("host{i}"),
            user: "ubuntu".into(),
            key_path: "/tmp/id_rsa".into(),
        }
    }

    fn orchestrator(channel: Arc<MockChannel>) -> ProcessOrchestrator {
        ProcessOrchestrator::new(
            channel,
            "dagbench".into(),
            "./node".into(),
            "./benchmark_client".into(),
        )
        .with_ready_poll(2, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn node_walks_through_its_states() {
        let channel = Arc::new(MockChannel::default());
        let orch = orchestrator(channel.clone());

        assert_eq!(orch.node_state(0), NodeState::NotStarted);
        orch.start_node(&placement(0), &target(0)).await.unwrap();
        assert_eq!(orch.node_state(0), NodeState::WorkersRunning);

        orch.start_client(&placement(0), &target(0), 1000, 512, &["host0:9001".into()])
            .await
            .unwrap();
        assert_eq!(orch.node_state(0), NodeState::ClientRunning);

        orch.stop_all().await;
        assert_eq!(orch.node_state(0), NodeState::Stopped);
    }

    #[tokio::test]
    async fn stop_is_idempotent_with_no_remote_side_effect() {
        let channel = Arc::new(MockChannel::default());
        let orch = orchestrator(channel.clone());
        orch.start_node(&placement(0), &target(0)).await.unwrap();

        let handle = orch.handles().into_iter().next().unwrap();
        orch.stop(&handle).await.unwrap();
        let runs_after_first = channel.run_count();

        // Second stop returns success without touching the remote.
        orch.stop(&handle).await.unwrap();
        assert_eq!(channel.run_count(), runs_after_first);
        assert!(handle.is_stopped());
    }

    #[tokio::test]
    async fn launch_failure_marks_the_node_failed() {
        let channel = Arc::new(MockChannel::default());
        channel.set_unreachable("host1");
        let orch = orchestrator(channel.clone());

        let err = orch.start_node(&placement(1), &target(1)).await.unwrap_err();
        assert!(matches!(err, ControlError::LaunchFailed { .. }));
        assert_eq!(orch.node_state(1), NodeState::Failed);

        // Other nodes are unaffected.
        orch.start_node(&placement(0), &target(0)).await.unwrap();
        assert_eq!(orch.node_state(0), NodeState::WorkersRunning);
    }

    #[tokio::test]
    async fn shutdown_stops_clients_then_workers_then_primaries() {
        let channel = Arc::new(MockChannel::default());
        let orch = orchestrator(channel.clone());
        for i in 0..2u32 {
            orch.start_node(&placement(i), &target(i)).await.unwrap();
            orch.start_client(&placement(i), &target(i), 1000, 512, &["host0:9001".into()])
                .await
                .unwrap();
        }

        let results = orch.stop_all().await;
        assert_eq!(results.len(), 6);
        let tier_of = |session: &str| {
            if session.starts_with("client") {
                2
            } else if session.starts_with("worker") {
                1
            } else {
                0
            }
        };
        let tiers: Vec<u8> = results.iter().map(|(s, _)| tier_of(s)).collect();
        let mut sorted = tiers.clone();
        sorted.sort_by(|a, b| b.cmp(a));
        assert_eq!(tiers, sorted, "clients stop before workers, workers before primaries");
    }

    #[tokio::test]
    async fn launch_uses_posix_redirection() {
        let channel = Arc::new(MockChannel::default());
        let orch = orchestrator(channel.clone());
        orch.start_node(&placement(0), &target(0)).await.unwrap();

        let launch = channel
            .runs()
            .into_iter()
            .map(|(_, command)| command)
            .find(|c| c.contains("tmux new -d -s primary-0"))
            .unwrap();
        assert!(launch.contains("2>&1 | tee logs/primary-0.log"));
        assert!(!launch.contains("|&"));
    }

    #[test]
    fn failed_is_reachable_from_any_non_terminal_state() {
        assert!(NodeState::NotStarted.can_advance_to(NodeState::Failed));
        assert!(NodeState::ClientRunning.can_advance_to(NodeState::Failed));
        assert!(!NodeState::Stopped.can_advance_to(NodeState::Failed));
        assert!(!NodeState::Failed.can_advance_to(NodeState::Failed));
        assert!(!NodeState::NotStarted.can_advance_to(NodeState::WorkersRunning));
    }
}
