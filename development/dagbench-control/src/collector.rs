//! Log retrieval
//!
//! Pulls the log files produced by the remote processes back into a local
//! directory. Files already present locally are skipped unless a forced
//! re-download is requested. Collection is best-effort: an unreachable
//! node is reported, never allowed to abort the rest of the fleet.

use crate::errors::{ControlError, ControlResult};
use crate::remote::RemoteChannel;
use dagbench_config::{NodePlacement, RemoteTarget};
use futures::stream::{self, StreamExt};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// What was retrieved for one node
#[derive(Debug, Clone, Default)]
pub struct NodeCollection {
    /// Local paths of all files accounted for (fetched or already present)
    pub files: Vec<PathBuf>,
    /// Files actually transferred this time
    pub transferred: usize,
    /// Files skipped because they were already present
    pub skipped: usize,
}

/// Per-node collection outcome for one run
#[derive(Debug, Default)]
pub struct CollectionReport {
    pub nodes: BTreeMap<u32, ControlResult<NodeCollection>>,
}

impl CollectionReport {
    /// True when every node's logs were accounted for
    pub fn is_complete(&self) -> bool {
        self.nodes.values().all(|r| r.is_ok())
    }

    /// Number of nodes whose collection failed
    pub fn failed_nodes(&self) -> usize {
        self.nodes.values().filter(|r| r.is_err()).count()
    }
}

/// Fetches remote log files into a local results directory
pub struct LogCollector {
    channel: Arc<dyn RemoteChannel>,
    remote_workdir: String,
}

impl LogCollector {
    pub fn new(channel: Arc<dyn RemoteChannel>, remote_workdir: String) -> Self {
        Self { channel, remote_workdir }
    }

    /// Expected log file names for one node: one per role
    pub fn expected_files(placement: &NodePlacement) -> Vec<String> {
        let i = placement.index;
        let mut names = vec![format!("primary-{i}.log")];
        for id in 0..placement.worker_ports.len() {
            names.push(format!("worker-{i}-{id}.log"));
        }
        names.push(format!("client-{i}.log"));
        names
    }

    /// Collect logs from every node, fully in parallel.
    ///
    /// `force` re-downloads files that already exist locally.
    pub async fn collect(
        &self,
        nodes: &[(NodePlacement, RemoteTarget)],
        local_dir: &Path,
        force: bool,
    ) -> ControlResult<CollectionReport> {
        std::fs::create_dir_all(local_dir)?;

        let results = stream::iter(nodes.iter().cloned())
            .map(|(placement, target)| {
                let channel = Arc::clone(&self.channel);
                let workdir = self.remote_workdir.clone();
                let local_dir = local_dir.to_path_buf();
                async move {
                    let outcome = Self::collect_one(
                        channel.as_ref(),
                        &workdir,
                        &placement,
                        &target,
                        &local_dir,
                        force,
                    )
                    .await;
                    if let Err(e) = &outcome {
                        warn!(host = %target.host, error = %e, "log collection failed");
                    }
                    (placement.index, outcome)
                }
            })
            .buffer_unordered(nodes.len().max(1))
            .collect::<Vec<_>>()
            .await;

        let report = CollectionReport { nodes: results.into_iter().collect() };
        info!(
            complete = report.is_complete(),
            failed = report.failed_nodes(),
            "log collection finished"
        );
        Ok(report)
    }

    async fn collect_one(
        channel: &dyn RemoteChannel,
        workdir: &str,
        placement: &NodePlacement,
        target: &RemoteTarget,
        local_dir: &Path,
        force: bool,
    ) -> ControlResult<NodeCollection> {
        let mut collection = NodeCollection::default();
        for name in Self::expected_files(placement) {
            let local = local_dir.join(&name);
            if local.exists() && !force {
                collection.skipped += 1;
                collection.files.push(local);
                continue;
            }
            let remote = format!("{workdir}/logs/{name}");
            channel
                .download(target, &remote, &local)
                .await
                .map_err(|e| ControlError::CollectionFailed {
                    host: target.host.clone(),
                    reason: e.to_string(),
                })?;
            collection.transferred += 1;
            collection.files.push(local);
        }
        Ok(collection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockChannel;

    fn fleet(n: u32) -> Vec<(NodePlacement, RemoteTarget)> {
        (0..n)
            .map(|i| {
                (
                    NodePlacement {
                        index: i,
                        host: format!("host{i}"),
                        primary_port: 9000,
                        worker_ports: vec![9001],
                    },
                    RemoteTarget {
                        host: format!("host{i}"),
                        user: "ubuntu".into(),
                        key_path: "/tmp/id_rsa".into(),
                    },
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn second_collection_performs_zero_transfers() {
        let dir = tempfile::tempdir().unwrap();
        let channel = Arc::new(MockChannel::default());
        let collector = LogCollector::new(channel.clone(), "dagbench".into());
        let nodes = fleet(2);

        let first = collector.collect(&nodes, dir.path(), false).await.unwrap();
        assert!(first.is_complete());
        let transferred: usize = first
            .nodes
            .values()
            .map(|r| r.as_ref().unwrap().transferred)
            .sum();
        assert_eq!(transferred, 6); // primary + worker + client per node
        assert_eq!(channel.download_count(), 6);

        let second = collector.collect(&nodes, dir.path(), false).await.unwrap();
        assert!(second.is_complete());
        let transferred: usize = second
            .nodes
            .values()
            .map(|r| r.as_ref().unwrap().transferred)
            .sum();
        assert_eq!(transferred, 0);
        assert_eq!(channel.download_count(), 6, "no new transfers");
    }

    #[tokio::test]
    async fn force_redownloads_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        let channel = Arc::new(MockChannel::default());
        let collector = LogCollector::new(channel.clone(), "dagbench".into());
        let nodes = fleet(1);

        collector.collect(&nodes, dir.path(), false).await.unwrap();
        collector.collect(&nodes, dir.path(), true).await.unwrap();
        assert_eq!(channel.download_count(), 6);
    }

    #[tokio::test]
    async fn unreachable_node_degrades_only_itself() {
        let dir = tempfile::tempdir().unwrap();
        let channel = Arc::new(MockChannel::default());
        channel.set_unreachable("host1");
        let collector = LogCollector::new(channel.clone(), "dagbench".into());
        let nodes = fleet(3);

        let report = collector.collect(&nodes, dir.path(), false).await.unwrap();
        assert!(!report.is_complete());
        assert_eq!(report.failed_nodes(), 1);
        assert!(matches!(
            report.nodes[&1],
            Err(ControlError::CollectionFailed { .. })
        ));
        assert!(report.nodes[&0].is_ok());
        assert!(report.nodes[&2].is_ok());
    }
}
