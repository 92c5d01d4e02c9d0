//! Configuration and credential distribution
//!
//! Works node-by-node with bounded parallelism. Trust provisioning is
//! best-effort fleet-wide; a config push failure excludes only that node
//! from the run. Either way the caller gets one outcome per node and
//! decides what the degradation means.

use crate::errors::{ControlError, ControlResult};
use crate::remote::{run_checked, RemoteChannel};
use dagbench_config::RemoteTarget;
use futures::stream::{self, StreamExt};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Per-node outcome map, keyed by node index
pub type NodeOutcomes = BTreeMap<u32, ControlResult<()>>;

/// Files every node receives, plus the per-node key files
#[derive(Debug, Clone)]
pub struct PushPlan {
    /// Local committee file; byte-identical copy goes to every node
    pub committee_file: PathBuf,
    /// Local parameters file
    pub parameters_file: PathBuf,
    /// Key file per node, index-aligned with the targets
    pub key_files: Vec<PathBuf>,
    /// Remote working directory to push into
    pub remote_workdir: String,
}

/// Copies run configuration to the fleet
pub struct Distributor {
    channel: Arc<dyn RemoteChannel>,
    parallelism: usize,
}

impl Distributor {
    pub fn new(channel: Arc<dyn RemoteChannel>, parallelism: usize) -> Self {
        Self { channel, parallelism: parallelism.max(1) }
    }

    /// Install a transport credential on every node.
    ///
    /// Overwrite semantics: re-provisioning an already-provisioned node
    /// replaces the credential rather than appending to it. A failure on
    /// one node is recorded and the rollout continues.
    pub async fn provision_trust(
        &self,
        targets: &[RemoteTarget],
        credential: &Path,
    ) -> NodeOutcomes {
        let remote_path = format!(
            ".ssh/{}",
            credential
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "dagbench_key".into())
        );

        let results = stream::iter(targets.iter().cloned().enumerate())
            .map(|(index, target)| {
                let channel = Arc::clone(&self.channel);
                let credential = credential.to_path_buf();
                let remote_path = remote_path.clone();
                async move {
                    let outcome =
                        Self::provision_one(channel.as_ref(), &target, &credential, &remote_path)
                            .await;
                    if let Err(e) = &outcome {
                        warn!(host = %target.host, error = %e, "trust provisioning failed");
                    }
                    (index as u32, outcome)
                }
            })
            .buffer_unordered(self.parallelism)
            .collect::<Vec<_>>()
            .await;

        let outcomes: NodeOutcomes = results.into_iter().collect();
        let ok = outcomes.values().filter(|r| r.is_ok()).count();
        info!(provisioned = ok, total = outcomes.len(), "trust provisioning finished");
        outcomes
    }

    async fn provision_one(
        channel: &dyn RemoteChannel,
        target: &RemoteTarget,
        credential: &Path,
        remote_path: &str,
    ) -> ControlResult<()> {
        if !credential.exists() {
            return Err(ControlError::CredentialMissing {
                host: target.host.clone(),
                reason: format!("local credential {} not found", credential.display()),
            });
        }
        run_checked(channel, target, "mkdir -p .ssh").await?;
        channel.upload(target, credential, remote_path).await?;
        run_checked(channel, target, &format!("chmod 600 {remote_path}")).await?;
        Ok(())
    }

    /// Push the committee, parameters and each node's own key file.
    ///
    /// A failed push excludes that node from the run; the exclusion is
    /// logged and reported through the outcome map.
    pub async fn push_configs(&self, targets: &[RemoteTarget], plan: &PushPlan) -> NodeOutcomes {
        let results = stream::iter(targets.iter().cloned().enumerate())
            .map(|(index, target)| {
                let channel = Arc::clone(&self.channel);
                let plan = plan.clone();
                async move {
                    let outcome =
                        Self::push_one(channel.as_ref(), &target, index as u32, &plan).await;
                    if let Err(e) = &outcome {
                        warn!(
                            host = %target.host,
                            node = index,
                            error = %e,
                            "config push failed; node excluded from the run"
                        );
                    }
                    (index as u32, outcome)
                }
            })
            .buffer_unordered(self.parallelism)
            .collect::<Vec<_>>()
            .await;

        results.into_iter().collect()
    }

    async fn push_one(
        channel: &dyn RemoteChannel,
        target: &RemoteTarget,
        index: u32,
        plan: &PushPlan,
    ) -> ControlResult<()> {
        let workdir = &plan.remote_workdir;
        run_checked(channel, target, &format!("mkdir -p {workdir} {workdir}/logs")).await?;
        channel
            .upload(target, &plan.committee_file, &format!("{workdir}/.committee.json"))
            .await?;
        channel
            .upload(target, &plan.parameters_file, &format!("{workdir}/.parameters.json"))
            .await?;
        let key_file = plan.key_files.get(index as usize).ok_or_else(|| {
            ControlError::TransportError {
                host: target.host.clone(),
                reason: format!("no key file for node {index}"),
            }
        })?;
        channel
            .upload(target, key_file, &format!("{workdir}/.node-{index}.json"))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockChannel;
    use std::fs;

    fn targets(n: usize) -> Vec<RemoteTarget> {
        (0..n)
            .map(|i| RemoteTarget {
                host: format!("host{i}"),
                user: "ubuntu".into(),
                key_path: "/tmp/id_rsa".into(),
            })
            .collect()
    }

    #[tokio::test]
    async fn trust_provisioning_continues_past_failures() {
        let dir = tempfile::tempdir().unwrap();
        let credential = dir.path().join("dagbench_key.pub");
        fs::write(&credential, "ssh-ed25519 AAAA").unwrap();

        let channel = Arc::new(MockChannel::default());
        channel.set_unreachable("host1");

        let distributor = Distributor::new(channel.clone(), 4);
        let outcomes = distributor.provision_trust(&targets(3), &credential).await;

        assert_eq!(outcomes.len(), 3);
        assert!(outcomes[&0].is_ok());
        assert!(outcomes[&1].is_err());
        assert!(outcomes[&2].is_ok());
    }

    #[tokio::test]
    async fn missing_local_credential_fails_every_node() {
        let channel = Arc::new(MockChannel::default());
        let distributor = Distributor::new(channel.clone(), 2);
        let outcomes = distributor
            .provision_trust(&targets(2), Path::new("/nonexistent/key.pub"))
            .await;

        assert!(outcomes.values().all(|r| {
            matches!(r, Err(ControlError::CredentialMissing { .. }))
        }));
        assert_eq!(channel.upload_count(), 0);
    }

    #[tokio::test]
    async fn push_sends_shared_files_and_only_the_owned_key() {
        let dir = tempfile::tempdir().unwrap();
        let committee = dir.path().join("committee.json");
        let parameters = dir.path().join("parameters.json");
        fs::write(&committee, "{}").unwrap();
        fs::write(&parameters, "{}").unwrap();
        let key_files: Vec<_> = (0..2)
            .map(|i| {
                let path = dir.path().join(format!("node-{i}.json"));
                fs::write(&path, "{}").unwrap();
                path
            })
            .collect();

        let channel = Arc::new(MockChannel::default());
        let distributor = Distributor::new(channel.clone(), 2);
        let plan = PushPlan {
            committee_file: committee,
            parameters_file: parameters,
            key_files,
            remote_workdir: "dagbench".into(),
        };
        let outcomes = distributor.push_configs(&targets(2), &plan).await;
        assert!(outcomes.values().all(|r| r.is_ok()));

        let uploads = channel.uploads();
        // Each node gets committee, parameters and exactly its own key.
        assert!(uploads.contains(&("host0".into(), "dagbench/.committee.json".into())));
        assert!(uploads.contains(&("host0".into(), "dagbench/.node-0.json".into())));
        assert!(uploads.contains(&("host1".into(), "dagbench/.node-1.json".into())));
        assert!(!uploads.contains(&("host0".into(), "dagbench/.node-1.json".into())));
        assert!(!uploads.contains(&("host1".into(), "dagbench/.node-0.json".into())));
    }

    #[tokio::test]
    async fn push_failure_is_isolated_to_the_node() {
        let dir = tempfile::tempdir().unwrap();
        let committee = dir.path().join("committee.json");
        let parameters = dir.path().join("parameters.json");
        fs::write(&committee, "{}").unwrap();
        fs::write(&parameters, "{}").unwrap();
        let key_files: Vec<_> = (0..3)
            .map(|i| {
                let path = dir.path().join(format!("node-{i}.json"));
                fs::write(&path, "{}").unwrap();
                path
            })
            .collect();

        let channel = Arc::new(MockChannel::default());
        channel.set_unreachable("host0");

        let distributor = Distributor::new(channel.clone(), 1);
        let plan = PushPlan {
            committee_file: committee,
            parameters_file: parameters,
            key_files,
            remote_workdir: "dagbench".into(),
        };
        let outcomes = distributor.push_configs(&targets(3), &plan).await;

        assert!(outcomes[&0].is_err());
        assert!(outcomes[&1].is_ok());
        assert!(outcomes[&2].is_ok());
    }
}
