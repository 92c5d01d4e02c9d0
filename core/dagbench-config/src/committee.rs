//! Committee and protocol parameters
//!
//! The committee file describes cluster membership and must be byte-identical
//! on every node of a run: each authority decides quorums from its own copy,
//! so any divergence silently splits the cluster. Authorities are kept in a
//! `BTreeMap` and serialized with `serde_json` so repeated builds of the same
//! inputs produce the same bytes.

use crate::errors::{ConfigError, ConfigResult};
use crate::identity::NodeIdentity;
use crate::topology::ClusterTopology;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::info;

/// One cluster member entitled to participate in the protocol
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authority {
    /// Public key identifying this authority
    pub public_key: String,

    /// Host address
    pub host: String,

    /// Primary listening port
    pub primary_port: u16,

    /// Worker listening ports
    pub worker_ports: Vec<u16>,

    /// Voting power; uniform across the committee
    pub stake: u64,
}

/// The agreed-upon set of authorities for one run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Committee {
    /// Authorities keyed by node index
    pub authorities: BTreeMap<u32, Authority>,
}

impl Committee {
    /// Number of authorities
    pub fn size(&self) -> usize {
        self.authorities.len()
    }

    /// Deterministic byte encoding; identical inputs give identical bytes
    pub fn to_bytes(&self) -> ConfigResult<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Write the committee file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> ConfigResult<()> {
        fs::write(path.as_ref(), self.to_bytes()?)?;
        Ok(())
    }

    /// Read a committee file back
    pub fn load<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let raw = fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&raw)?)
    }
}

/// Flat protocol tuning record, identical across all nodes of a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameters {
    /// Maximum batch size in bytes
    pub batch_size: usize,

    /// Maximum delay before sealing a non-full batch, in milliseconds
    pub max_batch_delay_ms: u64,

    /// Maximum header size in bytes
    pub header_size: usize,

    /// Maximum delay before sealing a non-full header, in milliseconds
    pub max_header_delay_ms: u64,

    /// Garbage collection depth in rounds
    pub gc_depth: u64,

    /// Delay between sync retries, in milliseconds
    pub sync_retry_delay_ms: u64,

    /// Number of nodes asked on each sync retry
    pub sync_retry_nodes: usize,
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            batch_size: 500_000,
            max_batch_delay_ms: 100,
            header_size: 1_000,
            max_header_delay_ms: 100,
            gc_depth: 50,
            sync_retry_delay_ms: 10_000,
            sync_retry_nodes: 3,
        }
    }
}

impl Parameters {
    /// Range sanity; no cross-field validation is needed
    pub fn validate(&self) -> ConfigResult<()> {
        if self.batch_size == 0 {
            return Err(ConfigError::InvalidParameters("batch size must be positive".into()));
        }
        if self.max_batch_delay_ms == 0 {
            return Err(ConfigError::InvalidParameters("batch delay must be positive".into()));
        }
        if self.header_size == 0 {
            return Err(ConfigError::InvalidParameters("header size must be positive".into()));
        }
        if self.max_header_delay_ms == 0 {
            return Err(ConfigError::InvalidParameters("header delay must be positive".into()));
        }
        Ok(())
    }

    /// Write the parameters file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> ConfigResult<()> {
        fs::write(path.as_ref(), serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }

    /// Read a parameters file back
    pub fn load<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let raw = fs::read_to_string(path.as_ref())?;
        let parameters: Self = serde_json::from_str(&raw)?;
        parameters.validate()?;
        Ok(parameters)
    }
}

/// Sole constructor of committee and parameters files
pub struct CommitteeBuilder;

impl CommitteeBuilder {
    /// Combine identities with their network placement.
    ///
    /// Fails if identities and topology do not align one-to-one.
    pub fn build(
        identities: &[NodeIdentity],
        topology: &ClusterTopology,
        tuning: Parameters,
    ) -> ConfigResult<(Committee, Parameters)> {
        if identities.len() != topology.size() {
            return Err(ConfigError::TopologyMismatch(format!(
                "{} identities for {} topology entries",
                identities.len(),
                topology.size()
            )));
        }
        tuning.validate()?;

        let mut authorities = BTreeMap::new();
        for (identity, placement) in identities.iter().zip(topology.placements()) {
            if identity.index != placement.index {
                return Err(ConfigError::TopologyMismatch(format!(
                    "identity {} paired with placement {}",
                    identity.index, placement.index
                )));
            }
            authorities.insert(
                placement.index,
                Authority {
                    public_key: identity.public_key.clone(),
                    host: placement.host.clone(),
                    primary_port: placement.primary_port,
                    worker_ports: placement.worker_ports.clone(),
                    stake: 1,
                },
            );
        }

        let committee = Committee { authorities };
        info!(size = committee.size(), "assembled committee");
        Ok((committee, tuning))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::TestbedSettings;
    use std::path::PathBuf;

    fn fixture(n: usize) -> (Vec<NodeIdentity>, ClusterTopology) {
        let settings = TestbedSettings {
            key_path: "/tmp/id_rsa".into(),
            username: "ubuntu".into(),
            base_port: 9000,
            remote_workdir: "dagbench".into(),
            node_binary: "./node".into(),
            client_binary: "./benchmark_client".into(),
            hosts: (0..n).map(|i| format!("host{i}.example.com")).collect(),
        };
        let topology = ClusterTopology::from_settings(&settings, n, 1).unwrap();
        let identities = (0..n as u32)
            .map(|i| NodeIdentity {
                index: i,
                public_key: format!("pk-{i}"),
                key_file: PathBuf::from(format!("/tmp/node-{i}.json")),
            })
            .collect();
        (identities, topology)
    }

    #[test]
    fn committee_covers_every_index() {
        let (identities, topology) = fixture(5);
        let (committee, _) =
            CommitteeBuilder::build(&identities, &topology, Parameters::default()).unwrap();

        assert_eq!(committee.size(), 5);
        let indices: Vec<u32> = committee.authorities.keys().copied().collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4]);
        assert_eq!(committee.authorities[&2].public_key, "pk-2");
        assert_eq!(committee.authorities[&2].host, "host2.example.com");
    }

    #[test]
    fn identical_inputs_give_identical_bytes() {
        let (identities, topology) = fixture(4);
        let (first, _) =
            CommitteeBuilder::build(&identities, &topology, Parameters::default()).unwrap();
        let (second, _) =
            CommitteeBuilder::build(&identities, &topology, Parameters::default()).unwrap();

        assert_eq!(first.to_bytes().unwrap(), second.to_bytes().unwrap());
    }

    #[test]
    fn reject_misaligned_identities() {
        let (mut identities, topology) = fixture(3);
        identities.pop();
        let err = CommitteeBuilder::build(&identities, &topology, Parameters::default())
            .unwrap_err();
        assert!(matches!(err, ConfigError::TopologyMismatch(_)));

        let (mut identities, topology) = fixture(3);
        identities[0].index = 9;
        let err = CommitteeBuilder::build(&identities, &topology, Parameters::default())
            .unwrap_err();
        assert!(matches!(err, ConfigError::TopologyMismatch(_)));
    }

    #[test]
    fn committee_file_round_trip() {
        let (identities, topology) = fixture(2);
        let (committee, parameters) =
            CommitteeBuilder::build(&identities, &topology, Parameters::default()).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let committee_path = dir.path().join("committee.json");
        let parameters_path = dir.path().join("parameters.json");

        committee.save(&committee_path).unwrap();
        parameters.save(&parameters_path).unwrap();

        assert_eq!(Committee::load(&committee_path).unwrap(), committee);
        assert_eq!(Parameters::load(&parameters_path).unwrap(), parameters);
    }

    #[test]
    fn reject_degenerate_parameters() {
        let bad = Parameters { batch_size: 0, ..Default::default() };
        assert!(bad.validate().is_err());

        let bad = Parameters { max_header_delay_ms: 0, ..Default::default() };
        assert!(bad.validate().is_err());
    }
}
