//! Cluster topology and remote addressing
//!
//! The topology is the single source of truth for which machine hosts which
//! node and on which ports; every later stage (distribution, launch, log
//! collection) takes it as input instead of carrying its own host list.

use crate::errors::{ConfigError, ConfigResult};
use crate::settings::TestbedSettings;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Network placement of a single node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodePlacement {
    /// Node index, contiguous from zero
    pub index: u32,

    /// Host address of the machine running this node
    pub host: String,

    /// Port the primary listens on
    pub primary_port: u16,

    /// Ports the workers listen on, one per worker
    pub worker_ports: Vec<u16>,
}

/// Addressing and authentication unit for one remote machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTarget {
    /// Host address
    pub host: String,

    /// Remote username
    pub user: String,

    /// Path to the SSH private key
    pub key_path: PathBuf,
}

/// Ordered set of node placements for one run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterTopology {
    placements: Vec<NodePlacement>,
}

impl ClusterTopology {
    /// Build a topology from validated placements.
    ///
    /// Indices must be contiguous `0..N-1` in order, one entry per machine.
    pub fn new(placements: Vec<NodePlacement>) -> ConfigResult<Self> {
        if placements.is_empty() {
            return Err(ConfigError::TopologyMismatch("empty topology".into()));
        }
        for (i, placement) in placements.iter().enumerate() {
            if placement.index as usize != i {
                return Err(ConfigError::TopologyMismatch(format!(
                    "placement at position {i} has index {}",
                    placement.index
                )));
            }
            if placement.worker_ports.is_empty() {
                return Err(ConfigError::TopologyMismatch(format!(
                    "node {i} has no worker ports"
                )));
            }
        }
        Ok(Self { placements })
    }

    /// Derive a topology from testbed settings: one node per host, ports
    /// assigned from `base_port` in per-node blocks.
    pub fn from_settings(
        settings: &TestbedSettings,
        nodes: usize,
        workers: usize,
    ) -> ConfigResult<Self> {
        if nodes == 0 || nodes > settings.hosts.len() {
            return Err(ConfigError::TopologyMismatch(format!(
                "requested {nodes} nodes but the testbed has {} hosts",
                settings.hosts.len()
            )));
        }
        let stride = (1 + workers) as u16;
        let placements = settings
            .hosts
            .iter()
            .take(nodes)
            .enumerate()
            .map(|(i, host)| {
                let first = settings.base_port + i as u16 * stride;
                NodePlacement {
                    index: i as u32,
                    host: host.clone(),
                    primary_port: first,
                    worker_ports: (1..=workers as u16).map(|w| first + w).collect(),
                }
            })
            .collect();
        Self::new(placements)
    }

    /// Number of nodes
    pub fn size(&self) -> usize {
        self.placements.len()
    }

    /// Placements in index order
    pub fn placements(&self) -> &[NodePlacement] {
        &self.placements
    }

    /// Authentication target for each node, in index order
    pub fn targets(&self, settings: &TestbedSettings) -> Vec<RemoteTarget> {
        self.placements
            .iter()
            .map(|p| RemoteTarget {
                host: p.host.clone(),
                user: settings.username.clone(),
                key_path: settings.key_path.clone(),
            })
            .collect()
    }
}
