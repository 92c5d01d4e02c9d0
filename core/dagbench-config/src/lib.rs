//! Cluster configuration for dagbench runs
//!
//! This crate owns everything a run needs before a single remote command is
//! issued: testbed settings, the cluster topology, per-node identities and
//! the committee/parameters files every node receives.

pub mod committee;
pub mod errors;
pub mod identity;
pub mod settings;
pub mod topology;

pub use committee::{Authority, Committee, CommitteeBuilder, Parameters};
pub use errors::{ConfigError, ConfigResult};
pub use identity::{IdentityGenerator, NodeIdentity};
pub use settings::{BenchParameters, TestbedSettings};
pub use topology::{ClusterTopology, NodePlacement, RemoteTarget};

/// Prelude for common imports
pub mod prelude {
    pub use crate::{
        Authority, BenchParameters, ClusterTopology, Committee, CommitteeBuilder, ConfigError,
        ConfigResult, IdentityGenerator, NodeIdentity, NodePlacement, Parameters, RemoteTarget,
        TestbedSettings,
    };
}
