//! Testbed settings and benchmark parameters
//!
//! Settings describe the machines a run uses (hosts, SSH credential, remote
//! paths); bench parameters describe the load profile. Both are read-only
//! once a run starts.

use crate::errors::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Testbed description loaded from a JSON file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestbedSettings {
    /// Path to the SSH private key used for every remote operation
    pub key_path: PathBuf,

    /// Remote username
    pub username: String,

    /// First port assigned to node 0; subsequent ports are derived from it
    pub base_port: u16,

    /// Working directory on each remote machine
    pub remote_workdir: String,

    /// Path of the node binary on the remote machines
    pub node_binary: String,

    /// Path of the load generator binary on the remote machines
    pub client_binary: String,

    /// Ordered host list; the position in this list is the node index
    pub hosts: Vec<String>,
}

impl TestbedSettings {
    /// Load settings from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let raw = fs::read_to_string(path.as_ref()).map_err(|e| {
            ConfigError::SettingsError(format!(
                "failed to read settings file {}: {e}",
                path.as_ref().display()
            ))
        })?;
        let settings: Self = serde_json::from_str(&raw)
            .map_err(|e| ConfigError::SettingsError(format!("malformed settings file: {e}")))?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> ConfigResult<()> {
        if self.hosts.is_empty() {
            return Err(ConfigError::SettingsError("empty host list".into()));
        }
        if self.username.is_empty() {
            return Err(ConfigError::SettingsError("empty username".into()));
        }
        if self.remote_workdir.is_empty() {
            return Err(ConfigError::SettingsError("empty remote workdir".into()));
        }
        Ok(())
    }

    /// Number of nodes this testbed can host
    pub fn size(&self) -> usize {
        self.hosts.len()
    }
}

/// Load profile for one benchmark run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchParameters {
    /// Number of nodes participating in the run
    pub nodes: usize,

    /// Number of workers per node
    pub workers: usize,

    /// Aggregate input rate in tx/s, split evenly across clients
    pub rate: u64,

    /// Transaction size in bytes
    pub tx_size: usize,

    /// Wall-clock run window in seconds
    pub duration_secs: u64,

    /// Number of crash faults the run tolerates (those nodes are not booted)
    pub faults: usize,

    /// Startup margin excluded from the steady-state window
    pub warmup_secs: u64,

    /// Shutdown margin excluded from the steady-state window
    pub cooldown_secs: u64,
}

impl Default for BenchParameters {
    fn default() -> Self {
        Self {
            nodes: 4,
            workers: 1,
            rate: 50_000,
            tx_size: 512,
            duration_secs: 300,
            faults: 0,
            warmup_secs: 20,
            cooldown_secs: 20,
        }
    }
}

impl BenchParameters {
    /// Range sanity; called before the pipeline touches any remote machine
    pub fn validate(&self) -> ConfigResult<()> {
        if self.nodes == 0 {
            return Err(ConfigError::InvalidParameters("nodes must be positive".into()));
        }
        if self.workers == 0 {
            return Err(ConfigError::InvalidParameters("workers must be positive".into()));
        }
        if self.rate == 0 {
            return Err(ConfigError::InvalidParameters("rate must be positive".into()));
        }
        if self.tx_size == 0 {
            return Err(ConfigError::InvalidParameters("tx size must be positive".into()));
        }
        if self.duration_secs == 0 {
            return Err(ConfigError::InvalidParameters("duration must be positive".into()));
        }
        if self.faults >= self.nodes {
            return Err(ConfigError::InvalidParameters(format!(
                "faults ({}) must be lower than the node count ({})",
                self.faults, self.nodes
            )));
        }
        if self.warmup_secs + self.cooldown_secs >= self.duration_secs {
            return Err(ConfigError::InvalidParameters(
                "warmup and cooldown margins leave no steady-state window".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample_settings_json() -> &'static str {
        r#"{
            "key_path": "/home/ubuntu/.ssh/id_rsa",
            "username": "ubuntu",
            "base_port": 9000,
            "remote_workdir": "dagbench",
            "node_binary": "./node",
            "client_binary": "./benchmark_client",
            "hosts": ["host0.example.com", "host1.example.com"]
        }"#
    }

    #[test]
    fn load_settings_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(sample_settings_json().as_bytes()).unwrap();

        let settings = TestbedSettings::load(file.path()).unwrap();
        assert_eq!(settings.size(), 2);
        assert_eq!(settings.username, "ubuntu");
        assert_eq!(settings.base_port, 9000);
    }

    #[test]
    fn reject_missing_settings_file() {
        let err = TestbedSettings::load("/nonexistent/testbed.json").unwrap_err();
        assert!(matches!(err, ConfigError::SettingsError(_)));
    }

    #[test]
    fn reject_empty_host_list() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let json = sample_settings_json().replace(
            r#"["host0.example.com", "host1.example.com"]"#,
            "[]",
        );
        file.write_all(json.as_bytes()).unwrap();

        let err = TestbedSettings::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::SettingsError(_)));
    }

    #[test]
    fn bench_parameters_sanity() {
        assert!(BenchParameters::default().validate().is_ok());

        let zero_rate = BenchParameters { rate: 0, ..Default::default() };
        assert!(zero_rate.validate().is_err());

        let too_many_faults = BenchParameters { nodes: 4, faults: 4, ..Default::default() };
        assert!(too_many_faults.validate().is_err());

        let no_window = BenchParameters {
            duration_secs: 30,
            warmup_secs: 20,
            cooldown_secs: 20,
            ..Default::default()
        };
        assert!(no_window.validate().is_err());
    }

    #[test]
    fn bench_parameters_round_trip() {
        let params = BenchParameters::default();
        let json = serde_json::to_string(&params).unwrap();
        let back: BenchParameters = serde_json::from_str(&json).unwrap();
        assert_eq!(back.nodes, params.nodes);
        assert_eq!(back.rate, params.rate);
        assert_eq!(back.tx_size, params.tx_size);
        assert_eq!(back.duration_secs, params.duration_secs);
        assert_eq!(back.faults, params.faults);
    }
}
