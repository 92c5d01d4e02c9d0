//! Per-node identity generation
//!
//! Key material is produced by the external node binary; this module only
//! drives it and reads back the public half. The secret never leaves the
//! key file, and the key file is only ever pushed to its owning node.

use crate::errors::{ConfigError, ConfigResult};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info};

/// Public identity of one node, created once per run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    /// Node index, unique within the run
    pub index: u32,

    /// Public key as written by the node binary
    pub public_key: String,

    /// File holding the full keypair
    pub key_file: PathBuf,
}

/// Public half of the keypair file written by the node binary.
/// The secret field is deliberately not mapped.
#[derive(Deserialize)]
struct KeyFile {
    name: String,
}

/// Drives the external node binary to produce per-node keypairs
pub struct IdentityGenerator {
    binary: PathBuf,
}

impl IdentityGenerator {
    /// Create a generator invoking the given node binary
    pub fn new<P: Into<PathBuf>>(binary: P) -> Self {
        Self { binary: binary.into() }
    }

    /// Generate the keypair for `index`, writing it to `key_file`.
    ///
    /// Refuses to clobber an existing key file unless `overwrite` is set;
    /// an accidental overwrite would silently desynchronize a node from a
    /// committee built on the previous key.
    pub async fn generate(
        &self,
        index: u32,
        key_file: &Path,
        overwrite: bool,
    ) -> ConfigResult<NodeIdentity> {
        if key_file.exists() && !overwrite {
            return Err(ConfigError::KeyFileExists(key_file.to_path_buf()));
        }

        debug!(index, file = %key_file.display(), "generating keypair");
        let output = Command::new(&self.binary)
            .arg("generate_keys")
            .arg("--filename")
            .arg(key_file)
            .output()
            .await
            .map_err(|e| ConfigError::KeyGenerationFailed {
                index,
                reason: format!("failed to spawn {}: {e}", self.binary.display()),
            })?;

        if !output.status.success() {
            return Err(ConfigError::KeyGenerationFailed {
                index,
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let identity = Self::read_public(index, key_file)?;
        info!(index, key = %identity.public_key, "generated node identity");
        Ok(identity)
    }

    /// Read back the public half of an existing key file
    pub fn read_public(index: u32, key_file: &Path) -> ConfigResult<NodeIdentity> {
        let raw = fs::read_to_string(key_file)?;
        let parsed: KeyFile = serde_json::from_str(&raw).map_err(|e| {
            ConfigError::KeyGenerationFailed {
                index,
                reason: format!("unreadable key file {}: {e}", key_file.display()),
            }
        })?;
        Ok(NodeIdentity {
            index,
            public_key: parsed.name,
            key_file: key_file.to_path_buf(),
        })
    }
}
