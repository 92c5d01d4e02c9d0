//! Remote command and transfer channel
//!
//! Every remote operation goes through the `RemoteChannel` trait so the
//! orchestration logic is independent of the transport. The production
//! implementation shells out to `ssh`/`scp`; tests substitute a mock. All
//! operations carry a timeout, and retries are bounded.

use crate::errors::{ControlError, ControlResult};
use async_trait::async_trait;
use dagbench_config::RemoteTarget;
use rand::Rng;
use std::future::Future;
use std::path::Path;
use std::process::Output;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// Captured output of one remote command
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl From<Output> for CommandOutput {
    fn from(output: Output) -> Self {
        Self {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    }
}

/// Transport abstraction for one remote operation at a time
#[async_trait]
pub trait RemoteChannel: Send + Sync {
    /// Run a shell command on the target machine
    async fn run(&self, target: &RemoteTarget, command: &str) -> ControlResult<CommandOutput>;

    /// Copy a local file to the target machine
    async fn upload(&self, target: &RemoteTarget, local: &Path, remote: &str) -> ControlResult<()>;

    /// Copy a remote file back to the local machine
    async fn download(&self, target: &RemoteTarget, remote: &str, local: &Path)
        -> ControlResult<()>;
}

/// Convenience wrapper: run and fail on non-zero exit
pub async fn run_checked(
    channel: &dyn RemoteChannel,
    target: &RemoteTarget,
    command: &str,
) -> ControlResult<CommandOutput> {
    let output = channel.run(target, command).await?;
    if !output.success {
        return Err(ControlError::RemoteCommandFailed {
            host: target.host.clone(),
            stderr: output.stderr.trim().to_string(),
        });
    }
    Ok(output)
}

/// Production channel shelling out to OpenSSH
///
/// File transfers are retried a bounded number of times; command execution
/// is not, because remote commands are not generally idempotent.
pub struct SshChannel {
    connect_timeout: Duration,
    operation_timeout: Duration,
    transfer_attempts: u32,
    transfer_backoff: Duration,
    ssh_program: String,
    scp_program: String,
}

impl Default for SshChannel {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            operation_timeout: Duration::from_secs(120),
            transfer_attempts: 3,
            transfer_backoff: Duration::from_millis(500),
            ssh_program: "ssh".into(),
            scp_program: "scp".into(),
        }
    }
}

impl SshChannel {
    pub fn new(connect_timeout: Duration, operation_timeout: Duration) -> Self {
        Self { connect_timeout, operation_timeout, ..Self::default() }
    }

    /// Override the transfer retry policy
    pub fn with_transfer_retry(mut self, attempts: u32, backoff: Duration) -> Self {
        self.transfer_attempts = attempts.max(1);
        self.transfer_backoff = backoff;
        self
    }

    /// Override the transport binaries (tests substitute stubs)
    pub fn with_programs<S: Into<String>>(mut self, ssh: S, scp: S) -> Self {
        self.ssh_program = ssh.into();
        self.scp_program = scp.into();
        self
    }

    fn base_args(&self, target: &RemoteTarget) -> Vec<String> {
        vec![
            "-i".into(),
            target.key_path.display().to_string(),
            "-o".into(),
            "BatchMode=yes".into(),
            "-o".into(),
            "StrictHostKeyChecking=no".into(),
            "-o".into(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs()),
        ]
    }

    async fn bounded(
        &self,
        target: &RemoteTarget,
        mut command: Command,
    ) -> ControlResult<CommandOutput> {
        let future = command.output();
        let output = tokio::time::timeout(self.operation_timeout, future)
            .await
            .map_err(|_| ControlError::RemoteTimeout {
                host: target.host.clone(),
                seconds: self.operation_timeout.as_secs(),
            })?
            .map_err(|e| ControlError::TransportError {
                host: target.host.clone(),
                reason: e.to_string(),
            })?;
        Ok(output.into())
    }
}

#[async_trait]
impl RemoteChannel for SshChannel {
    async fn run(&self, target: &RemoteTarget, command: &str) -> ControlResult<CommandOutput> {
        debug!(host = %target.host, command, "ssh run");
        let mut cmd = Command::new(&self.ssh_program);
        cmd.args(self.base_args(target))
            .arg(format!("{}@{}", target.user, target.host))
            .arg(command);
        self.bounded(target, cmd).await
    }

    async fn upload(&self, target: &RemoteTarget, local: &Path, remote: &str) -> ControlResult<()> {
        debug!(host = %target.host, local = %local.display(), remote, "scp upload");
        with_retry(self.transfer_attempts, self.transfer_backoff, || {
            let mut cmd = Command::new(&self.scp_program);
            cmd.args(self.base_args(target))
                .arg(local)
                .arg(format!("{}@{}:{}", target.user, target.host, remote));
            async move {
                let output = self.bounded(target, cmd).await?;
                if !output.success {
                    return Err(ControlError::TransportError {
                        host: target.host.clone(),
                        reason: output.stderr.trim().to_string(),
                    });
                }
                Ok(())
            }
        })
        .await
    }

    async fn download(
        &self,
        target: &RemoteTarget,
        remote: &str,
        local: &Path,
    ) -> ControlResult<()> {
        debug!(host = %target.host, remote, local = %local.display(), "scp download");
        with_retry(self.transfer_attempts, self.transfer_backoff, || {
            let mut cmd = Command::new(&self.scp_program);
            cmd.args(self.base_args(target))
                .arg(format!("{}@{}:{}", target.user, target.host, remote))
                .arg(local);
            async move {
                let output = self.bounded(target, cmd).await?;
                if !output.success {
                    return Err(ControlError::TransportError {
                        host: target.host.clone(),
                        reason: output.stderr.trim().to_string(),
                    });
                }
                Ok(())
            }
        })
        .await
    }
}

/// Retry a fallible remote operation a bounded number of times with
/// jittered backoff. The last error surfaces; nothing is swallowed.
pub async fn with_retry<T, F, Fut>(attempts: u32, base_delay: Duration, mut op: F) -> ControlResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ControlResult<T>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                attempt += 1;
                warn!(attempt, error = %e, "remote operation failed");
                if attempt >= attempts {
                    return Err(e);
                }
                let jitter = rand::thread_rng().gen_range(0..100);
                let delay = base_delay * 2u32.pow(attempt - 1) + Duration::from_millis(jitter);
                tokio::time::sleep(delay).await;
            }
        }
    }
}
