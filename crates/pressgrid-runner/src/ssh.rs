//! SSH command runner for synchronous node queries.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::error::SshError;

/// Runs one remote command and returns its combined output.
#[async_trait]
pub trait SshRunner: Send + Sync {
    async fn run(&self, host: &str, port: u16, user: &str, args: &[String]) -> Result<String, SshError>;
}

/// Spawns the system `ssh` client in batch mode.
#[derive(Debug, Clone)]
pub struct ExecSshRunner {
    binary: PathBuf,
    connect_timeout_secs: u64,
}

impl ExecSshRunner {
    pub fn new(binary: impl Into<PathBuf>, connect_timeout_secs: u64) -> Self {
        Self {
            binary: binary.into(),
            connect_timeout_secs,
        }
    }

    fn command(&self, host: &str, port: u16, user: &str, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(["-o", "BatchMode=yes", "-o", "StrictHostKeyChecking=accept-new"])
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.connect_timeout_secs))
            .arg("-p")
            .arg(port.to_string())
            .arg(format!("{user}@{host}"))
            .arg("--")
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }
}

impl Default for ExecSshRunner {
    fn default() -> Self {
        Self::new("ssh", 10)
    }
}

#[async_trait]
impl SshRunner for ExecSshRunner {
    async fn run(&self, host: &str, port: u16, user: &str, args: &[String]) -> Result<String, SshError> {
        debug!(%host, port, %user, "running ssh command");
        let output = self
            .command(host, port, user, args)
            .output()
            .await
            .map_err(|e| SshError::Spawn(format!("{}: {e}", self.binary.display())))?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        if output.status.success() {
            // Callers parse stdout; stderr noise (banners, warnings) stays out.
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }
        Err(SshError::Exit {
            code: output.status.code().unwrap_or(-1),
            output: combined,
        })
    }
}

const UNREACHABLE_MARKERS: [&str; 6] = [
    "connection refused",
    "connection timed out",
    "timed out",
    "no route to host",
    "could not resolve hostname",
    "connection closed",
];

/// Output that means the node could not be reached at all.
pub fn is_unreachable_output(output: &str) -> bool {
    let lower = output.to_lowercase();
    UNREACHABLE_MARKERS.iter().any(|marker| lower.contains(marker))
}
