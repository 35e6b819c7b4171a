//! Playbook allowlist, runner trait and the `ansible-playbook` adapter.

use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;
use tracing::debug;

use crate::error::RunnerError;

/// Every playbook the control plane may run. Nothing else is executable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Playbook {
    NodeProvision,
    SiteCreate,
    EnvCreate,
    EnvDeploy,
    EnvRestore,
    EnvUpdate,
    EnvPromote,
    EnvCacheToggle,
    CachePurge,
    BackupCreate,
    BackupCleanup,
    DomainAdd,
    DomainRemove,
    DriftCheck,
    HealthCheck,
    ReleaseRollback,
    SiteImport,
}

impl Playbook {
    pub fn file_name(self) -> &'static str {
        match self {
            Playbook::NodeProvision => "node-provision.yml",
            Playbook::SiteCreate => "site-create.yml",
            Playbook::EnvCreate => "env-create.yml",
            Playbook::EnvDeploy => "env-deploy.yml",
            Playbook::EnvRestore => "env-restore.yml",
            Playbook::EnvUpdate => "env-update.yml",
            Playbook::EnvPromote => "env-promote.yml",
            Playbook::EnvCacheToggle => "env-cache-toggle.yml",
            Playbook::CachePurge => "cache-purge.yml",
            Playbook::BackupCreate => "backup-create.yml",
            Playbook::BackupCleanup => "backup-cleanup.yml",
            Playbook::DomainAdd => "domain-add.yml",
            Playbook::DomainRemove => "domain-remove.yml",
            Playbook::DriftCheck => "drift-check.yml",
            Playbook::HealthCheck => "health-check.yml",
            Playbook::ReleaseRollback => "release-rollback.yml",
            Playbook::SiteImport => "site-import.yml",
        }
    }
}

impl fmt::Display for Playbook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file_name())
    }
}

/// One fully prepared playbook run.
#[derive(Debug, Clone)]
pub struct PlaybookInvocation {
    pub playbook: Playbook,
    pub playbook_path: PathBuf,
    pub inventory_path: PathBuf,
    pub extra_vars_path: PathBuf,
    /// The contents of `extra_vars_path`, kept for logging and inspection.
    pub extra_vars: Value,
    pub extra_args: Vec<String>,
}

/// Executes playbooks and returns their combined output.
#[async_trait]
pub trait PlaybookRunner: Send + Sync {
    async fn run(&self, invocation: &PlaybookInvocation) -> Result<String, RunnerError>;
}

/// Spawns `ansible-playbook`.
///
/// The child is killed when the run future is dropped, which is how
/// timeouts and daemon shutdown stop an in-flight playbook.
#[derive(Debug, Clone)]
pub struct AnsibleRunner {
    binary: PathBuf,
    syntax_check: bool,
}

impl AnsibleRunner {
    pub fn new(binary: impl Into<PathBuf>, syntax_check: bool) -> Self {
        Self {
            binary: binary.into(),
            syntax_check,
        }
    }

    async fn exec(&self, invocation: &PlaybookInvocation, syntax_only: bool) -> Result<String, RunnerError> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("-i")
            .arg(&invocation.inventory_path)
            .arg("-e")
            .arg(format!("@{}", invocation.extra_vars_path.display()));
        if syntax_only {
            cmd.arg("--syntax-check");
        }
        cmd.args(&invocation.extra_args)
            .arg(&invocation.playbook_path)
            .env("ANSIBLE_STDOUT_CALLBACK", "json")
            .stdin(Stdio::null())
            .kill_on_drop(true);

        debug!(
            playbook = %invocation.playbook,
            syntax_only,
            extra_vars = %redact_vars(&invocation.extra_vars),
            "running ansible-playbook"
        );

        let output = cmd
            .output()
            .await
            .map_err(|e| RunnerError::Spawn(format!("{}: {e}", self.binary.display())))?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            if !combined.is_empty() && !combined.ends_with('\n') {
                combined.push('\n');
            }
            combined.push_str(&stderr);
        }

        match output.status.code() {
            Some(0) => Ok(combined),
            Some(code) => Err(RunnerError::Exit { code, output: combined }),
            // Killed by a signal.
            None => Err(RunnerError::Exit { code: -1, output: combined }),
        }
    }
}

#[async_trait]
impl PlaybookRunner for AnsibleRunner {
    async fn run(&self, invocation: &PlaybookInvocation) -> Result<String, RunnerError> {
        if self.syntax_check {
            self.exec(invocation, true).await?;
        }
        self.exec(invocation, false).await
    }
}

/// Replace values whose key names a credential.
pub fn redact_vars(vars: &Value) -> Value {
    match vars {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, value)| {
                    let lower = key.to_ascii_lowercase();
                    let sensitive = ["token", "password", "secret"]
                        .iter()
                        .any(|needle| lower.contains(needle));
                    if sensitive {
                        (key.clone(), Value::String("[redacted]".into()))
                    } else {
                        (key.clone(), redact_vars(value))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact_vars).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn invocation() -> PlaybookInvocation {
        PlaybookInvocation {
            playbook: Playbook::CachePurge,
            playbook_path: PathBuf::from("/nonexistent/cache-purge.yml"),
            inventory_path: PathBuf::from("/nonexistent/inventory.ini"),
            extra_vars_path: PathBuf::from("/nonexistent/vars.json"),
            extra_vars: json!({}),
            extra_args: Vec::new(),
        }
    }

    #[test]
    fn redaction_covers_nested_credentials() {
        let vars = json!({
            "site_id": "s1",
            "db_password": "hunter2",
            "dns": {"API_TOKEN": "abc", "zone": "example.com"},
            "clientSecret": "x",
        });
        let redacted = redact_vars(&vars);
        assert_eq!(redacted["site_id"], "s1");
        assert_eq!(redacted["db_password"], "[redacted]");
        assert_eq!(redacted["dns"]["API_TOKEN"], "[redacted]");
        assert_eq!(redacted["dns"]["zone"], "example.com");
        assert_eq!(redacted["clientSecret"], "[redacted]");
    }

    #[test]
    fn playbook_names_are_unique() {
        let all = [
            Playbook::NodeProvision,
            Playbook::SiteCreate,
            Playbook::EnvCreate,
            Playbook::EnvDeploy,
            Playbook::EnvRestore,
            Playbook::EnvUpdate,
            Playbook::EnvPromote,
            Playbook::EnvCacheToggle,
            Playbook::CachePurge,
            Playbook::BackupCreate,
            Playbook::BackupCleanup,
            Playbook::DomainAdd,
            Playbook::DomainRemove,
            Playbook::DriftCheck,
            Playbook::HealthCheck,
            Playbook::ReleaseRollback,
            Playbook::SiteImport,
        ];
        let names: std::collections::HashSet<_> = all.iter().map(|p| p.file_name()).collect();
        assert_eq!(names.len(), all.len());
        assert!(names.iter().all(|n| n.ends_with(".yml")));
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let runner = AnsibleRunner::new("/nonexistent/ansible-playbook", false);
        let err = runner.run(&invocation()).await.unwrap_err();
        assert!(matches!(err, RunnerError::Spawn(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn nonzero_exit_is_reported_with_code() {
        // `false` ignores its arguments and exits 1.
        let runner = AnsibleRunner::new("false", true);
        let err = runner.run(&invocation()).await.unwrap_err();
        assert!(matches!(err, RunnerError::Exit { code: 1, .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn zero_exit_is_success() {
        let runner = AnsibleRunner::new("true", true);
        assert!(runner.run(&invocation()).await.is_ok());
    }
}
