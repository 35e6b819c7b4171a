//! PlaybookExecutor — prepares a run and bounds it in time.
//!
//! For each run the executor writes the inventory and the extra-vars JSON
//! into a private temp dir, calls the injected [`PlaybookRunner`], and races
//! the call against the timeout and the daemon shutdown signal. Losing the
//! race drops the run future, which kills the child process.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::{codes, ExecutionError};
use crate::inventory::InventoryTarget;
use crate::playbook::{Playbook, PlaybookInvocation, PlaybookRunner};

#[derive(Clone)]
pub struct PlaybookExecutor {
    runner: Arc<dyn PlaybookRunner>,
    playbook_dir: PathBuf,
    timeout: Duration,
}

impl PlaybookExecutor {
    pub fn new(runner: Arc<dyn PlaybookRunner>, playbook_dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            runner,
            playbook_dir: playbook_dir.into(),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run `playbook` against `target` with the default timeout.
    pub async fn run(
        &self,
        playbook: Playbook,
        target: &InventoryTarget,
        vars: &Value,
        shutdown: watch::Receiver<bool>,
    ) -> Result<String, ExecutionError> {
        self.run_with_timeout(playbook, target, vars, shutdown, self.timeout)
            .await
    }

    pub async fn run_with_timeout(
        &self,
        playbook: Playbook,
        target: &InventoryTarget,
        vars: &Value,
        mut shutdown: watch::Receiver<bool>,
        timeout: Duration,
    ) -> Result<String, ExecutionError> {
        let workdir = tempfile::Builder::new()
            .prefix("pressgrid-run-")
            .tempdir()
            .map_err(|e| unexpected(format!("create run dir: {e}")))?;

        let inventory_path = workdir.path().join("inventory.ini");
        std::fs::write(&inventory_path, target.render())
            .map_err(|e| unexpected(format!("write inventory: {e}")))?;

        let extra_vars_path = workdir.path().join("vars.json");
        let vars_json = serde_json::to_vec(vars).map_err(|e| unexpected(format!("encode vars: {e}")))?;
        std::fs::write(&extra_vars_path, vars_json)
            .map_err(|e| unexpected(format!("write vars: {e}")))?;

        let mut extra_args = Vec::new();
        if !target.local {
            extra_args.push("--ssh-extra-args=-o StrictHostKeyChecking=accept-new".to_string());
        }

        let invocation = PlaybookInvocation {
            playbook,
            playbook_path: self.playbook_dir.join(playbook.file_name()),
            inventory_path,
            extra_vars_path,
            extra_vars: vars.clone(),
            extra_args,
        };

        info!(%playbook, host = %target.host, "playbook started");

        let cancelled = async {
            if shutdown.wait_for(|stop| *stop).await.is_err() {
                // Sender gone: no shutdown will ever arrive.
                std::future::pending::<()>().await;
            }
        };

        let result = tokio::select! {
            outcome = tokio::time::timeout(timeout, self.runner.run(&invocation)) => match outcome {
                Ok(Ok(output)) => Ok(output),
                Ok(Err(err)) => Err(ExecutionError::from_runner(&err)),
                Err(_) => Err(ExecutionError::timeout(format!(
                    "{playbook} exceeded {}s",
                    timeout.as_secs()
                ))),
            },
            _ = cancelled => Err(ExecutionError::timeout(format!("{playbook} cancelled by shutdown"))),
        };

        match &result {
            Ok(_) => info!(%playbook, "playbook succeeded"),
            Err(err) => warn!(%playbook, code = %err.code, retryable = err.retryable, "playbook failed"),
        }
        result
    }
}

fn unexpected(message: String) -> ExecutionError {
    ExecutionError::fatal(codes::ANSIBLE_UNEXPECTED_ERROR, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RunnerError;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    /// Records what it was asked to run and answers with a fixed outcome.
    struct Recording {
        outcome: Result<String, RunnerError>,
        seen: Mutex<Vec<(String, String, Vec<String>)>>,
    }

    #[async_trait]
    impl PlaybookRunner for Recording {
        async fn run(&self, invocation: &PlaybookInvocation) -> Result<String, RunnerError> {
            let inventory = std::fs::read_to_string(&invocation.inventory_path).unwrap();
            let vars = std::fs::read_to_string(&invocation.extra_vars_path).unwrap();
            self.seen
                .lock()
                .unwrap()
                .push((inventory, vars, invocation.extra_args.clone()));
            self.outcome.clone()
        }
    }

    /// Never finishes.
    struct Hang;

    #[async_trait]
    impl PlaybookRunner for Hang {
        async fn run(&self, _: &PlaybookInvocation) -> Result<String, RunnerError> {
            std::future::pending().await
        }
    }

    fn shutdown() -> (watch::Sender<bool>, watch::Receiver<bool>) {
        watch::channel(false)
    }

    #[tokio::test]
    async fn writes_inventory_and_vars_for_runner() {
        let runner = Arc::new(Recording {
            outcome: Ok("ok".into()),
            seen: Mutex::new(Vec::new()),
        });
        let executor = PlaybookExecutor::new(runner.clone(), "/playbooks", Duration::from_secs(5));
        let (_tx, rx) = shutdown();

        let target = InventoryTarget::ssh("node1", 22, "root");
        let out = executor
            .run(Playbook::CachePurge, &target, &json!({"environment_id": "e1"}), rx)
            .await
            .unwrap();
        assert_eq!(out, "ok");

        let seen = runner.seen.lock().unwrap();
        let (inventory, vars, args) = &seen[0];
        assert_eq!(inventory, "[target]\nnode1 ansible_port=22 ansible_user=root\n");
        assert_eq!(vars, r#"{"environment_id":"e1"}"#);
        assert_eq!(args, &vec!["--ssh-extra-args=-o StrictHostKeyChecking=accept-new".to_string()]);
    }

    #[tokio::test]
    async fn local_targets_get_no_ssh_args() {
        let runner = Arc::new(Recording {
            outcome: Ok(String::new()),
            seen: Mutex::new(Vec::new()),
        });
        let executor = PlaybookExecutor::new(runner.clone(), "/playbooks", Duration::from_secs(5));
        let (_tx, rx) = shutdown();

        executor
            .run(Playbook::HealthCheck, &InventoryTarget::local("localhost"), &json!({}), rx)
            .await
            .unwrap();
        assert!(runner.seen.lock().unwrap()[0].2.is_empty());
    }

    #[tokio::test]
    async fn runner_exit_is_classified() {
        let runner = Arc::new(Recording {
            outcome: Err(RunnerError::Exit { code: 2, output: "failed=1".into() }),
            seen: Mutex::new(Vec::new()),
        });
        let executor = PlaybookExecutor::new(runner, "/playbooks", Duration::from_secs(5));
        let (_tx, rx) = shutdown();

        let err = executor
            .run(Playbook::DomainAdd, &InventoryTarget::local("localhost"), &json!({}), rx)
            .await
            .unwrap_err();
        assert_eq!(err.code, codes::ANSIBLE_HOST_FAILED);
        assert!(err.retryable);
    }

    #[tokio::test]
    async fn slow_runs_time_out() {
        let executor = PlaybookExecutor::new(Arc::new(Hang), "/playbooks", Duration::from_millis(50));
        let (_tx, rx) = shutdown();

        let err = executor
            .run(Playbook::EnvDeploy, &InventoryTarget::local("localhost"), &json!({}), rx)
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(err.retryable);
    }

    #[tokio::test]
    async fn shutdown_cancels_in_flight_run() {
        let executor = PlaybookExecutor::new(Arc::new(Hang), "/playbooks", Duration::from_secs(3600));
        let (tx, rx) = shutdown();
        tx.send(true).unwrap();

        let err = executor
            .run(Playbook::EnvDeploy, &InventoryTarget::local("localhost"), &json!({}), rx)
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(err.message.contains("shutdown"));
    }
}
