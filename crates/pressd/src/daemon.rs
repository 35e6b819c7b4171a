//! `pressd run` — workers and the retention sweep.
//!
//! In this mode the daemon:
//! 1. Opens the state store and builds the services
//! 2. Re-queues provisioning for nodes left in `provisioning`
//! 3. Starts `worker_count` workers sharing one handler registry
//! 4. Starts the backup cleanup scheduler
//! 5. On Ctrl-C flips the shutdown signal and waits up to
//!    `shutdown_grace_secs` for every loop to return

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use pressgrid_core::PressConfig;
use pressgrid_runner::{AnsibleRunner, PlaybookExecutor};
use pressgrid_services::Services;
use pressgrid_state::NodeStatus;
use pressgrid_worker::{CleanupScheduler, HandlerContext, HandlerRegistry, Worker};

use crate::context::open_services;

pub async fn run(config: PressConfig) -> anyhow::Result<()> {
    info!(
        data_dir = %config.daemon.data_dir.display(),
        workers = config.daemon.worker_count,
        "pressd starting"
    );

    let services = open_services(&config)?;
    std::fs::create_dir_all(&config.backups.artifact_dir)?;
    requeue_provisioning(&services);

    // ── Handlers ─────────────────────────────────────────────────
    let runner = Arc::new(AnsibleRunner::new(&config.ansible.binary, config.ansible.syntax_check));
    let executor = PlaybookExecutor::new(runner, &config.ansible.playbook_dir, config.playbook_timeout());
    let handlers = Arc::new(HandlerRegistry::standard(HandlerContext::new(
        services.clone(),
        executor,
        &config.backups.artifact_dir,
    )));
    info!(handlers = handlers.len(), playbook_dir = %config.ansible.playbook_dir.display(), "handlers registered");

    // ── Background loops ─────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    let pid = std::process::id();
    for index in 0..config.daemon.worker_count.max(1) {
        let worker = Worker::new(format!("pressd-{pid}-{index}"), &services, handlers.clone())
            .with_poll_interval(config.poll_interval());
        let shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move { worker.run(shutdown).await }));
    }

    let cleanup = CleanupScheduler::new(services.backups.clone(), config.cleanup_interval());
    let cleanup_shutdown = shutdown_rx.clone();
    tasks.push(tokio::spawn(async move { cleanup.run(cleanup_shutdown).await }));

    // ── Shutdown ─────────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    let grace = Duration::from_secs(config.daemon.shutdown_grace_secs);
    let drain = async {
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "background task panicked");
            }
        }
    };
    if tokio::time::timeout(grace, drain).await.is_err() {
        warn!(grace_secs = grace.as_secs(), "loops still running after grace period");
    }

    info!("pressd stopped");
    Ok(())
}

/// A crash between registration and provisioning leaves a node without a job.
fn requeue_provisioning(services: &Services) {
    let nodes = match services.nodes.list() {
        Ok(nodes) => nodes,
        Err(e) => {
            warn!(code = e.code(), error = %e, "node list failed");
            return;
        }
    };
    for node in nodes.iter().filter(|n| n.status == NodeStatus::Provisioning) {
        match services.nodes.ensure_provision_queued(&node.id) {
            Ok(Some(job)) => info!(node_id = %node.id, job_id = %job.id, "provisioning re-queued"),
            Ok(None) => {}
            Err(e) => warn!(node_id = %node.id, code = e.code(), error = %e, "provisioning not re-queued"),
        }
    }
}
