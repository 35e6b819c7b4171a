//! Wiring shared by the daemon loop and the operator commands.

use std::sync::Arc;

use anyhow::Context as _;
use tracing::info;

use pressgrid_core::{PressConfig, SystemClock, UuidV4Ids};
use pressgrid_runner::{ExecSshRunner, SshRunner};
use pressgrid_services::{ServiceContext, Services};
use pressgrid_state::StateStore;

/// Open the store under `[daemon].data_dir` and build every service over it.
pub fn open_services(config: &PressConfig) -> anyhow::Result<Services> {
    std::fs::create_dir_all(&config.daemon.data_dir)
        .with_context(|| format!("create data dir {}", config.daemon.data_dir.display()))?;
    let db_path = config.db_path();
    let store = StateStore::open(&db_path).with_context(|| format!("open state store {}", db_path.display()))?;
    info!(path = %db_path.display(), "state store opened");

    let ctx = ServiceContext::new(store, Arc::new(SystemClock), Arc::new(UuidV4Ids))
        .with_preview_domain(config.preview_domain().map(str::to_string))
        .with_backup_retention_days(config.backups.retention_days);
    Ok(Services::new(ctx))
}

pub fn ssh_runner(config: &PressConfig) -> Arc<dyn SshRunner> {
    Arc::new(ExecSshRunner::new(&config.ssh.binary, config.ssh.connect_timeout_secs))
}
