use std::io;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use pressgrid_queue::payload::{BackupCleanupPayload, BackupCreatePayload};
use pressgrid_runner::{ExecutionError, Playbook};
use pressgrid_services::artifacts;
use pressgrid_state::{Backup, Job};

use super::{decode, internal, JobHandler};

pub const BACKUP_CLEANUP_INTERNAL: &str = "BACKUP_CLEANUP_INTERNAL";

handler!(
    /// `backup_create`: the job id is the backup id.
    ///
    /// Once the backup is running, any failure fails it for good; a new
    /// backup is a new request.
    BackupCreateHandler
);

impl BackupCreateHandler {
    async fn execute(&self, job: &Job, backup: &Backup, shutdown: watch::Receiver<bool>) -> Result<(), ExecutionError> {
        let p: BackupCreatePayload = decode(job)?;
        let env = self.ctx.environment(&backup.environment_id)?;
        let target = self.ctx.target(&env.node_id)?;
        let vars = json!({
            "backup_id": backup.id,
            "environment_id": p.environment_id,
            "backup_scope": p.backup_scope,
            "storage_path": p.storage_path,
        });
        self.ctx.run(Playbook::BackupCreate, &target, &vars, shutdown).await?;

        let local = self.ctx.artifact_path(&backup.storage_path);
        let (checksum, size) = match artifacts::checksum_file(&local) {
            Ok(digest) => digest,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(backup_id = %backup.id, path = %local.display(), "no local artifact, digesting storage path");
                (artifacts::checksum_bytes(backup.storage_path.as_bytes()), 0)
            }
            Err(e) => return Err(internal(format!("checksum {}: {e}", local.display()))),
        };
        self.ctx
            .services
            .backups
            .mark_completed(&backup.id, &checksum, size)
            .map_err(internal)?;
        info!(backup_id = %backup.id, environment_id = %env.id, size_bytes = size, "backup completed");
        Ok(())
    }
}

#[async_trait]
impl JobHandler for BackupCreateHandler {
    async fn handle(&self, job: &Job, shutdown: watch::Receiver<bool>) -> Result<(), ExecutionError> {
        let backups = &self.ctx.services.backups;
        let backup = backups.get(&job.id).map_err(internal)?;
        let backup = backups.mark_running(&backup.id).map_err(internal)?;

        let err = match self.execute(job, &backup, shutdown).await {
            Ok(()) => return Ok(()),
            Err(err) => err.normalized(),
        };
        if let Err(e) = backups.mark_failed(&backup.id) {
            warn!(backup_id = %backup.id, code = e.code(), error = %e, "could not mark backup failed");
        }
        Err(err.non_retryable())
    }
}

handler!(
    /// `backup_cleanup`: remove an expired artifact and expire its row.
    BackupCleanupHandler
);

#[async_trait]
impl JobHandler for BackupCleanupHandler {
    async fn handle(&self, job: &Job, shutdown: watch::Receiver<bool>) -> Result<(), ExecutionError> {
        let p: BackupCleanupPayload = decode(job).map_err(|e| e.with_code(BACKUP_CLEANUP_INTERNAL))?;
        let env = self
            .ctx
            .environment(&p.environment_id)
            .map_err(|e| e.with_code(BACKUP_CLEANUP_INTERNAL))?;
        let target = self
            .ctx
            .target(&env.node_id)
            .map_err(|e| e.with_code(BACKUP_CLEANUP_INTERNAL))?;
        let vars = json!({
            "site_id": env.site_id,
            "environment_id": env.id,
            "node_id": env.node_id,
            "backup_id": p.backup_id,
            "storage_path": p.storage_path,
        });
        self.ctx.run(Playbook::BackupCleanup, &target, &vars, shutdown).await?;

        let local = self.ctx.artifact_path(&p.storage_path);
        match std::fs::remove_file(&local) {
            Ok(()) => debug!(backup_id = %p.backup_id, path = %local.display(), "local artifact removed"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(backup_id = %p.backup_id, path = %local.display(), error = %e, "local artifact not removed"),
        }

        self.ctx
            .services
            .backups
            .mark_cleanup_succeeded(&job.id, &p.backup_id)
            .map_err(|e| internal(e).with_code(BACKUP_CLEANUP_INTERNAL))
    }
}
