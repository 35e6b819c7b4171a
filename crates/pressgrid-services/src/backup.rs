//! BackupService — backup creation, the backup status DAG and retention cleanup.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use pressgrid_queue::payload::{self, BackupCleanupPayload, BackupCreatePayload};
use pressgrid_queue::QueueError;
use pressgrid_state::*;

use crate::artifacts;
use crate::context::ServiceContext;
use crate::environment::mutation_job;
use crate::error::{ServiceError, ServiceResult};
use crate::lifecycle;

#[derive(Debug, Clone, Serialize)]
pub struct BackupAccepted {
    pub backup: Backup,
    pub job_id: String,
}

#[derive(Clone)]
pub struct BackupService {
    ctx: ServiceContext,
}

impl BackupService {
    pub fn new(ctx: ServiceContext) -> Self {
        Self { ctx }
    }

    pub fn get(&self, backup_id: &str) -> ServiceResult<Backup> {
        self.ctx
            .store
            .get::<Backup>(backup_id)?
            .ok_or_else(|| ServiceError::BackupNotFound(backup_id.to_string()))
    }

    /// Backups of an environment, newest first.
    pub fn list_by_environment(&self, environment_id: &str) -> ServiceResult<Vec<Backup>> {
        let mut backups: Vec<Backup> = self
            .ctx
            .store
            .list::<Backup>()?
            .into_iter()
            .filter(|b| b.environment_id == environment_id)
            .collect();
        backups.sort_by(|a, b| (b.created_at, &b.id).cmp(&(a.created_at, &a.id)));
        Ok(backups)
    }

    /// Insert a pending backup and queue `backup_create` under the backup's id.
    pub fn create(&self, environment_id: &str, scope: BackupScope) -> ServiceResult<BackupAccepted> {
        let now = self.ctx.clock.now();
        let accepted = self.ctx.store.with_tx(|tx| {
            let env = lifecycle::load_environment(tx, environment_id)?;
            let backup_id = self.ctx.ids.new_id();
            let backup = Backup {
                id: backup_id.clone(),
                environment_id: env.id.clone(),
                backup_scope: scope,
                status: BackupStatus::Pending,
                storage_type: "s3".into(),
                storage_path: artifacts::storage_path(&env.id, &backup_id),
                retention_until: now + self.ctx.backup_retention,
                checksum: None,
                size_bytes: None,
                created_at: now,
                completed_at: None,
            };
            tx.put(&backup)?;

            let body = payload::encode(&BackupCreatePayload {
                backup_id: backup_id.clone(),
                environment_id: env.id.clone(),
                backup_scope: scope,
                storage_path: backup.storage_path.clone(),
            })?;
            let job = self
                .ctx
                .queue
                .enqueue_in(tx, mutation_job(JobType::BackupCreate, body, &env).job_id(&backup_id))?;
            Ok::<_, ServiceError>(BackupAccepted { backup, job_id: job.id })
        })?;

        info!(backup_id = %accepted.backup.id, environment_id, "backup create accepted");
        self.ctx.audit_accepted("backup.create", "backup", &accepted.backup.id);
        Ok(accepted)
    }

    /// Record an already-written artifact as a completed backup.
    pub fn record_completed(
        &self,
        environment_id: &str,
        scope: BackupScope,
        storage_path: &str,
        checksum: &str,
        size_bytes: u64,
    ) -> ServiceResult<Backup> {
        if checksum.trim().is_empty() {
            return Err(ServiceError::InvalidInput("checksum is required".into()));
        }
        let now = self.ctx.clock.now();
        self.ctx.store.with_tx(|tx| {
            let env = lifecycle::load_environment(tx, environment_id)?;
            let backup = Backup {
                id: self.ctx.ids.new_id(),
                environment_id: env.id,
                backup_scope: scope,
                status: BackupStatus::Completed,
                storage_type: "local".into(),
                storage_path: storage_path.to_string(),
                retention_until: now + self.ctx.backup_retention,
                checksum: Some(checksum.trim().to_string()),
                size_bytes: Some(size_bytes),
                created_at: now,
                completed_at: Some(now),
            };
            tx.put(&backup)?;
            Ok(backup)
        })
    }

    // ── Status DAG ─────────────────────────────────────────────────

    pub fn mark_running(&self, backup_id: &str) -> ServiceResult<Backup> {
        self.transition(backup_id, BackupStatus::Running, |_, _| Ok(()))
    }

    pub fn mark_completed(&self, backup_id: &str, checksum: &str, size_bytes: u64) -> ServiceResult<Backup> {
        let checksum = checksum.trim();
        if checksum.is_empty() {
            return Err(ServiceError::InvalidInput("checksum is required".into()));
        }
        self.transition(backup_id, BackupStatus::Completed, |backup, now| {
            backup.checksum = Some(checksum.to_string());
            backup.size_bytes = Some(size_bytes);
            backup.completed_at = Some(now);
            Ok(())
        })
    }

    pub fn mark_failed(&self, backup_id: &str) -> ServiceResult<Backup> {
        self.transition(backup_id, BackupStatus::Failed, |backup, now| {
            backup.completed_at = Some(now);
            Ok(())
        })
    }

    pub fn mark_expired(&self, backup_id: &str) -> ServiceResult<Backup> {
        self.transition(backup_id, BackupStatus::Expired, |_, _| Ok(()))
    }

    fn transition<F>(&self, backup_id: &str, next: BackupStatus, apply: F) -> ServiceResult<Backup>
    where
        F: FnOnce(&mut Backup, DateTime<Utc>) -> ServiceResult<()>,
    {
        let now = self.ctx.clock.now();
        let backup = self.ctx.store.with_tx(|tx| {
            let mut backup = lifecycle::load_backup(tx, backup_id)?;
            check_edge(&backup, next)?;
            backup.status = next;
            apply(&mut backup, now)?;
            tx.put(&backup)?;
            Ok::<_, ServiceError>(backup)
        })?;
        debug!(backup_id, status = ?next, "backup transitioned");
        Ok(backup)
    }

    // ── Retention ──────────────────────────────────────────────────

    /// Queue `backup_cleanup` for expired backups, at most one per site per pass.
    ///
    /// Returns the number of jobs enqueued.
    pub fn enqueue_expired_cleanup(&self) -> ServiceResult<usize> {
        let now = self.ctx.clock.now();
        let enqueued = self.ctx.store.with_tx(|tx| {
            let mut candidates: Vec<Backup> = tx
                .list::<Backup>()?
                .into_iter()
                .filter(|b| is_expired_at(b, now))
                .collect();
            candidates.sort_by(|a, b| {
                (a.retention_until, a.created_at, &a.id).cmp(&(b.retention_until, b.created_at, &b.id))
            });

            let mut busy_sites = HashSet::new();
            let mut busy_backups = HashSet::new();
            for job in tx.active_jobs()? {
                if job.job_type != JobType::BackupCleanup {
                    continue;
                }
                if let Some(site_id) = &job.site_id {
                    busy_sites.insert(site_id.clone());
                }
                if let Some(backup_id) = job.payload.get("backup_id").and_then(|v| v.as_str()) {
                    busy_backups.insert(backup_id.to_string());
                }
            }

            let mut enqueued = 0;
            for backup in candidates {
                let Some(env) = tx.get::<Environment>(&backup.environment_id)? else {
                    continue;
                };
                if busy_sites.contains(&env.site_id) || busy_backups.contains(&backup.id) {
                    continue;
                }
                let body = payload::encode(&BackupCleanupPayload {
                    backup_id: backup.id.clone(),
                    environment_id: env.id.clone(),
                    storage_path: backup.storage_path.clone(),
                })?;
                match self
                    .ctx
                    .queue
                    .enqueue_in(tx, mutation_job(JobType::BackupCleanup, body, &env))
                {
                    Ok(job) => {
                        debug!(backup_id = %backup.id, job_id = %job.id, "backup cleanup queued");
                        enqueued += 1;
                    }
                    Err(QueueError::ConcurrencyConflict { .. }) => {}
                    Err(err) => return Err(err.into()),
                }
                busy_sites.insert(env.site_id);
            }
            Ok::<_, ServiceError>(enqueued)
        })?;
        if enqueued > 0 {
            info!(enqueued, "backup cleanup pass");
        }
        Ok(enqueued)
    }

    /// Cleanup succeeded: expire the backup if it is still past retention.
    pub fn mark_cleanup_succeeded(&self, job_id: &str, backup_id: &str) -> ServiceResult<()> {
        let now = self.ctx.clock.now();
        self.ctx.store.with_tx(|tx| {
            let mut backup = lifecycle::load_backup(tx, backup_id)?;
            if is_expired_at(&backup, now) {
                backup.status = BackupStatus::Expired;
                tx.put(&backup)?;
            }
            lifecycle::succeed_job(&self.ctx.queue, tx, job_id, now)
        })
    }
}

/// Past retention and in a status that may expire.
pub fn is_expired_at(backup: &Backup, now: DateTime<Utc>) -> bool {
    backup.retention_until < now
        && matches!(backup.status, BackupStatus::Completed | BackupStatus::Failed)
}

fn check_edge(backup: &Backup, next: BackupStatus) -> ServiceResult<()> {
    if backup.status.can_transition_to(next) {
        return Ok(());
    }
    Err(ServiceError::InvalidTransition {
        entity: "backup",
        from: format!("{:?}", backup.status).to_lowercase(),
        to: format!("{next:?}").to_lowercase(),
    })
}
