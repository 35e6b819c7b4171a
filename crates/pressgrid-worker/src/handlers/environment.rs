use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::sync::watch;
use tracing::{debug, info};

use pressgrid_queue::payload::{
    CachePurgePayload, EnvCacheTogglePayload, EnvDeployPayload, EnvRestorePayload, EnvUpdatePayload,
};
use pressgrid_runner::{codes, ExecutionError, Playbook};
use pressgrid_services::artifacts;
use pressgrid_services::environment::{is_restorable, release_path};
use pressgrid_state::{BackupScope, Job};

use super::{completed, decode, decode_or_settle, internal, row_key, settle_failure, JobHandler};

handler!(
    /// `env_deploy`: ship a release from git or an upload.
    EnvDeployHandler
);

impl EnvDeployHandler {
    async fn execute(&self, p: &EnvDeployPayload, shutdown: watch::Receiver<bool>) -> Result<(), ExecutionError> {
        let env = self.ctx.environment(&p.environment_id)?;
        let target = self.ctx.target(&env.node_id)?;
        let vars = json!({
            "site_id": env.site_id,
            "environment_id": env.id,
            "environment_slug": env.slug,
            "release_id": p.release_id,
            "release_path": release_path(&p.release_id),
            "source_type": p.source_type,
            "source_ref": p.source_ref,
        });
        self.ctx.run(Playbook::EnvDeploy, &target, &vars, shutdown).await?;
        Ok(())
    }
}

#[async_trait]
impl JobHandler for EnvDeployHandler {
    async fn handle(&self, job: &Job, shutdown: watch::Receiver<bool>) -> Result<(), ExecutionError> {
        let envs = &self.ctx.services.environments;
        let p: EnvDeployPayload = decode_or_settle(job, |code, message| {
            envs.mark_mutation_failed(&job.id, row_key(&job.environment_id), code, message)
        })?;
        match self.execute(&p, shutdown).await {
            Ok(()) => {
                info!(job_id = %job.id, environment_id = %p.environment_id, release_id = %p.release_id, "release deployed");
                completed(envs.mark_mutation_succeeded(&job.id, &p.environment_id, Some(&p.release_id)))
            }
            Err(err) => settle_failure(job, err, |code, message| {
                envs.mark_mutation_failed(&job.id, &p.environment_id, code, message)
            }),
        }
    }
}

handler!(
    /// `env_update`: core, plugin or theme updates behind a pre-update backup.
    EnvUpdateHandler
);

impl EnvUpdateHandler {
    async fn execute(&self, p: &EnvUpdatePayload, shutdown: watch::Receiver<bool>) -> Result<(), ExecutionError> {
        let env = self.ctx.environment(&p.environment_id)?;
        let target = self.ctx.target(&env.node_id)?;
        let vars = json!({
            "site_id": env.site_id,
            "environment_id": env.id,
            "environment_slug": env.slug,
            "scope": p.scope,
            "pre_update_backup_id": p.pre_update_backup_id,
            "pre_update_backup_fresh": p.pre_update_backup_fresh,
        });
        self.ctx.run(Playbook::EnvUpdate, &target, &vars, shutdown).await?;
        Ok(())
    }
}

#[async_trait]
impl JobHandler for EnvUpdateHandler {
    async fn handle(&self, job: &Job, shutdown: watch::Receiver<bool>) -> Result<(), ExecutionError> {
        let envs = &self.ctx.services.environments;
        let p: EnvUpdatePayload = decode_or_settle(job, |code, message| {
            envs.mark_mutation_failed(&job.id, row_key(&job.environment_id), code, message)
        })?;
        match self.execute(&p, shutdown).await {
            Ok(()) => completed(envs.mark_mutation_succeeded(&job.id, &p.environment_id, None)),
            Err(err) => settle_failure(job, err, |code, message| {
                envs.mark_mutation_failed(&job.id, &p.environment_id, code, message)
            }),
        }
    }
}

handler!(
    /// `env_restore`: snapshot the environment locally, then restore a completed backup.
    EnvRestoreHandler
);

impl EnvRestoreHandler {
    async fn execute(&self, job: &Job, p: &EnvRestorePayload, shutdown: watch::Receiver<bool>) -> Result<(), ExecutionError> {
        let services = &self.ctx.services;
        let request = services
            .environments
            .restore_request(&job.id)
            .map_err(internal)?
            .ok_or_else(|| internal("restore request not found"))?;
        let env = self.ctx.environment(&p.environment_id)?;
        let site = self.ctx.site(&env.site_id)?;
        let target = self.ctx.target(&env.node_id)?;
        let backup = services.backups.get(&request.backup_id).map_err(internal)?;
        if request.environment_id != env.id || backup.environment_id != env.id || !is_restorable(&backup) {
            return Err(internal(format!("backup {} is not eligible for restore", backup.id)));
        }

        // Local snapshot of the environment as it is before the restore.
        let now = services.ctx.clock.now();
        let pre_storage_path = artifacts::storage_path(&env.id, &format!("pre-restore-{}", job.id));
        let pre_artifact = self.ctx.artifact_path(&pre_storage_path);
        let body = format!(
            "pre_restore_backup environment_id={} generated_at={}\n",
            env.id,
            now.to_rfc3339()
        );
        artifacts::write_artifact(&pre_artifact, body.as_bytes()).map_err(|e| {
            ExecutionError::fatal(codes::ANSIBLE_UNEXPECTED_ERROR, format!("write pre-restore artifact: {e}"))
        })?;
        let (checksum, size) = artifacts::checksum_file(&pre_artifact).map_err(|e| {
            ExecutionError::fatal(codes::ANSIBLE_UNEXPECTED_ERROR, format!("checksum pre-restore artifact: {e}"))
        })?;
        let pre_backup = services
            .backups
            .record_completed(&env.id, BackupScope::Full, &pre_storage_path, &checksum, size)
            .map_err(internal)?;
        debug!(job_id = %job.id, environment_id = %env.id, pre_restore_backup_id = %pre_backup.id, "pre-restore backup recorded");

        let marker = self
            .ctx
            .artifact_root()
            .join("restores")
            .join(&site.id)
            .join(format!("{}.restore.txt", env.id));
        let vars = json!({
            "site_id": site.id,
            "site_slug": site.slug,
            "environment_id": env.id,
            "environment_slug": env.slug,
            "backup_id": backup.id,
            "backup_artifact_path": self.ctx.artifact_path(&backup.storage_path).display().to_string(),
            "pre_restore_artifact_path": pre_artifact.display().to_string(),
            "restore_marker_path": marker.display().to_string(),
        });
        self.ctx.run(Playbook::EnvRestore, &target, &vars, shutdown).await?;
        Ok(())
    }
}

#[async_trait]
impl JobHandler for EnvRestoreHandler {
    async fn handle(&self, job: &Job, shutdown: watch::Receiver<bool>) -> Result<(), ExecutionError> {
        let envs = &self.ctx.services.environments;
        let p: EnvRestorePayload = decode_or_settle(job, |code, message| {
            envs.mark_restore_failed(&job.id, row_key(&job.environment_id), code, message)
        })?;
        match self.execute(job, &p, shutdown).await {
            Ok(()) => {
                info!(job_id = %job.id, environment_id = %p.environment_id, backup_id = %p.backup_id, "environment restored");
                completed(envs.mark_restore_succeeded(&job.id, &p.environment_id))
            }
            Err(err) => settle_failure(job, err, |code, message| {
                envs.mark_restore_failed(&job.id, &p.environment_id, code, message)
            }),
        }
    }
}

handler!(
    /// `env_cache_toggle`: apply the changed cache flags. Status is untouched.
    EnvCacheToggleHandler
);

#[async_trait]
impl JobHandler for EnvCacheToggleHandler {
    async fn handle(&self, job: &Job, shutdown: watch::Receiver<bool>) -> Result<(), ExecutionError> {
        let p: EnvCacheTogglePayload = decode(job)?;
        let env = self.ctx.environment(&p.environment_id)?;
        let target = self.ctx.target(&env.node_id)?;

        let mut vars = Map::new();
        vars.insert("site_id".into(), Value::from(env.site_id.clone()));
        vars.insert("environment_id".into(), Value::from(env.id.clone()));
        if let Some(enabled) = p.fastcgi_cache_enabled {
            vars.insert("fastcgi_cache_enabled".into(), Value::from(enabled));
        }
        if let Some(enabled) = p.redis_cache_enabled {
            vars.insert("redis_cache_enabled".into(), Value::from(enabled));
        }
        self.ctx
            .run(Playbook::EnvCacheToggle, &target, &Value::Object(vars), shutdown)
            .await?;
        Ok(())
    }
}

handler!(
    /// `cache_purge`: flush the caches that are enabled.
    CachePurgeHandler
);

#[async_trait]
impl JobHandler for CachePurgeHandler {
    async fn handle(&self, job: &Job, shutdown: watch::Receiver<bool>) -> Result<(), ExecutionError> {
        let p: CachePurgePayload = decode(job)?;
        let env = self.ctx.environment(&p.environment_id)?;
        let target = self.ctx.target(&env.node_id)?;
        let vars = json!({
            "site_id": env.site_id,
            "environment_id": env.id,
            "fastcgi_cache_enabled": p.fastcgi_cache_enabled,
            "redis_cache_enabled": p.redis_cache_enabled,
        });
        self.ctx.run(Playbook::CachePurge, &target, &vars, shutdown).await?;
        Ok(())
    }
}
