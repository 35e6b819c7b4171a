use async_trait::async_trait;
use serde_json::json;
use tokio::sync::watch;
use tracing::{error, info};

use pressgrid_queue::payload::{HealthCheckPayload, ReleaseRollbackPayload};
use pressgrid_runner::{ExecutionError, Playbook};
use pressgrid_services::environment::release_path;
use pressgrid_services::release::{
    HEALTH_CHECK_FAILED, HEALTH_CHECK_TIMEOUT, RELEASE_ROLLBACK_FAILED, RELEASE_ROLLBACK_TIMEOUT,
};
use pressgrid_state::Job;

use super::{completed, decode, decode_or_settle, row_key, settle_failure, JobHandler};

handler!(
    /// `health_check`: probe the release a deploy, restore or promotion just installed.
    ///
    /// A failed probe fails the job and queues `release_rollback` in one step.
    HealthCheckHandler
);

impl HealthCheckHandler {
    async fn execute(&self, p: &HealthCheckPayload, shutdown: watch::Receiver<bool>) -> Result<(), ExecutionError> {
        let env = self.ctx.environment(&p.environment_id)?;
        let target = self.ctx.target(&env.node_id)?;
        let vars = json!({
            "site_id": env.site_id,
            "environment_id": env.id,
            "release_id": p.release_id,
            "trigger_job_type": p.trigger_job_type,
            "preview_url": env.preview_url,
        });
        self.ctx.run(Playbook::HealthCheck, &target, &vars, shutdown).await?;
        Ok(())
    }
}

#[async_trait]
impl JobHandler for HealthCheckHandler {
    async fn handle(&self, job: &Job, shutdown: watch::Receiver<bool>) -> Result<(), ExecutionError> {
        let p: HealthCheckPayload = decode(job)?;
        let releases = &self.ctx.services.releases;
        let err = match self.execute(&p, shutdown).await {
            Ok(()) => {
                info!(job_id = %job.id, environment_id = %p.environment_id, release_id = %p.release_id, "release healthy");
                return completed(releases.mark_health_check_succeeded(&job.id, &p.release_id));
            }
            Err(err) => err.normalized(),
        };

        let code = if err.is_timeout() { HEALTH_CHECK_TIMEOUT } else { HEALTH_CHECK_FAILED };
        if let Err(e) = releases.handle_health_check_failure(
            &job.id,
            &p.environment_id,
            &p.release_id,
            err.is_timeout(),
            &err.message,
        ) {
            error!(
                job_id = %job.id,
                environment_id = %p.environment_id,
                code = e.code(),
                error = %e,
                "rollback not queued"
            );
        }
        Err(err.with_code(code).non_retryable())
    }
}

handler!(
    /// `release_rollback`: reinstate the previous release after a failed health check.
    ReleaseRollbackHandler
);

impl ReleaseRollbackHandler {
    async fn execute(&self, p: &ReleaseRollbackPayload, shutdown: watch::Receiver<bool>) -> Result<(), ExecutionError> {
        let env = self.ctx.environment(&p.environment_id)?;
        let target = self.ctx.target(&env.node_id)?;
        let vars = json!({
            "site_id": env.site_id,
            "environment_id": env.id,
            "failed_release_id": p.failed_release_id,
            "restored_release_id": p.restored_release_id,
            "restored_release_path": release_path(&p.restored_release_id),
            "health_check_job_id": p.health_check_job_id,
        });
        match self.ctx.run(Playbook::ReleaseRollback, &target, &vars, shutdown).await {
            Ok(_) => Ok(()),
            Err(err) if err.is_timeout() => Err(err.with_code(RELEASE_ROLLBACK_TIMEOUT)),
            Err(err) => Err(err.with_code(RELEASE_ROLLBACK_FAILED)),
        }
    }
}

#[async_trait]
impl JobHandler for ReleaseRollbackHandler {
    async fn handle(&self, job: &Job, shutdown: watch::Receiver<bool>) -> Result<(), ExecutionError> {
        let releases = &self.ctx.services.releases;
        let p: ReleaseRollbackPayload = decode_or_settle(job, |code, message| {
            releases.mark_rollback_failed(&job.id, row_key(&job.environment_id), code, message)
        })?;
        match self.execute(&p, shutdown).await {
            Ok(()) => {
                info!(
                    job_id = %job.id,
                    environment_id = %p.environment_id,
                    restored_release_id = %p.restored_release_id,
                    "release rolled back"
                );
                completed(releases.mark_rollback_succeeded(&job.id, &p.environment_id, &p.restored_release_id))
            }
            Err(err) => settle_failure(job, err, |code, message| {
                releases.mark_rollback_failed(&job.id, &p.environment_id, code, message)
            }),
        }
    }
}
