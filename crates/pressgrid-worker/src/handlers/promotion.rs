use async_trait::async_trait;
use serde_json::json;
use tokio::sync::watch;
use tracing::{info, warn};

use pressgrid_queue::payload::{DriftCheckPayload, EnvPromotePayload};
use pressgrid_runner::{ExecutionError, Playbook};
use pressgrid_state::Job;

use super::{completed, decode_or_settle, row_key, settle_failure, JobHandler};

handler!(
    /// `env_promote`: push a clean source environment onto its target.
    EnvPromoteHandler
);

impl EnvPromoteHandler {
    async fn execute(&self, p: &EnvPromotePayload, shutdown: watch::Receiver<bool>) -> Result<(), ExecutionError> {
        let source = self.ctx.environment(&p.source_environment_id)?;
        let target_env = self.ctx.environment(&p.target_environment_id)?;
        let target = self.ctx.target(&target_env.node_id)?;
        let vars = json!({
            "site_id": target_env.site_id,
            "source_environment_id": source.id,
            "source_preview_url": source.preview_url,
            "target_environment_id": target_env.id,
            "target_preview_url": target_env.preview_url,
            "promotion_preset": p.promotion_preset,
            "drift_check_id": p.drift_check_id,
            "pre_promote_backup_id": p.pre_promote_backup_id,
            "release_id": p.release_id,
        });
        self.ctx.run(Playbook::EnvPromote, &target, &vars, shutdown).await?;
        Ok(())
    }
}

#[async_trait]
impl JobHandler for EnvPromoteHandler {
    async fn handle(&self, job: &Job, shutdown: watch::Receiver<bool>) -> Result<(), ExecutionError> {
        let promotion = &self.ctx.services.promotion;
        let p: EnvPromotePayload = decode_or_settle(job, |code, message| {
            promotion.mark_promote_failed(&job.id, row_key(&job.environment_id), code, message)
        })?;
        match self.execute(&p, shutdown).await {
            Ok(()) => {
                info!(
                    job_id = %job.id,
                    source_environment_id = %p.source_environment_id,
                    environment_id = %p.target_environment_id,
                    "promotion applied"
                );
                completed(promotion.mark_promote_succeeded(&job.id, &p.target_environment_id, &p.release_id))
            }
            Err(err) => settle_failure(job, err, |code, message| {
                promotion.mark_promote_failed(&job.id, &p.target_environment_id, code, message)
            }),
        }
    }
}

handler!(
    /// `drift_check`: compare the environment against its last known checksums.
    DriftCheckHandler
);

impl DriftCheckHandler {
    async fn execute(&self, p: &DriftCheckPayload, shutdown: watch::Receiver<bool>) -> Result<(), ExecutionError> {
        let env = self.ctx.environment(&p.environment_id)?;
        let target = self.ctx.target(&env.node_id)?;
        let vars = json!({
            "site_id": env.site_id,
            "environment_id": env.id,
            "drift_check_id": p.drift_check_id,
            "promotion_preset": p.promotion_preset,
        });
        self.ctx.run(Playbook::DriftCheck, &target, &vars, shutdown).await?;
        Ok(())
    }
}

#[async_trait]
impl JobHandler for DriftCheckHandler {
    async fn handle(&self, job: &Job, shutdown: watch::Receiver<bool>) -> Result<(), ExecutionError> {
        let promotion = &self.ctx.services.promotion;
        // The job id is the drift check id.
        let p: DriftCheckPayload = decode_or_settle(job, |code, message| {
            promotion.mark_drifted(&job.id, &job.id, code, message)
        })?;
        match self.execute(&p, shutdown).await {
            Ok(()) => completed(promotion.mark_drift_clean(&job.id, &p.drift_check_id)),
            Err(err) => settle_failure(job, err, |code, message| {
                warn!(job_id = %job.id, environment_id = %p.environment_id, code, "drift detected");
                promotion.mark_drifted(&job.id, &p.drift_check_id, code, message)
            }),
        }
    }
}
