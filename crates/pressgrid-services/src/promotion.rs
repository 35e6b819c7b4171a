//! PromotionService — drift checks and gated promotion between environments.
//!
//! A promotion copies a source environment onto a target of the same site.
//! Two gates guard it: the source's last drift check must be clean, and the
//! target must have a completed full backup from the last hour.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::info;

use pressgrid_queue::payload::{self, DriftCheckPayload, EnvPromotePayload};
use pressgrid_state::*;

use crate::context::ServiceContext;
use crate::environment::{mutation_job, release_path, BACKUP_FRESHNESS_MINUTES};
use crate::error::{ServiceError, ServiceResult};
use crate::lifecycle::{self, code_or};

pub const ENV_PROMOTE_FAILED: &str = "ENV_PROMOTE_FAILED";
pub const DRIFT_CHECK_FAILED: &str = "DRIFT_CHECK_FAILED";

#[derive(Debug, Clone, Serialize)]
pub struct DriftCheckAccepted {
    pub drift_check: DriftCheck,
    pub job_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PromoteAccepted {
    pub environment: Environment,
    pub release: Release,
    pub pre_promote_backup_id: String,
    pub job_id: String,
}

#[derive(Clone)]
pub struct PromotionService {
    ctx: ServiceContext,
}

impl PromotionService {
    pub fn new(ctx: ServiceContext) -> Self {
        Self { ctx }
    }

    pub fn drift_check_record(&self, drift_check_id: &str) -> ServiceResult<Option<DriftCheck>> {
        Ok(self.ctx.store.get::<DriftCheck>(drift_check_id)?)
    }

    /// Record an optimistic clean check and queue the real one.
    pub fn drift_check(&self, environment_id: &str) -> ServiceResult<DriftCheckAccepted> {
        let now = self.ctx.clock.now();
        let accepted = self.ctx.store.with_tx(|tx| {
            let mut env = lifecycle::load_active_environment(tx, environment_id)?;
            let check = DriftCheck {
                id: self.ctx.ids.new_id(),
                environment_id: env.id.clone(),
                promotion_preset: env.promotion_preset,
                status: DriftCheckStatus::Clean,
                db_checksums: serde_json::json!({}),
                file_checksums: serde_json::json!({}),
                checked_at: now,
            };
            tx.put(&check)?;

            env.drift_status = DriftStatus::Clean;
            env.drift_checked_at = Some(now);
            env.last_drift_check_id = Some(check.id.clone());
            lifecycle::save_environment(tx, &mut env, now)?;

            let body = payload::encode(&DriftCheckPayload {
                environment_id: env.id.clone(),
                drift_check_id: check.id.clone(),
                promotion_preset: env.promotion_preset,
            })?;
            let job = self
                .ctx
                .queue
                .enqueue_in(tx, mutation_job(JobType::DriftCheck, body, &env).job_id(&check.id))?;
            Ok::<_, ServiceError>(DriftCheckAccepted { drift_check: check, job_id: job.id })
        })?;

        info!(environment_id, drift_check_id = %accepted.drift_check.id, "drift check accepted");
        self.ctx
            .audit_accepted("environment.drift_check", "environment", environment_id);
        Ok(accepted)
    }

    pub fn promote(&self, source_environment_id: &str, target_environment_id: &str) -> ServiceResult<PromoteAccepted> {
        let now = self.ctx.clock.now();
        let accepted = self.ctx.store.with_tx(|tx| {
            let source = lifecycle::load_active_environment(tx, source_environment_id)?;
            let mut target = lifecycle::load_active_environment(tx, target_environment_id)?;
            if source.id == target.id {
                return Err(ServiceError::InvalidInput(
                    "source and target environments must differ".into(),
                ));
            }
            if source.site_id != target.site_id {
                return Err(ServiceError::InvalidInput(
                    "source and target environments belong to different sites".into(),
                ));
            }

            let drift_check_id = match (&source.drift_status, &source.last_drift_check_id) {
                (DriftStatus::Clean, Some(id)) => id.clone(),
                _ => {
                    return Err(ServiceError::DriftGateNotMet(format!(
                        "environment {} has no clean drift check",
                        source.id
                    )));
                }
            };
            let backup_id = fresh_full_backup(tx, &target.id, now)?.ok_or_else(|| {
                ServiceError::BackupGateNotMet(format!(
                    "environment {} has no completed full backup in the last {BACKUP_FRESHNESS_MINUTES} minutes",
                    target.id
                ))
            })?;

            lifecycle::set_environment_status(tx, &mut target, LifecycleStatus::Deploying, now)?;
            lifecycle::set_site_status(tx, &target.site_id, LifecycleStatus::Deploying, now)?;

            let release_id = self.ctx.ids.new_id();
            let release = Release {
                id: release_id.clone(),
                environment_id: target.id.clone(),
                source_type: "promotion".into(),
                source_ref: source.id.clone(),
                path: release_path(&release_id),
                health_status: HealthStatus::Unknown,
                notes: None,
                created_at: now,
            };
            tx.put(&release)?;

            let body = payload::encode(&EnvPromotePayload {
                source_environment_id: source.id.clone(),
                target_environment_id: target.id.clone(),
                promotion_preset: source.promotion_preset,
                drift_check_id,
                pre_promote_backup_id: backup_id.clone(),
                release_id,
            })?;
            let job = self
                .ctx
                .queue
                .enqueue_in(tx, mutation_job(JobType::EnvPromote, body, &target))?;
            Ok(PromoteAccepted {
                environment: target,
                release,
                pre_promote_backup_id: backup_id,
                job_id: job.id,
            })
        })?;

        info!(
            source_environment_id,
            target_environment_id,
            job_id = %accepted.job_id,
            "promotion accepted"
        );
        self.ctx
            .audit_accepted("environment.promote", "environment", target_environment_id);
        Ok(accepted)
    }

    // ── Completion APIs ────────────────────────────────────────────

    pub fn mark_promote_succeeded(&self, job_id: &str, target_environment_id: &str, release_id: &str) -> ServiceResult<()> {
        let now = self.ctx.clock.now();
        self.ctx.store.with_tx(|tx| {
            let mut env = lifecycle::load_environment(tx, target_environment_id)?;
            if !release_id.trim().is_empty() {
                env.current_release_id = Some(release_id.trim().to_string());
            }
            lifecycle::finish_environment(tx, &mut env, LifecycleStatus::Active, now)?;
            lifecycle::succeed_mutation_job(&self.ctx.queue, tx, job_id, &env, now)
        })
    }

    pub fn mark_promote_failed(&self, job_id: &str, target_environment_id: &str, code: &str, message: &str) -> ServiceResult<()> {
        let now = self.ctx.clock.now();
        self.ctx.store.with_tx(|tx| {
            let mut env = lifecycle::load_environment(tx, target_environment_id)?;
            lifecycle::finish_environment(tx, &mut env, LifecycleStatus::Failed, now)?;
            lifecycle::fail_job(&self.ctx.queue, tx, job_id, code_or(code, ENV_PROMOTE_FAILED), message, now)
        })
    }

    pub fn mark_drift_clean(&self, job_id: &str, drift_check_id: &str) -> ServiceResult<()> {
        let now = self.ctx.clock.now();
        self.ctx.store.with_tx(|tx| {
            let mut check = load_drift_check(tx, drift_check_id)?;
            check.status = DriftCheckStatus::Clean;
            check.checked_at = now;
            tx.put(&check)?;
            lifecycle::succeed_job(&self.ctx.queue, tx, job_id, now)
        })
    }

    /// Mark the check drifted and, if it is still the environment's latest, the environment too.
    pub fn mark_drifted(&self, job_id: &str, drift_check_id: &str, code: &str, message: &str) -> ServiceResult<()> {
        let now = self.ctx.clock.now();
        self.ctx.store.with_tx(|tx| {
            let mut check = load_drift_check(tx, drift_check_id)?;
            check.status = DriftCheckStatus::Drifted;
            check.checked_at = now;
            tx.put(&check)?;

            let mut env = lifecycle::load_environment(tx, &check.environment_id)?;
            if env.last_drift_check_id.as_deref() == Some(check.id.as_str()) {
                env.drift_status = DriftStatus::Drifted;
                env.drift_checked_at = Some(now);
                lifecycle::save_environment(tx, &mut env, now)?;
            }
            lifecycle::fail_job(&self.ctx.queue, tx, job_id, code_or(code, DRIFT_CHECK_FAILED), message, now)
        })
    }
}

fn load_drift_check(tx: &StoreTx, id: &str) -> ServiceResult<DriftCheck> {
    tx.get::<DriftCheck>(id)?
        .ok_or_else(|| ServiceError::InvalidInput(format!("drift check not found: {id}")))
}

/// Newest completed full backup of the environment inside the freshness window.
fn fresh_full_backup(tx: &StoreTx, environment_id: &str, now: DateTime<Utc>) -> ServiceResult<Option<String>> {
    let cutoff = now - Duration::minutes(BACKUP_FRESHNESS_MINUTES);
    Ok(tx
        .list::<Backup>()?
        .into_iter()
        .filter(|b| {
            b.environment_id == environment_id
                && b.status == BackupStatus::Completed
                && b.backup_scope == BackupScope::Full
        })
        .filter_map(|b| b.completed_at.filter(|at| *at >= cutoff).map(|at| (at, b.id)))
        .max()
        .map(|(_, id)| id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::CreateEnvironmentInput;
    use crate::testing::Fixture;

    /// Site with an active production and an active staging clone of it.
    fn pair(fx: &Fixture) -> (Environment, Environment) {
        fx.active_node("10.0.0.1");
        let site = fx.ready_site("acme");
        let prod = fx.production(&site);
        let staging = fx
            .environments()
            .create(CreateEnvironmentInput {
                site_id: site.id.clone(),
                name: "Staging".into(),
                slug: "staging".into(),
                environment_type: EnvironmentType::Staging,
                source_environment_id: prod.id.clone(),
                promotion_preset: PromotionPreset::ContentProtect,
            })
            .unwrap();
        fx.environments()
            .mark_create_succeeded(&staging.job_id, &staging.environment.id)
            .unwrap();
        (fx.environments().get(&staging.environment.id).unwrap(), prod)
    }

    #[test]
    fn drift_check_is_optimistically_clean() {
        let fx = Fixture::new();
        let (staging, _) = pair(&fx);

        let accepted = fx.promotion().drift_check(&staging.id).unwrap();
        assert_eq!(accepted.job_id, accepted.drift_check.id);
        let env = fx.environments().get(&staging.id).unwrap();
        assert_eq!(env.drift_status, DriftStatus::Clean);
        assert_eq!(env.last_drift_check_id.as_deref(), Some(accepted.drift_check.id.as_str()));

        fx.promotion()
            .mark_drifted(&accepted.job_id, &accepted.drift_check.id, "", "plugins differ")
            .unwrap();
        let env = fx.environments().get(&staging.id).unwrap();
        assert_eq!(env.drift_status, DriftStatus::Drifted);
        let check = fx.promotion().drift_check_record(&accepted.drift_check.id).unwrap().unwrap();
        assert_eq!(check.status, DriftCheckStatus::Drifted);
    }

    #[test]
    fn promote_enforces_drift_then_backup_gate() {
        let fx = Fixture::new();
        let (staging, prod) = pair(&fx);

        let err = fx.promotion().promote(&staging.id, &prod.id).unwrap_err();
        assert_eq!(err.code(), "DriftGateNotMet");

        let check = fx.promotion().drift_check(&staging.id).unwrap();
        fx.promotion().mark_drift_clean(&check.job_id, &check.drift_check.id).unwrap();
        let err = fx.promotion().promote(&staging.id, &prod.id).unwrap_err();
        assert_eq!(err.code(), "BackupGateNotMet");

        fx.completed_backup(&prod.id, 100);
        fx.advance_minutes(61);
        assert_eq!(
            fx.promotion().promote(&staging.id, &prod.id).unwrap_err().code(),
            "BackupGateNotMet"
        );

        let fresh = fx.completed_backup(&prod.id, 100);
        let accepted = fx.promotion().promote(&staging.id, &prod.id).unwrap();
        assert_eq!(accepted.pre_promote_backup_id, fresh.id);
        assert_eq!(accepted.environment.status, LifecycleStatus::Deploying);
        assert_eq!(accepted.release.source_type, "promotion");
        assert_eq!(accepted.release.source_ref, staging.id);

        let job = fx.ctx.queue.get(&accepted.job_id).unwrap();
        assert_eq!(job.job_type, JobType::EnvPromote);
        assert_eq!(job.payload["drift_check_id"], check.drift_check.id.as_str());
        assert_eq!(job.payload["release_id"], accepted.release.id.as_str());
    }

    #[test]
    fn promote_rejects_same_environment() {
        let fx = Fixture::new();
        let (staging, _) = pair(&fx);
        let err = fx.promotion().promote(&staging.id, &staging.id).unwrap_err();
        assert_eq!(err.code(), "InvalidInput");
    }

    #[test]
    fn promote_completion_installs_release() {
        let fx = Fixture::new();
        let (staging, prod) = pair(&fx);
        let check = fx.promotion().drift_check(&staging.id).unwrap();
        fx.promotion().mark_drift_clean(&check.job_id, &check.drift_check.id).unwrap();
        fx.completed_backup(&prod.id, 100);

        let accepted = fx.promotion().promote(&staging.id, &prod.id).unwrap();
        fx.promotion()
            .mark_promote_succeeded(&accepted.job_id, &prod.id, &accepted.release.id)
            .unwrap();
        let env = fx.environments().get(&prod.id).unwrap();
        assert_eq!(env.status, LifecycleStatus::Active);
        assert_eq!(env.current_release_id.as_deref(), Some(accepted.release.id.as_str()));
        assert_eq!(fx.site(&env.site_id).status, LifecycleStatus::Active);
    }
}
