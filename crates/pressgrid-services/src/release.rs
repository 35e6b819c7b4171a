//! ReleaseService — post-mutation health checks and automatic rollback.
//!
//! ```text
//! env_deploy / env_restore / env_promote ──success──► health_check
//!                                                        │
//!                              healthy ◄──success────────┤
//!                                                        │ failure
//!                                                        ▼
//!              release unhealthy, env+site restoring, release_rollback queued
//!                                                        │
//!                    active, previous release ◄──success─┴─failure──► failed
//! ```

use serde::Serialize;
use tracing::{info, warn};

use pressgrid_queue::JobQueue;
use pressgrid_queue::payload::{self, HealthCheckPayload, ReleaseRollbackPayload};
use pressgrid_state::*;

use crate::context::ServiceContext;
use crate::environment::mutation_job;
use crate::error::{ServiceError, ServiceResult};
use crate::lifecycle::{self, code_or};

pub const HEALTH_CHECK_FAILED: &str = "HEALTH_CHECK_FAILED";
pub const HEALTH_CHECK_TIMEOUT: &str = "HEALTH_CHECK_TIMEOUT";
pub const RELEASE_ROLLBACK_FAILED: &str = "RELEASE_ROLLBACK_FAILED";
pub const RELEASE_ROLLBACK_TIMEOUT: &str = "RELEASE_ROLLBACK_TIMEOUT";

#[derive(Debug, Clone, Serialize)]
pub struct RollbackQueued {
    pub failed_release_id: String,
    pub restored_release_id: String,
    pub job_id: String,
}

#[derive(Clone)]
pub struct ReleaseService {
    ctx: ServiceContext,
}

impl ReleaseService {
    pub fn new(ctx: ServiceContext) -> Self {
        Self { ctx }
    }

    pub fn get(&self, release_id: &str) -> ServiceResult<Release> {
        self.ctx
            .store
            .get::<Release>(release_id)?
            .ok_or_else(|| ServiceError::ReleaseNotFound(release_id.to_string()))
    }

    /// Releases of an environment, newest first.
    pub fn list_by_environment(&self, environment_id: &str) -> ServiceResult<Vec<Release>> {
        self.ctx.store.read(|view| {
            let mut releases: Vec<Release> = view
                .list::<Release>()?
                .into_iter()
                .filter(|r| r.environment_id == environment_id)
                .collect();
            newest_first(&mut releases);
            Ok::<_, ServiceError>(releases)
        })
    }

    /// Queue a `health_check` of the environment's current release.
    ///
    /// Health checks get a single attempt: a failed check goes straight to rollback.
    pub fn trigger_health_check(&self, trigger: JobType, environment_id: &str) -> ServiceResult<Job> {
        if !trigger.triggers_health_check() {
            return Err(ServiceError::InvalidInput(format!(
                "{trigger} does not trigger a health check"
            )));
        }
        let job = self.ctx.store.with_tx(|tx| {
            let env = lifecycle::load_environment(tx, environment_id)?;
            enqueue_health_check_in(&self.ctx.queue, tx, trigger, &env)?
                .ok_or_else(|| ServiceError::ReleaseNotFound(env.id.clone()))
        })?;
        info!(environment_id, job_id = %job.id, %trigger, "health check queued");
        Ok(job)
    }

    pub fn mark_health_check_succeeded(&self, job_id: &str, release_id: &str) -> ServiceResult<()> {
        let now = self.ctx.clock.now();
        self.ctx.store.with_tx(|tx| {
            set_health(tx, release_id, HealthStatus::Healthy)?;
            lifecycle::succeed_job(&self.ctx.queue, tx, job_id, now)
        })
    }

    /// Fail the health job and queue a rollback to the previous release, atomically.
    ///
    /// With no previous release nothing is written and `NoRollbackRelease` is returned.
    pub fn handle_health_check_failure(
        &self,
        job_id: &str,
        environment_id: &str,
        release_id: &str,
        timed_out: bool,
        message: &str,
    ) -> ServiceResult<RollbackQueued> {
        let now = self.ctx.clock.now();
        let queued = self.ctx.store.with_tx(|tx| {
            let mut env = lifecycle::load_environment(tx, environment_id)?;
            let previous = previous_release(tx, &env.id, release_id)?
                .ok_or_else(|| ServiceError::NoRollbackRelease(env.id.clone()))?;

            set_health(tx, release_id, HealthStatus::Unhealthy)?;
            lifecycle::set_environment_status(tx, &mut env, LifecycleStatus::Restoring, now)?;
            lifecycle::set_site_status(tx, &env.site_id, LifecycleStatus::Restoring, now)?;

            let code = if timed_out { HEALTH_CHECK_TIMEOUT } else { HEALTH_CHECK_FAILED };
            lifecycle::fail_job(&self.ctx.queue, tx, job_id, code, message, now)?;

            let body = payload::encode(&ReleaseRollbackPayload {
                environment_id: env.id.clone(),
                failed_release_id: release_id.to_string(),
                restored_release_id: previous.id.clone(),
                health_check_job_id: job_id.to_string(),
            })?;
            let job = self
                .ctx
                .queue
                .enqueue_in(tx, mutation_job(JobType::ReleaseRollback, body, &env))?;
            Ok::<_, ServiceError>(RollbackQueued {
                failed_release_id: release_id.to_string(),
                restored_release_id: previous.id,
                job_id: job.id,
            })
        })?;
        warn!(
            environment_id,
            failed_release_id = %queued.failed_release_id,
            restored_release_id = %queued.restored_release_id,
            job_id = %queued.job_id,
            "health check failed, rollback queued"
        );
        Ok(queued)
    }

    pub fn mark_rollback_succeeded(&self, job_id: &str, environment_id: &str, restored_release_id: &str) -> ServiceResult<()> {
        let now = self.ctx.clock.now();
        self.ctx.store.with_tx(|tx| {
            let mut env = lifecycle::load_environment(tx, environment_id)?;
            set_health(tx, restored_release_id, HealthStatus::Healthy)?;
            env.current_release_id = Some(restored_release_id.to_string());
            lifecycle::finish_environment(tx, &mut env, LifecycleStatus::Active, now)?;
            lifecycle::succeed_job(&self.ctx.queue, tx, job_id, now)
        })
    }

    pub fn mark_rollback_failed(&self, job_id: &str, environment_id: &str, code: &str, message: &str) -> ServiceResult<()> {
        let now = self.ctx.clock.now();
        self.ctx.store.with_tx(|tx| {
            let mut env = lifecycle::load_environment(tx, environment_id)?;
            lifecycle::finish_environment(tx, &mut env, LifecycleStatus::Failed, now)?;
            lifecycle::fail_job(&self.ctx.queue, tx, job_id, code_or(code, RELEASE_ROLLBACK_FAILED), message, now)
        })
    }
}

/// Queue a `health_check` of `env`'s current release inside `tx`.
///
/// `None` when the environment has no current release.
pub(crate) fn enqueue_health_check_in(
    queue: &JobQueue,
    tx: &StoreTx,
    trigger: JobType,
    env: &Environment,
) -> ServiceResult<Option<Job>> {
    let Some(release_id) = env.current_release_id.clone() else {
        return Ok(None);
    };
    let body = payload::encode(&HealthCheckPayload {
        environment_id: env.id.clone(),
        release_id,
        trigger_job_type: trigger,
    })?;
    let job = queue.enqueue_in(tx, mutation_job(JobType::HealthCheck, body, env).max_attempts(1))?;
    Ok(Some(job))
}

fn newest_first(releases: &mut [Release]) {
    releases.sort_by(|a, b| (b.created_at, &b.id).cmp(&(a.created_at, &a.id)));
}

/// Most recent release of the environment other than `failed_release_id`.
fn previous_release(tx: &StoreTx, environment_id: &str, failed_release_id: &str) -> ServiceResult<Option<Release>> {
    let mut releases: Vec<Release> = tx
        .list::<Release>()?
        .into_iter()
        .filter(|r| r.environment_id == environment_id && r.id != failed_release_id)
        .collect();
    newest_first(&mut releases);
    Ok(releases.into_iter().next())
}

fn set_health(tx: &StoreTx, release_id: &str, health: HealthStatus) -> ServiceResult<()> {
    let mut release = tx
        .get::<Release>(release_id)?
        .ok_or_else(|| ServiceError::ReleaseNotFound(release_id.to_string()))?;
    release.health_status = health;
    tx.put(&release)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::DeployInput;
    use crate::testing::Fixture;

    /// Deploy and complete one release. Returns the release id and the health
    /// check its completion queued.
    fn deployed(fx: &Fixture, env_id: &str, reference: &str) -> (String, Job) {
        let accepted = fx
            .environments()
            .deploy(DeployInput {
                environment_id: env_id.to_string(),
                source_type: "git".into(),
                source_ref: reference.to_string(),
            })
            .unwrap();
        fx.environments()
            .mark_mutation_succeeded(&accepted.job_id, env_id, Some(&accepted.release.id))
            .unwrap();
        let health = fx
            .jobs_of(JobType::HealthCheck)
            .into_iter()
            .find(|j| j.status == JobStatus::Queued)
            .unwrap();
        (accepted.release.id, health)
    }

    #[test]
    fn deploy_completion_queues_health_check() {
        let fx = Fixture::new();
        fx.active_node("10.0.0.1");
        let site = fx.ready_site("acme");
        let prod = fx.production(&site);

        let (release_id, health) = deployed(&fx, &prod.id, "v1");
        assert_eq!(health.max_attempts, 1);
        assert_eq!(health.environment_id.as_deref(), Some(prod.id.as_str()));
        assert_eq!(health.payload["release_id"], release_id.as_str());
        assert_eq!(health.payload["trigger_job_type"], "env_deploy");

        let err = fx.backups().create(&prod.id, BackupScope::Full).unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn trigger_requires_mutation_type_and_release() {
        let fx = Fixture::new();
        fx.active_node("10.0.0.1");
        let site = fx.ready_site("acme");
        let prod = fx.production(&site);

        let err = fx
            .releases()
            .trigger_health_check(JobType::EnvUpdate, &prod.id)
            .unwrap_err();
        assert_eq!(err.code(), "InvalidInput");
        let err = fx
            .releases()
            .trigger_health_check(JobType::EnvRestore, &prod.id)
            .unwrap_err();
        assert_eq!(err.code(), "ReleaseNotFound");

        let (release_id, health) = deployed(&fx, &prod.id, "v1");
        fx.releases().mark_health_check_succeeded(&health.id, &release_id).unwrap();
        assert_eq!(fx.releases().get(&release_id).unwrap().health_status, HealthStatus::Healthy);

        let job = fx.releases().trigger_health_check(JobType::EnvRestore, &prod.id).unwrap();
        assert_eq!(job.max_attempts, 1);
        assert_eq!(job.payload["release_id"], release_id.as_str());
        assert_eq!(job.payload["trigger_job_type"], "env_restore");
    }

    #[test]
    fn failure_without_previous_release_writes_nothing() {
        let fx = Fixture::new();
        fx.active_node("10.0.0.1");
        let site = fx.ready_site("acme");
        let prod = fx.production(&site);
        let (release_id, job) = deployed(&fx, &prod.id, "v1");

        let err = fx
            .releases()
            .handle_health_check_failure(&job.id, &prod.id, &release_id, false, "503")
            .unwrap_err();
        assert_eq!(err.code(), "NoRollbackRelease");
        assert_eq!(fx.releases().get(&release_id).unwrap().health_status, HealthStatus::Unknown);
        assert_eq!(fx.environments().get(&prod.id).unwrap().status, LifecycleStatus::Active);
        assert_eq!(fx.ctx.queue.get(&job.id).unwrap().status, JobStatus::Queued);
    }

    /// Two healthy-then-new releases: `v1` passed its check, `v2` awaits one.
    fn two_releases(fx: &Fixture, env_id: &str) -> (String, String, Job) {
        let (v1, first) = deployed(fx, env_id, "v1");
        fx.releases().mark_health_check_succeeded(&first.id, &v1).unwrap();
        fx.advance_minutes(1);
        let (v2, health) = deployed(fx, env_id, "v2");
        (v1, v2, health)
    }

    #[test]
    fn failure_queues_rollback_and_success_restores_previous() {
        let fx = Fixture::new();
        fx.active_node("10.0.0.1");
        let site = fx.ready_site("acme");
        let prod = fx.production(&site);
        let (v1, v2, health) = two_releases(&fx, &prod.id);

        let queued = fx
            .releases()
            .handle_health_check_failure(&health.id, &prod.id, &v2, true, "deadline")
            .unwrap();
        assert_eq!(queued.restored_release_id, v1);
        assert_eq!(fx.releases().get(&v2).unwrap().health_status, HealthStatus::Unhealthy);
        assert_eq!(fx.environments().get(&prod.id).unwrap().status, LifecycleStatus::Restoring);
        assert_eq!(fx.site(&site.id).status, LifecycleStatus::Restoring);
        let health = fx.ctx.queue.get(&health.id).unwrap();
        assert_eq!(health.error_code.as_deref(), Some(HEALTH_CHECK_TIMEOUT));
        let rollback = fx.ctx.queue.get(&queued.job_id).unwrap();
        assert_eq!(rollback.payload["health_check_job_id"], health.id.as_str());

        fx.releases()
            .mark_rollback_succeeded(&queued.job_id, &prod.id, &v1)
            .unwrap();
        let env = fx.environments().get(&prod.id).unwrap();
        assert_eq!(env.status, LifecycleStatus::Active);
        assert_eq!(env.current_release_id.as_deref(), Some(v1.as_str()));
        assert_eq!(fx.releases().get(&v1).unwrap().health_status, HealthStatus::Healthy);
        assert_eq!(fx.site(&site.id).status, LifecycleStatus::Active);
    }

    #[test]
    fn rollback_failure_fails_environment_and_site() {
        let fx = Fixture::new();
        fx.active_node("10.0.0.1");
        let site = fx.ready_site("acme");
        let prod = fx.production(&site);
        let (_, v2, health) = two_releases(&fx, &prod.id);
        let queued = fx
            .releases()
            .handle_health_check_failure(&health.id, &prod.id, &v2, false, "500")
            .unwrap();

        fx.releases()
            .mark_rollback_failed(&queued.job_id, &prod.id, "", "still broken")
            .unwrap();
        assert_eq!(fx.environments().get(&prod.id).unwrap().status, LifecycleStatus::Failed);
        assert_eq!(fx.site(&site.id).status, LifecycleStatus::Failed);
        let job = fx.ctx.queue.get(&queued.job_id).unwrap();
        assert_eq!(job.error_code.as_deref(), Some(RELEASE_ROLLBACK_FAILED));
    }
}
