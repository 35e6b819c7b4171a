//! Shared transaction steps for the site and environment state machines.

use chrono::{DateTime, Utc};
use tracing::info;

use pressgrid_core::{truncate_tail, SERVICE_MESSAGE_MAX};
use pressgrid_queue::JobQueue;
use pressgrid_state::*;

use crate::error::{ServiceError, ServiceResult};
use crate::release;

// ── Loads ──────────────────────────────────────────────────────────

pub(crate) fn load_site(tx: &StoreTx, id: &str) -> ServiceResult<Site> {
    tx.get::<Site>(id)?
        .ok_or_else(|| ServiceError::SiteNotFound(id.to_string()))
}

pub(crate) fn load_environment(tx: &StoreTx, id: &str) -> ServiceResult<Environment> {
    tx.get::<Environment>(id)?
        .ok_or_else(|| ServiceError::EnvironmentNotFound(id.to_string()))
}

pub(crate) fn load_node(tx: &StoreTx, id: &str) -> ServiceResult<Node> {
    tx.get::<Node>(id)?
        .ok_or_else(|| ServiceError::NodeNotFound(id.to_string()))
}

pub(crate) fn load_backup(tx: &StoreTx, id: &str) -> ServiceResult<Backup> {
    tx.get::<Backup>(id)?
        .ok_or_else(|| ServiceError::BackupNotFound(id.to_string()))
}

/// Load an environment that must be `active`.
pub(crate) fn load_active_environment(tx: &StoreTx, id: &str) -> ServiceResult<Environment> {
    let env = load_environment(tx, id)?;
    require_active(&env)?;
    Ok(env)
}

pub(crate) fn require_active(env: &Environment) -> ServiceResult<()> {
    if env.status != LifecycleStatus::Active {
        return Err(ServiceError::EnvironmentNotActive {
            id: env.id.clone(),
            status: env.status,
        });
    }
    Ok(())
}

pub(crate) fn environments_of_site(tx: &StoreTx, site_id: &str) -> ServiceResult<Vec<Environment>> {
    Ok(tx
        .list::<Environment>()?
        .into_iter()
        .filter(|e| e.site_id == site_id)
        .collect())
}

// ── Transitions ────────────────────────────────────────────────────

/// Persist `env` with a bumped version.
pub(crate) fn save_environment(tx: &StoreTx, env: &mut Environment, now: DateTime<Utc>) -> ServiceResult<()> {
    env.state_version += 1;
    env.updated_at = now;
    tx.put(env)?;
    Ok(())
}

pub(crate) fn save_site(tx: &StoreTx, site: &mut Site, now: DateTime<Utc>) -> ServiceResult<()> {
    site.state_version += 1;
    site.updated_at = now;
    tx.put(site)?;
    Ok(())
}

pub(crate) fn set_environment_status(
    tx: &StoreTx,
    env: &mut Environment,
    status: LifecycleStatus,
    now: DateTime<Utc>,
) -> ServiceResult<()> {
    env.status = status;
    save_environment(tx, env, now)
}

pub(crate) fn set_site_status(
    tx: &StoreTx,
    site_id: &str,
    status: LifecycleStatus,
    now: DateTime<Utc>,
) -> ServiceResult<Site> {
    let mut site = load_site(tx, site_id)?;
    site.status = status;
    save_site(tx, &mut site, now)?;
    Ok(site)
}

/// Reconcile a site's status after an environment reached a terminal state.
///
/// All environments active → active; otherwise any failed → failed;
/// otherwise the site keeps its status.
pub(crate) fn reconcile_site(tx: &StoreTx, site_id: &str, now: DateTime<Utc>) -> ServiceResult<Site> {
    let mut site = load_site(tx, site_id)?;
    let envs = environments_of_site(tx, site_id)?;
    let next = if envs.iter().all(|e| e.status == LifecycleStatus::Active) {
        LifecycleStatus::Active
    } else if envs.iter().any(|e| e.status == LifecycleStatus::Failed) {
        LifecycleStatus::Failed
    } else {
        site.status
    };
    if next != site.status {
        site.status = next;
        save_site(tx, &mut site, now)?;
    }
    Ok(site)
}

/// Set the environment's terminal status and reconcile its site.
pub(crate) fn finish_environment(
    tx: &StoreTx,
    env: &mut Environment,
    status: LifecycleStatus,
    now: DateTime<Utc>,
) -> ServiceResult<Site> {
    set_environment_status(tx, env, status, now)?;
    reconcile_site(tx, &env.site_id, now)
}

// ── Job completion ─────────────────────────────────────────────────

pub(crate) fn succeed_job(queue: &JobQueue, tx: &StoreTx, job_id: &str, now: DateTime<Utc>) -> ServiceResult<()> {
    queue.complete_success_in(tx, job_id, now)?;
    Ok(())
}

/// Succeed a mutation job. Deploy, restore and promote also queue their health
/// check in `tx`, so the status change and the follow-up commit together.
pub(crate) fn succeed_mutation_job(
    queue: &JobQueue,
    tx: &StoreTx,
    job_id: &str,
    env: &Environment,
    now: DateTime<Utc>,
) -> ServiceResult<()> {
    let was_active = tx.get::<Job>(job_id)?.is_some_and(|job| !job.status.is_terminal());
    let job = queue.complete_success_in(tx, job_id, now)?;
    if !was_active || !job.job_type.triggers_health_check() {
        return Ok(());
    }
    match release::enqueue_health_check_in(queue, tx, job.job_type, env)? {
        Some(health) => info!(job_id, health_job_id = %health.id, environment_id = %env.id, "health check queued"),
        None => info!(job_id, environment_id = %env.id, "no current release, health check skipped"),
    }
    Ok(())
}

/// Fail the job with a service-level message (512-byte tail).
pub(crate) fn fail_job(
    queue: &JobQueue,
    tx: &StoreTx,
    job_id: &str,
    code: &str,
    message: &str,
    now: DateTime<Utc>,
) -> ServiceResult<()> {
    let message = truncate_tail(message, SERVICE_MESSAGE_MAX);
    let message = if message.is_empty() { code.to_string() } else { message };
    queue.complete_failure_in(tx, job_id, code, &message, now)?;
    Ok(())
}

/// Use `code` unless it is blank, then `fallback`.
pub(crate) fn code_or<'a>(code: &'a str, fallback: &'a str) -> &'a str {
    if code.trim().is_empty() { fallback } else { code }
}
