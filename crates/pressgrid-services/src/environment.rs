//! EnvironmentService — clone, deploy, update, restore and cache commands.
//!
//! Every command is one store transaction: load, validate, transition the
//! environment (and its site), enqueue the job. The completion APIs at the
//! bottom are what handlers call when their playbook run is over.

use chrono::Duration;
use serde::Serialize;
use tracing::info;

use pressgrid_queue::payload::{
    self, CachePurgePayload, EnvCacheTogglePayload, EnvCreatePayload, EnvDeployPayload,
    EnvRestorePayload, EnvUpdatePayload,
};
use pressgrid_queue::EnqueueInput;
use pressgrid_state::*;

use crate::artifacts;
use crate::context::ServiceContext;
use crate::error::{ServiceError, ServiceResult};
use crate::lifecycle::{self, code_or};
use crate::validate::{normalize_name, normalize_slug, short_id, sslip_preview_url, url_host};

pub const ENV_CREATE_FAILED: &str = "ENV_CREATE_FAILED";
pub const ENV_MUTATION_FAILED: &str = "ENV_MUTATION_FAILED";
pub const ENV_RESTORE_FAILED: &str = "ENV_RESTORE_FAILED";

/// Backups completed within this window count as fresh.
pub const BACKUP_FRESHNESS_MINUTES: i64 = 60;

/// Install path of a release on the node.
pub fn release_path(release_id: &str) -> String {
    format!("/var/www/sites/releases/{release_id}")
}

#[derive(Debug, Clone)]
pub struct CreateEnvironmentInput {
    pub site_id: String,
    pub name: String,
    pub slug: String,
    pub environment_type: EnvironmentType,
    pub source_environment_id: String,
    pub promotion_preset: PromotionPreset,
}

#[derive(Debug, Clone)]
pub struct DeployInput {
    pub environment_id: String,
    /// `git` or `upload`.
    pub source_type: String,
    pub source_ref: String,
}

#[derive(Debug, Clone)]
pub struct UpdatesInput {
    pub environment_id: String,
    /// `core`, `plugins`, `themes` or `all`.
    pub scope: String,
}

#[derive(Debug, Clone)]
pub struct RestoreInput {
    pub environment_id: String,
    pub backup_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct CacheToggleInput {
    pub environment_id: String,
    pub fastcgi_cache_enabled: Option<bool>,
    pub redis_cache_enabled: Option<bool>,
}

/// Accepted command: the updated environment and the queued job.
#[derive(Debug, Clone, Serialize)]
pub struct Accepted {
    pub environment: Environment,
    pub job_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeployAccepted {
    pub environment: Environment,
    pub release: Release,
    pub job_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdatesAccepted {
    pub environment: Environment,
    pub pre_update_backup_id: String,
    pub job_id: String,
}

#[derive(Clone)]
pub struct EnvironmentService {
    ctx: ServiceContext,
}

impl EnvironmentService {
    pub fn new(ctx: ServiceContext) -> Self {
        Self { ctx }
    }

    pub fn get(&self, environment_id: &str) -> ServiceResult<Environment> {
        self.ctx
            .store
            .get::<Environment>(environment_id)?
            .ok_or_else(|| ServiceError::EnvironmentNotFound(environment_id.to_string()))
    }

    pub fn list_by_site(&self, site_id: &str) -> ServiceResult<Vec<Environment>> {
        let mut envs: Vec<Environment> = self
            .ctx
            .store
            .list::<Environment>()?
            .into_iter()
            .filter(|e| e.site_id == site_id)
            .collect();
        envs.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        Ok(envs)
    }

    /// The restore request recorded for an `env_restore` job.
    pub fn restore_request(&self, job_id: &str) -> ServiceResult<Option<RestoreRequest>> {
        Ok(self.ctx.store.get::<RestoreRequest>(job_id)?)
    }

    // ── Commands ───────────────────────────────────────────────────

    /// Clone `source_environment_id` into a new staging or clone environment.
    pub fn create(&self, input: CreateEnvironmentInput) -> ServiceResult<Accepted> {
        let name = normalize_name(&input.name)?;
        let slug = normalize_slug(&input.slug)?;
        if input.environment_type == EnvironmentType::Production {
            return Err(ServiceError::InvalidInput(
                "environment type must be staging or clone".into(),
            ));
        }
        let source_id = input.source_environment_id.trim();
        if source_id.is_empty() {
            return Err(ServiceError::InvalidInput("source_environment_id is required".into()));
        }
        let now = self.ctx.clock.now();

        let accepted = self.ctx.store.with_tx(|tx| {
            let mut site = lifecycle::load_site(tx, &input.site_id)?;
            let source = lifecycle::load_environment(tx, source_id)?;
            if source.site_id != site.id {
                return Err(ServiceError::InvalidInput(format!(
                    "source environment {source_id} belongs to another site"
                )));
            }
            let siblings = lifecycle::environments_of_site(tx, &site.id)?;
            if siblings.iter().any(|e| e.slug == slug) {
                return Err(ServiceError::SlugConflict(slug.clone()));
            }

            let node = lifecycle::load_node(tx, &source.node_id)?;
            let env_id = self.ctx.ids.new_id();
            let preview_url = self.derive_preview_url(&env_id, &source, &node)?;

            let environment = Environment {
                id: env_id.clone(),
                site_id: site.id.clone(),
                name: name.clone(),
                slug: slug.clone(),
                environment_type: input.environment_type,
                status: LifecycleStatus::Cloning,
                node_id: node.id.clone(),
                source_environment_id: Some(source.id.clone()),
                promotion_preset: input.promotion_preset,
                preview_url,
                primary_domain_id: None,
                current_release_id: None,
                drift_status: DriftStatus::Unknown,
                drift_checked_at: None,
                last_drift_check_id: None,
                fastcgi_cache_enabled: source.fastcgi_cache_enabled,
                redis_cache_enabled: source.redis_cache_enabled,
                state_version: 1,
                created_at: now,
                updated_at: now,
            };
            tx.put(&environment)?;

            if site.status == LifecycleStatus::Active {
                site.status = LifecycleStatus::Cloning;
                lifecycle::save_site(tx, &mut site, now)?;
            }

            let body = payload::encode(&EnvCreatePayload {
                site_id: site.id.clone(),
                environment_id: env_id.clone(),
                node_id: node.id.clone(),
                source_environment_id: source.id.clone(),
            })?;
            let job = self.ctx.queue.enqueue_in(
                tx,
                EnqueueInput::new(JobType::EnvCreate, body)
                    .site(&site.id)
                    .environment(&env_id)
                    .node(&node.id),
            )?;
            Ok(Accepted { environment, job_id: job.id })
        })?;

        info!(environment_id = %accepted.environment.id, job_id = %accepted.job_id, "environment create accepted");
        self.ctx
            .audit_accepted("environment.create", "environment", &accepted.environment.id);
        Ok(accepted)
    }

    /// Deploy a new release from git or an upload.
    pub fn deploy(&self, input: DeployInput) -> ServiceResult<DeployAccepted> {
        let source_type = input.source_type.trim().to_lowercase();
        if source_type != "git" && source_type != "upload" {
            return Err(ServiceError::InvalidInput(format!(
                "source_type must be git or upload, got {source_type:?}"
            )));
        }
        let source_ref = input.source_ref.trim().to_string();
        if source_ref.is_empty() {
            return Err(ServiceError::InvalidInput("source_ref is required".into()));
        }
        let now = self.ctx.clock.now();

        let accepted = self.ctx.store.with_tx(|tx| {
            let mut env = lifecycle::load_active_environment(tx, &input.environment_id)?;
            lifecycle::set_environment_status(tx, &mut env, LifecycleStatus::Deploying, now)?;
            lifecycle::set_site_status(tx, &env.site_id, LifecycleStatus::Deploying, now)?;

            let release_id = self.ctx.ids.new_id();
            let release = Release {
                id: release_id.clone(),
                environment_id: env.id.clone(),
                source_type: source_type.clone(),
                source_ref: source_ref.clone(),
                path: release_path(&release_id),
                health_status: HealthStatus::Unknown,
                notes: None,
                created_at: now,
            };
            tx.put(&release)?;

            let body = payload::encode(&EnvDeployPayload {
                environment_id: env.id.clone(),
                release_id: release_id.clone(),
                source_type: source_type.clone(),
                source_ref: source_ref.clone(),
            })?;
            let job = self.ctx.queue.enqueue_in(tx, mutation_job(JobType::EnvDeploy, body, &env))?;
            Ok::<_, ServiceError>(DeployAccepted {
                environment: env,
                release,
                job_id: job.id,
            })
        })?;

        info!(environment_id = %accepted.environment.id, release_id = %accepted.release.id, job_id = %accepted.job_id, "deploy accepted");
        self.ctx
            .audit_accepted("environment.deploy", "environment", &accepted.environment.id);
        Ok(accepted)
    }

    /// Run core/plugin/theme updates behind a fresh pre-update backup.
    pub fn updates(&self, input: UpdatesInput) -> ServiceResult<UpdatesAccepted> {
        let scope = input.scope.trim().to_lowercase();
        if !matches!(scope.as_str(), "core" | "plugins" | "themes" | "all") {
            return Err(ServiceError::InvalidInput(format!(
                "scope must be core, plugins, themes or all, got {scope:?}"
            )));
        }
        let now = self.ctx.clock.now();

        let accepted = self.ctx.store.with_tx(|tx| {
            let mut env = lifecycle::load_active_environment(tx, &input.environment_id)?;
            lifecycle::set_environment_status(tx, &mut env, LifecycleStatus::Deploying, now)?;
            lifecycle::set_site_status(tx, &env.site_id, LifecycleStatus::Deploying, now)?;

            let backup_id = self.ensure_fresh_backup(tx, &env.id, now)?;

            let body = payload::encode(&EnvUpdatePayload {
                environment_id: env.id.clone(),
                scope: scope.clone(),
                pre_update_backup_id: backup_id.clone(),
                pre_update_backup_fresh: true,
            })?;
            let job = self.ctx.queue.enqueue_in(tx, mutation_job(JobType::EnvUpdate, body, &env))?;
            Ok::<_, ServiceError>(UpdatesAccepted {
                environment: env,
                pre_update_backup_id: backup_id,
                job_id: job.id,
            })
        })?;

        info!(environment_id = %accepted.environment.id, job_id = %accepted.job_id, "updates accepted");
        self.ctx
            .audit_accepted("environment.updates", "environment", &accepted.environment.id);
        Ok(accepted)
    }

    /// Restore a completed backup of the same environment.
    pub fn restore(&self, input: RestoreInput) -> ServiceResult<Accepted> {
        let now = self.ctx.clock.now();

        let accepted = self.ctx.store.with_tx(|tx| {
            let mut env = lifecycle::load_active_environment(tx, &input.environment_id)?;
            let backup = tx
                .get::<Backup>(input.backup_id.trim())?
                .filter(|b| b.environment_id == env.id)
                .ok_or_else(|| ServiceError::BackupNotFound(input.backup_id.clone()))?;
            if !is_restorable(&backup) {
                return Err(ServiceError::BackupNotCompleted(backup.id));
            }

            lifecycle::set_environment_status(tx, &mut env, LifecycleStatus::Restoring, now)?;
            lifecycle::set_site_status(tx, &env.site_id, LifecycleStatus::Restoring, now)?;

            let body = payload::encode(&EnvRestorePayload {
                environment_id: env.id.clone(),
                backup_id: backup.id.clone(),
            })?;
            let job = self.ctx.queue.enqueue_in(
                tx,
                mutation_job(JobType::EnvRestore, body, &env).max_attempts(1),
            )?;
            tx.put(&RestoreRequest {
                job_id: job.id.clone(),
                environment_id: env.id.clone(),
                backup_id: backup.id.clone(),
                created_at: now,
            })?;
            Ok(Accepted { environment: env, job_id: job.id })
        })?;

        info!(environment_id = %accepted.environment.id, job_id = %accepted.job_id, "restore accepted");
        self.ctx
            .audit_accepted("environment.restore", "environment", &accepted.environment.id);
        Ok(accepted)
    }

    /// Change cache flags. Only the provided flags are written and sent.
    pub fn toggle_cache(&self, input: CacheToggleInput) -> ServiceResult<Accepted> {
        if input.fastcgi_cache_enabled.is_none() && input.redis_cache_enabled.is_none() {
            return Err(ServiceError::InvalidInput(
                "at least one cache flag is required".into(),
            ));
        }
        let now = self.ctx.clock.now();

        let accepted = self.ctx.store.with_tx(|tx| {
            let mut env = lifecycle::load_active_environment(tx, &input.environment_id)?;
            if let Some(enabled) = input.fastcgi_cache_enabled {
                env.fastcgi_cache_enabled = enabled;
            }
            if let Some(enabled) = input.redis_cache_enabled {
                env.redis_cache_enabled = enabled;
            }
            lifecycle::save_environment(tx, &mut env, now)?;

            let body = payload::encode(&EnvCacheTogglePayload {
                environment_id: env.id.clone(),
                fastcgi_cache_enabled: input.fastcgi_cache_enabled,
                redis_cache_enabled: input.redis_cache_enabled,
            })?;
            let job = self
                .ctx
                .queue
                .enqueue_in(tx, mutation_job(JobType::EnvCacheToggle, body, &env))?;
            Ok::<_, ServiceError>(Accepted { environment: env, job_id: job.id })
        })?;

        self.ctx
            .audit_accepted("environment.cache_toggle", "environment", &accepted.environment.id);
        Ok(accepted)
    }

    /// Purge caches using the environment's current flags.
    pub fn purge_cache(&self, environment_id: &str) -> ServiceResult<Accepted> {
        let accepted = self.ctx.store.with_tx(|tx| {
            let env = lifecycle::load_active_environment(tx, environment_id)?;
            let body = payload::encode(&CachePurgePayload {
                environment_id: env.id.clone(),
                fastcgi_cache_enabled: env.fastcgi_cache_enabled,
                redis_cache_enabled: env.redis_cache_enabled,
            })?;
            let job = self
                .ctx
                .queue
                .enqueue_in(tx, mutation_job(JobType::CachePurge, body, &env))?;
            Ok::<_, ServiceError>(Accepted { environment: env, job_id: job.id })
        })?;

        self.ctx
            .audit_accepted("environment.cache_purge", "environment", &accepted.environment.id);
        Ok(accepted)
    }

    /// Return a failed environment to `active`; the site follows when nothing else is wrong.
    pub fn reset_failed(&self, environment_id: &str) -> ServiceResult<Environment> {
        let now = self.ctx.clock.now();
        let env = self.ctx.store.with_tx(|tx| {
            let mut env = lifecycle::load_environment(tx, environment_id)?;
            if env.status != LifecycleStatus::Failed {
                return Err(ServiceError::ResourceNotFailed {
                    kind: "environment",
                    id: env.id,
                });
            }
            if tx
                .active_jobs()?
                .iter()
                .any(|j| j.environment_id.as_deref() == Some(env.id.as_str()))
            {
                return Err(ServiceError::ResetValidationFailed(format!(
                    "environment {} has queued or running jobs",
                    env.id
                )));
            }
            lifecycle::set_environment_status(tx, &mut env, LifecycleStatus::Active, now)?;

            let mut site = lifecycle::load_site(tx, &env.site_id)?;
            if site.status == LifecycleStatus::Failed {
                let blocked = lifecycle::environments_of_site(tx, &site.id)?
                    .iter()
                    .any(|e| e.status == LifecycleStatus::Failed || e.status.is_mutating());
                if !blocked {
                    site.status = LifecycleStatus::Active;
                    lifecycle::save_site(tx, &mut site, now)?;
                }
            }
            Ok(env)
        })?;
        self.ctx.audit_accepted("environment.reset", "environment", &env.id);
        Ok(env)
    }

    // ── Completion APIs ────────────────────────────────────────────

    pub fn mark_create_succeeded(&self, job_id: &str, environment_id: &str) -> ServiceResult<()> {
        self.finish(job_id, environment_id, LifecycleStatus::Active, None, |_| Ok(()))
    }

    pub fn mark_create_failed(&self, job_id: &str, environment_id: &str, code: &str, message: &str) -> ServiceResult<()> {
        self.finish(
            job_id,
            environment_id,
            LifecycleStatus::Failed,
            Some((code_or(code, ENV_CREATE_FAILED), message)),
            |_| Ok(()),
        )
    }

    /// Deploy or update finished; a deploy also installs `release_id`.
    pub fn mark_mutation_succeeded(&self, job_id: &str, environment_id: &str, release_id: Option<&str>) -> ServiceResult<()> {
        let release_id = release_id.map(str::trim).filter(|r| !r.is_empty());
        let now = self.ctx.clock.now();
        self.ctx.store.with_tx(|tx| {
            let mut env = lifecycle::load_environment(tx, environment_id)?;
            if let Some(release_id) = release_id {
                env.current_release_id = Some(release_id.to_string());
            }
            lifecycle::finish_environment(tx, &mut env, LifecycleStatus::Active, now)?;
            lifecycle::succeed_mutation_job(&self.ctx.queue, tx, job_id, &env, now)
        })
    }

    pub fn mark_mutation_failed(&self, job_id: &str, environment_id: &str, code: &str, message: &str) -> ServiceResult<()> {
        self.finish(
            job_id,
            environment_id,
            LifecycleStatus::Failed,
            Some((code_or(code, ENV_MUTATION_FAILED), message)),
            |_| Ok(()),
        )
    }

    pub fn mark_restore_succeeded(&self, job_id: &str, environment_id: &str) -> ServiceResult<()> {
        self.finish(job_id, environment_id, LifecycleStatus::Active, None, |tx| {
            tx.delete::<RestoreRequest>(job_id)?;
            Ok(())
        })
    }

    pub fn mark_restore_failed(&self, job_id: &str, environment_id: &str, code: &str, message: &str) -> ServiceResult<()> {
        self.finish(
            job_id,
            environment_id,
            LifecycleStatus::Failed,
            Some((code_or(code, ENV_RESTORE_FAILED), message)),
            |tx| {
                tx.delete::<RestoreRequest>(job_id)?;
                Ok(())
            },
        )
    }

    // ── Internals ──────────────────────────────────────────────────

    /// Terminal transition shared by the completion APIs.
    fn finish<F>(
        &self,
        job_id: &str,
        environment_id: &str,
        status: LifecycleStatus,
        failure: Option<(&str, &str)>,
        extra: F,
    ) -> ServiceResult<()>
    where
        F: FnOnce(&StoreTx) -> ServiceResult<()>,
    {
        let now = self.ctx.clock.now();
        self.ctx.store.with_tx(|tx| {
            let mut env = lifecycle::load_environment(tx, environment_id)?;
            lifecycle::finish_environment(tx, &mut env, status, now)?;
            extra(tx)?;
            match failure {
                Some((code, message)) => lifecycle::fail_job(&self.ctx.queue, tx, job_id, code, message, now),
                None => lifecycle::succeed_mutation_job(&self.ctx.queue, tx, job_id, &env, now),
            }
        })
    }

    fn derive_preview_url(&self, env_id: &str, source: &Environment, node: &Node) -> ServiceResult<String> {
        if let Some(domain) = &self.ctx.preview_domain {
            return Ok(format!("https://{}.{domain}", short_id(env_id)));
        }
        let rest = url_host(&source.preview_url)
            .and_then(|host| host.split_once('.'))
            .map(|(_, rest)| rest)
            .filter(|rest| !rest.is_empty());
        if let Some(rest) = rest {
            return Ok(format!("http://{}.{rest}", short_id(env_id)));
        }
        let ip = node
            .public_ip()
            .ok_or_else(|| ServiceError::NodeMissingPublicIp(node.id.clone()))?;
        Ok(sslip_preview_url(env_id, ip))
    }

    /// Newest completed backup inside the freshness window, or a new completed placeholder.
    fn ensure_fresh_backup(&self, tx: &StoreTx, environment_id: &str, now: chrono::DateTime<chrono::Utc>) -> ServiceResult<String> {
        let cutoff = now - Duration::minutes(BACKUP_FRESHNESS_MINUTES);
        let fresh = tx
            .list::<Backup>()?
            .into_iter()
            .filter(|b| b.environment_id == environment_id && b.status == BackupStatus::Completed)
            .filter_map(|b| b.completed_at.map(|at| (at, b.id)))
            .filter(|(at, _)| *at >= cutoff)
            .max();
        if let Some((_, id)) = fresh {
            return Ok(id);
        }

        let backup_id = self.ctx.ids.new_id();
        let storage_path = artifacts::storage_path(environment_id, &backup_id);
        tx.put(&Backup {
            id: backup_id.clone(),
            environment_id: environment_id.to_string(),
            backup_scope: BackupScope::Full,
            status: BackupStatus::Completed,
            storage_type: "s3".into(),
            checksum: Some(artifacts::checksum_bytes(storage_path.as_bytes())),
            storage_path,
            retention_until: now + self.ctx.backup_retention,
            size_bytes: Some(0),
            created_at: now,
            completed_at: Some(now),
        })?;
        Ok(backup_id)
    }
}

/// Job input carrying the environment's site, environment and node keys.
pub(crate) fn mutation_job(job_type: JobType, body: serde_json::Value, env: &Environment) -> EnqueueInput {
    EnqueueInput::new(job_type, body)
        .site(&env.site_id)
        .environment(&env.id)
        .node(&env.node_id)
}

/// Completed, checksummed and non-empty.
pub fn is_restorable(backup: &Backup) -> bool {
    backup.status == BackupStatus::Completed
        && backup.checksum.as_deref().is_some_and(|c| !c.trim().is_empty())
        && backup.size_bytes.is_some_and(|size| size > 0)
}
