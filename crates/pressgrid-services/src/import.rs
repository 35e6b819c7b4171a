//! ImportService — import an existing WordPress archive into a site's primary environment.

use serde::Serialize;
use tracing::info;

use pressgrid_queue::payload::{self, SiteImportPayload};
use pressgrid_state::*;

use crate::context::ServiceContext;
use crate::environment::{mutation_job, release_path};
use crate::error::{ServiceError, ServiceResult};
use crate::lifecycle::{self, code_or};
use crate::validate::require_http_url;

pub const SITE_IMPORT_FAILED: &str = "SITE_IMPORT_FAILED";

#[derive(Debug, Clone, Serialize)]
pub struct ImportAccepted {
    pub environment: Environment,
    pub release: Release,
    pub target_url: String,
    pub job_id: String,
}

#[derive(Clone)]
pub struct ImportService {
    ctx: ServiceContext,
}

impl ImportService {
    pub fn new(ctx: ServiceContext) -> Self {
        Self { ctx }
    }

    pub fn import(&self, site_id: &str, archive_url: &str) -> ServiceResult<ImportAccepted> {
        let archive_url = require_http_url(archive_url)?;
        let now = self.ctx.clock.now();

        let accepted = self.ctx.store.with_tx(|tx| {
            let site = lifecycle::load_site(tx, site_id)?;
            if site.status != LifecycleStatus::Active {
                return Err(ServiceError::InvalidInput(format!(
                    "site {} is {:?}, not active",
                    site.id, site.status
                )));
            }
            let env_id = site
                .primary_environment_id
                .clone()
                .ok_or_else(|| ServiceError::EnvironmentNotFound(format!("primary of site {}", site.id)))?;
            let mut env = lifecycle::load_active_environment(tx, &env_id)?;
            let target_url = target_url(tx, &env)?;

            lifecycle::set_environment_status(tx, &mut env, LifecycleStatus::Restoring, now)?;
            lifecycle::set_site_status(tx, &site.id, LifecycleStatus::Restoring, now)?;

            let release_id = self.ctx.ids.new_id();
            let release = Release {
                id: release_id.clone(),
                environment_id: env.id.clone(),
                source_type: "upload".into(),
                source_ref: archive_url.clone(),
                path: release_path(&release_id),
                health_status: HealthStatus::Unknown,
                notes: Some("site import".into()),
                created_at: now,
            };
            tx.put(&release)?;

            let body = payload::encode(&SiteImportPayload {
                site_id: site.id.clone(),
                environment_id: env.id.clone(),
                node_id: env.node_id.clone(),
                archive_url: archive_url.clone(),
                release_id,
                target_url: target_url.clone(),
            })?;
            let job = self.ctx.queue.enqueue_in(tx, mutation_job(JobType::SiteImport, body, &env))?;
            Ok(ImportAccepted {
                environment: env,
                release,
                target_url,
                job_id: job.id,
            })
        })?;

        info!(site_id, job_id = %accepted.job_id, "site import accepted");
        self.ctx.audit_accepted("site.import", "site", site_id);
        Ok(accepted)
    }

    pub fn mark_import_succeeded(&self, job_id: &str, environment_id: &str, release_id: &str) -> ServiceResult<()> {
        let now = self.ctx.clock.now();
        self.ctx.store.with_tx(|tx| {
            let mut env = lifecycle::load_environment(tx, environment_id)?;
            env.current_release_id = Some(release_id.to_string());
            lifecycle::finish_environment(tx, &mut env, LifecycleStatus::Active, now)?;
            lifecycle::succeed_job(&self.ctx.queue, tx, job_id, now)
        })
    }

    pub fn mark_import_failed(&self, job_id: &str, environment_id: &str, code: &str, message: &str) -> ServiceResult<()> {
        let now = self.ctx.clock.now();
        self.ctx.store.with_tx(|tx| {
            let mut env = lifecycle::load_environment(tx, environment_id)?;
            lifecycle::finish_environment(tx, &mut env, LifecycleStatus::Failed, now)?;
            lifecycle::fail_job(&self.ctx.queue, tx, job_id, code_or(code, SITE_IMPORT_FAILED), message, now)
        })
    }
}

/// `https://<primary domain>` when one is attached, else the preview URL.
fn target_url(tx: &StoreTx, env: &Environment) -> ServiceResult<String> {
    if let Some(domain_id) = &env.primary_domain_id {
        if let Some(domain) = tx.get::<Domain>(domain_id)? {
            return Ok(format!("https://{}", domain.hostname));
        }
    }
    Ok(env.preview_url.clone())
}
