//! SiteService — site creation, listing and failed-state reset.

use serde::Serialize;
use tracing::info;

use pressgrid_queue::payload::{self, SiteCreatePayload};
use pressgrid_queue::EnqueueInput;
use pressgrid_state::*;

use crate::context::ServiceContext;
use crate::error::{ServiceError, ServiceResult};
use crate::lifecycle::{self, code_or};
use crate::validate::{normalize_name, normalize_slug, sslip_preview_url};

pub const SITE_CREATE_FAILED: &str = "SITE_CREATE_FAILED";

#[derive(Debug, Clone)]
pub struct CreateSiteInput {
    pub name: String,
    pub slug: String,
}

/// Accepted site creation.
#[derive(Debug, Clone, Serialize)]
pub struct CreateSiteResult {
    pub site: Site,
    pub environment: Environment,
    pub job_id: String,
}

#[derive(Clone)]
pub struct SiteService {
    ctx: ServiceContext,
}

impl SiteService {
    pub fn new(ctx: ServiceContext) -> Self {
        Self { ctx }
    }

    /// Create a site with its production environment and queue `site_create`.
    pub fn create(&self, input: CreateSiteInput) -> ServiceResult<CreateSiteResult> {
        let name = normalize_name(&input.name)?;
        let slug = normalize_slug(&input.slug)?;
        let now = self.ctx.clock.now();

        let result = self.ctx.store.with_tx(|tx| {
            let node = select_create_node(tx)?;
            let public_ip = node
                .public_ip()
                .ok_or_else(|| ServiceError::NodeMissingPublicIp(node.id.clone()))?
                .to_string();

            if tx.list::<Site>()?.iter().any(|s| s.slug == slug) {
                return Err(ServiceError::SlugConflict(slug.clone()));
            }

            let site_id = self.ctx.ids.new_id();
            let env_id = self.ctx.ids.new_id();

            let environment = Environment {
                id: env_id.clone(),
                site_id: site_id.clone(),
                name: "Production".into(),
                slug: "production".into(),
                environment_type: EnvironmentType::Production,
                status: LifecycleStatus::Active,
                node_id: node.id.clone(),
                source_environment_id: None,
                promotion_preset: PromotionPreset::ContentProtect,
                preview_url: sslip_preview_url(&env_id, &public_ip),
                primary_domain_id: None,
                current_release_id: None,
                drift_status: DriftStatus::Unknown,
                drift_checked_at: None,
                last_drift_check_id: None,
                fastcgi_cache_enabled: true,
                redis_cache_enabled: true,
                state_version: 1,
                created_at: now,
                updated_at: now,
            };
            let site = Site {
                id: site_id.clone(),
                name: name.clone(),
                slug: slug.clone(),
                status: LifecycleStatus::Active,
                primary_environment_id: Some(env_id.clone()),
                state_version: 1,
                created_at: now,
                updated_at: now,
            };
            tx.put(&site)?;
            tx.put(&environment)?;

            let body = payload::encode(&SiteCreatePayload {
                site_id: site_id.clone(),
                environment_id: env_id.clone(),
                node_id: node.id.clone(),
            })?;
            let job = self.ctx.queue.enqueue_in(
                tx,
                EnqueueInput::new(JobType::SiteCreate, body)
                    .site(&site_id)
                    .environment(&env_id)
                    .node(&node.id),
            )?;

            Ok(CreateSiteResult {
                site,
                environment,
                job_id: job.id,
            })
        })?;

        info!(site_id = %result.site.id, slug = %result.site.slug, job_id = %result.job_id, "site create accepted");
        self.ctx.audit_accepted("site.create", "site", &result.site.id);
        Ok(result)
    }

    /// All sites ordered by creation time.
    pub fn list(&self) -> ServiceResult<Vec<Site>> {
        let mut sites = self.ctx.store.list::<Site>()?;
        sites.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        Ok(sites)
    }

    pub fn get(&self, site_id: &str) -> ServiceResult<Site> {
        self.ctx
            .store
            .get::<Site>(site_id)?
            .ok_or_else(|| ServiceError::SiteNotFound(site_id.to_string()))
    }

    /// Return a failed site to `active` once nothing is in flight for it.
    pub fn reset_failed(&self, site_id: &str) -> ServiceResult<Site> {
        let now = self.ctx.clock.now();
        let site = self.ctx.store.with_tx(|tx| {
            let mut site = lifecycle::load_site(tx, site_id)?;
            if site.status != LifecycleStatus::Failed {
                return Err(ServiceError::ResourceNotFailed {
                    kind: "site",
                    id: site.id,
                });
            }
            if tx
                .active_jobs()?
                .iter()
                .any(|j| j.site_id.as_deref() == Some(site_id))
            {
                return Err(ServiceError::ResetValidationFailed(format!(
                    "site {site_id} has queued or running jobs"
                )));
            }
            if lifecycle::environments_of_site(tx, site_id)?
                .iter()
                .any(|e| e.status.is_mutating())
            {
                return Err(ServiceError::ResetValidationFailed(format!(
                    "site {site_id} has an environment mid-mutation"
                )));
            }
            site.status = LifecycleStatus::Active;
            lifecycle::save_site(tx, &mut site, now)?;
            Ok(site)
        })?;
        self.ctx.audit_accepted("site.reset", "site", &site.id);
        Ok(site)
    }

    // ── Completion APIs ────────────────────────────────────────────

    pub fn mark_create_succeeded(&self, job_id: &str, site_id: &str, environment_id: &str) -> ServiceResult<()> {
        let now = self.ctx.clock.now();
        self.ctx.store.with_tx(|tx| {
            let mut env = lifecycle::load_environment(tx, environment_id)?;
            if env.site_id != site_id {
                return Err(ServiceError::InvalidInput(format!(
                    "environment {environment_id} does not belong to site {site_id}"
                )));
            }
            lifecycle::finish_environment(tx, &mut env, LifecycleStatus::Active, now)?;
            lifecycle::succeed_job(&self.ctx.queue, tx, job_id, now)
        })
    }

    pub fn mark_create_failed(
        &self,
        job_id: &str,
        site_id: &str,
        environment_id: &str,
        code: &str,
        message: &str,
    ) -> ServiceResult<()> {
        let now = self.ctx.clock.now();
        self.ctx.store.with_tx(|tx| {
            let mut env = lifecycle::load_environment(tx, environment_id)?;
            if env.site_id != site_id {
                return Err(ServiceError::InvalidInput(format!(
                    "environment {environment_id} does not belong to site {site_id}"
                )));
            }
            lifecycle::finish_environment(tx, &mut env, LifecycleStatus::Failed, now)?;
            lifecycle::fail_job(
                &self.ctx.queue,
                tx,
                job_id,
                code_or(code, SITE_CREATE_FAILED),
                message,
                now,
            )
        })
    }
}

/// Active node for new sites: local nodes first, then oldest.
fn select_create_node(tx: &StoreTx) -> ServiceResult<Node> {
    let mut nodes: Vec<Node> = tx
        .list::<Node>()?
        .into_iter()
        .filter(|n| n.status == NodeStatus::Active)
        .collect();
    nodes.sort_by(|a, b| {
        (!a.is_local, a.created_at, &a.id).cmp(&(!b.is_local, b.created_at, &b.id))
    });
    nodes.into_iter().next().ok_or(ServiceError::NoAvailableNode)
}
