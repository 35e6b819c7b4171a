use async_trait::async_trait;
use serde_json::json;
use tokio::sync::watch;
use tracing::info;

use pressgrid_queue::payload::{EnvCreatePayload, SiteCreatePayload, SiteImportPayload};
use pressgrid_runner::{ExecutionError, Playbook};
use pressgrid_state::Job;

use super::{completed, decode_or_settle, row_key, settle_failure, JobHandler};

handler!(
    /// `site_create`: lay down the production environment of a new site.
    SiteCreateHandler
);

impl SiteCreateHandler {
    async fn execute(&self, p: &SiteCreatePayload, shutdown: watch::Receiver<bool>) -> Result<(), ExecutionError> {
        let site = self.ctx.site(&p.site_id)?;
        let env = self.ctx.environment(&p.environment_id)?;
        let target = self.ctx.target(&p.node_id)?;
        let vars = json!({
            "site_id": site.id,
            "site_slug": site.slug,
            "environment_id": env.id,
            "environment_slug": env.slug,
            "environment_type": env.environment_type,
            "preview_url": env.preview_url,
            "fastcgi_cache_enabled": env.fastcgi_cache_enabled,
            "redis_cache_enabled": env.redis_cache_enabled,
        });
        self.ctx.run(Playbook::SiteCreate, &target, &vars, shutdown).await?;
        Ok(())
    }
}

#[async_trait]
impl JobHandler for SiteCreateHandler {
    async fn handle(&self, job: &Job, shutdown: watch::Receiver<bool>) -> Result<(), ExecutionError> {
        let sites = &self.ctx.services.sites;
        let p: SiteCreatePayload = decode_or_settle(job, |code, message| {
            sites.mark_create_failed(&job.id, row_key(&job.site_id), row_key(&job.environment_id), code, message)
        })?;
        match self.execute(&p, shutdown).await {
            Ok(()) => {
                info!(job_id = %job.id, site_id = %p.site_id, environment_id = %p.environment_id, "site created");
                completed(sites.mark_create_succeeded(&job.id, &p.site_id, &p.environment_id))
            }
            Err(err) => settle_failure(job, err, |code, message| {
                sites.mark_create_failed(&job.id, &p.site_id, &p.environment_id, code, message)
            }),
        }
    }
}

handler!(
    /// `env_create`: clone a source environment into a new staging or clone environment.
    EnvCreateHandler
);

impl EnvCreateHandler {
    async fn execute(&self, p: &EnvCreatePayload, shutdown: watch::Receiver<bool>) -> Result<(), ExecutionError> {
        let site = self.ctx.site(&p.site_id)?;
        let env = self.ctx.environment(&p.environment_id)?;
        let source = self.ctx.environment(&p.source_environment_id)?;
        let target = self.ctx.target(&p.node_id)?;
        let vars = json!({
            "site_id": site.id,
            "site_slug": site.slug,
            "environment_id": env.id,
            "environment_slug": env.slug,
            "environment_type": env.environment_type,
            "source_environment_id": source.id,
            "source_preview_url": source.preview_url,
            "preview_url": env.preview_url,
            "fastcgi_cache_enabled": env.fastcgi_cache_enabled,
            "redis_cache_enabled": env.redis_cache_enabled,
        });
        self.ctx.run(Playbook::EnvCreate, &target, &vars, shutdown).await?;
        Ok(())
    }
}

#[async_trait]
impl JobHandler for EnvCreateHandler {
    async fn handle(&self, job: &Job, shutdown: watch::Receiver<bool>) -> Result<(), ExecutionError> {
        let envs = &self.ctx.services.environments;
        let p: EnvCreatePayload = decode_or_settle(job, |code, message| {
            envs.mark_create_failed(&job.id, row_key(&job.environment_id), code, message)
        })?;
        match self.execute(&p, shutdown).await {
            Ok(()) => completed(envs.mark_create_succeeded(&job.id, &p.environment_id)),
            Err(err) => settle_failure(job, err, |code, message| {
                envs.mark_create_failed(&job.id, &p.environment_id, code, message)
            }),
        }
    }
}

handler!(
    /// `site_import`: unpack an uploaded archive into the primary environment.
    SiteImportHandler
);

impl SiteImportHandler {
    async fn execute(&self, p: &SiteImportPayload, shutdown: watch::Receiver<bool>) -> Result<(), ExecutionError> {
        let site = self.ctx.site(&p.site_id)?;
        let env = self.ctx.environment(&p.environment_id)?;
        let target = self.ctx.target(&p.node_id)?;
        let vars = json!({
            "site_id": site.id,
            "site_slug": site.slug,
            "environment_id": env.id,
            "environment_slug": env.slug,
            "archive_url": p.archive_url,
            "release_id": p.release_id,
            "target_url": p.target_url,
        });
        self.ctx.run(Playbook::SiteImport, &target, &vars, shutdown).await?;
        Ok(())
    }
}

#[async_trait]
impl JobHandler for SiteImportHandler {
    async fn handle(&self, job: &Job, shutdown: watch::Receiver<bool>) -> Result<(), ExecutionError> {
        let imports = &self.ctx.services.imports;
        let p: SiteImportPayload = decode_or_settle(job, |code, message| {
            imports.mark_import_failed(&job.id, row_key(&job.environment_id), code, message)
        })?;
        match self.execute(&p, shutdown).await {
            Ok(()) => completed(imports.mark_import_succeeded(&job.id, &p.environment_id, &p.release_id)),
            Err(err) => settle_failure(job, err, |code, message| {
                imports.mark_import_failed(&job.id, &p.environment_id, code, message)
            }),
        }
    }
}
