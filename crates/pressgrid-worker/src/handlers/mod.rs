//! Per-job-type handlers.
//!
//! A handler reads what it needs from the store, runs one playbook through
//! the [`PlaybookExecutor`] and reports the result through the owning
//! service's completion API. Entity state is never written here directly.
//!
//! Failure completion (`mark_*_failed`) only happens on the final attempt:
//! the error is non-retryable or the job has used its last attempt. The
//! error is then returned with `retryable` forced off. Earlier retryable
//! failures leave the entity in its in-flight status for the retry.
//! A payload that does not decode is final on its first attempt.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::watch;
use tracing::error;

use pressgrid_queue::{payload, JobPayload};
use pressgrid_runner::{codes, ExecutionError, InventoryTarget, Playbook, PlaybookExecutor};
use pressgrid_services::{artifacts, ServiceResult, Services};
use pressgrid_state::{Environment, Job, JobType, Node, Site};

/// Declare a handler struct holding a [`HandlerContext`].
macro_rules! handler {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        pub struct $name {
            ctx: $crate::handlers::HandlerContext,
        }

        impl $name {
            pub fn new(ctx: $crate::handlers::HandlerContext) -> Self {
                Self { ctx }
            }
        }
    };
}

mod backup;
mod domain;
mod environment;
mod node;
mod promotion;
mod release;
mod site;

pub use backup::{BackupCleanupHandler, BackupCreateHandler, BACKUP_CLEANUP_INTERNAL};
pub use domain::{DomainAddHandler, DomainRemoveHandler};
pub use environment::{CachePurgeHandler, EnvCacheToggleHandler, EnvDeployHandler, EnvRestoreHandler, EnvUpdateHandler};
pub use node::NodeProvisionHandler;
pub use promotion::{DriftCheckHandler, EnvPromoteHandler};
pub use release::{HealthCheckHandler, ReleaseRollbackHandler};
pub use site::{EnvCreateHandler, SiteCreateHandler, SiteImportHandler};

pub const DEFAULT_PROVISION_TIMEOUT: Duration = Duration::from_secs(120);

/// Executes the effect of one job type.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job, shutdown: watch::Receiver<bool>) -> Result<(), ExecutionError>;
}

/// Job type → handler.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<JobType, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A handler for every job type, all sharing `ctx`.
    pub fn standard(ctx: HandlerContext) -> Self {
        let mut registry = Self::new();
        registry
            .register(JobType::NodeProvision, NodeProvisionHandler::new(ctx.clone()))
            .register(JobType::SiteCreate, SiteCreateHandler::new(ctx.clone()))
            .register(JobType::EnvCreate, EnvCreateHandler::new(ctx.clone()))
            .register(JobType::EnvDeploy, EnvDeployHandler::new(ctx.clone()))
            .register(JobType::EnvRestore, EnvRestoreHandler::new(ctx.clone()))
            .register(JobType::EnvUpdate, EnvUpdateHandler::new(ctx.clone()))
            .register(JobType::EnvPromote, EnvPromoteHandler::new(ctx.clone()))
            .register(JobType::EnvCacheToggle, EnvCacheToggleHandler::new(ctx.clone()))
            .register(JobType::CachePurge, CachePurgeHandler::new(ctx.clone()))
            .register(JobType::BackupCreate, BackupCreateHandler::new(ctx.clone()))
            .register(JobType::BackupCleanup, BackupCleanupHandler::new(ctx.clone()))
            .register(JobType::DomainAdd, DomainAddHandler::new(ctx.clone()))
            .register(JobType::DomainRemove, DomainRemoveHandler::new(ctx.clone()))
            .register(JobType::DriftCheck, DriftCheckHandler::new(ctx.clone()))
            .register(JobType::HealthCheck, HealthCheckHandler::new(ctx.clone()))
            .register(JobType::ReleaseRollback, ReleaseRollbackHandler::new(ctx.clone()))
            .register(JobType::SiteImport, SiteImportHandler::new(ctx));
        registry
    }

    pub fn register(&mut self, job_type: JobType, handler: impl JobHandler + 'static) -> &mut Self {
        self.handlers.insert(job_type, Arc::new(handler));
        self
    }

    pub fn get(&self, job_type: JobType) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(&job_type).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// What every handler needs: services, the playbook executor and the
/// local artifact root.
#[derive(Clone)]
pub struct HandlerContext {
    pub services: Services,
    pub executor: PlaybookExecutor,
    pub artifact_dir: PathBuf,
    pub provision_timeout: Duration,
}

impl HandlerContext {
    pub fn new(services: Services, executor: PlaybookExecutor, artifact_dir: impl Into<PathBuf>) -> Self {
        Self {
            services,
            executor,
            artifact_dir: artifact_dir.into(),
            provision_timeout: DEFAULT_PROVISION_TIMEOUT,
        }
    }

    pub fn with_provision_timeout(mut self, timeout: Duration) -> Self {
        self.provision_timeout = timeout;
        self
    }

    // ── Loads ──────────────────────────────────────────────────────

    pub(crate) fn site(&self, site_id: &str) -> Result<Site, ExecutionError> {
        self.services.sites.get(site_id).map_err(internal)
    }

    pub(crate) fn environment(&self, environment_id: &str) -> Result<Environment, ExecutionError> {
        self.services.environments.get(environment_id).map_err(internal)
    }

    pub(crate) fn node(&self, node_id: &str) -> Result<Node, ExecutionError> {
        self.services.nodes.get(node_id).map_err(internal)
    }

    pub(crate) fn target(&self, node_id: &str) -> Result<InventoryTarget, ExecutionError> {
        self.node(node_id).map(|node| InventoryTarget::for_node(&node))
    }

    pub(crate) fn artifact_path(&self, storage_path: &str) -> PathBuf {
        artifacts::local_artifact_path(&self.artifact_dir, storage_path)
    }

    pub(crate) fn artifact_root(&self) -> &Path {
        &self.artifact_dir
    }

    pub(crate) async fn run(
        &self,
        playbook: Playbook,
        target: &InventoryTarget,
        vars: &Value,
        shutdown: watch::Receiver<bool>,
    ) -> Result<String, ExecutionError> {
        self.executor.run(playbook, target, vars, shutdown).await
    }
}

// ── Shared helpers ─────────────────────────────────────────────────

pub(crate) fn decode<P: JobPayload>(job: &Job) -> Result<P, ExecutionError> {
    payload::decode::<P>(job).map_err(internal)
}

/// A non-playbook failure inside a handler.
pub(crate) fn internal(err: impl fmt::Display) -> ExecutionError {
    ExecutionError::fatal(codes::ANSIBLE_UNKNOWN_EXIT, err.to_string())
}

/// Map a completion API error after a successful playbook run.
pub(crate) fn completed(result: ServiceResult<()>) -> Result<(), ExecutionError> {
    result.map_err(internal)
}

pub(crate) fn is_final(job: &Job, err: &ExecutionError) -> bool {
    !err.retryable || job.attempt_count >= job.max_attempts
}

/// Decode the payload. A payload that does not decode is final, so the
/// entity the job row points at is failed through `mark` first.
pub(crate) fn decode_or_settle<P, F>(job: &Job, mark: F) -> Result<P, ExecutionError>
where
    P: JobPayload,
    F: FnOnce(&str, &str) -> ServiceResult<()>,
{
    decode::<P>(job).map_err(|err| settle(job, err, mark))
}

/// A key column of the job row; empty when the row does not carry it.
pub(crate) fn row_key(key: &Option<String>) -> &str {
    key.as_deref().unwrap_or_default()
}

/// A string field of the raw payload, readable even when the payload as a
/// whole does not decode.
pub(crate) fn raw_field<'a>(job: &'a Job, name: &str) -> &'a str {
    job.payload.get(name).and_then(Value::as_str).unwrap_or_default()
}

/// On the final attempt run `mark` with the error's code and message.
/// Always returns the error, non-retryable once final.
pub(crate) fn settle_failure<F>(job: &Job, err: ExecutionError, mark: F) -> Result<(), ExecutionError>
where
    F: FnOnce(&str, &str) -> ServiceResult<()>,
{
    Err(settle(job, err, mark))
}

fn settle<F>(job: &Job, err: ExecutionError, mark: F) -> ExecutionError
where
    F: FnOnce(&str, &str) -> ServiceResult<()>,
{
    let err = err.normalized();
    if !is_final(job, &err) {
        return err;
    }
    if let Err(e) = mark(&err.code, &err.message) {
        error!(
            job_id = %job.id,
            job_type = %job.job_type,
            code = e.code(),
            error = %e,
            "failure completion failed"
        );
    }
    err.non_retryable()
}
