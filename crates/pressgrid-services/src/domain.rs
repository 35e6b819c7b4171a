//! DomainService — custom hostnames attached to environments.

use serde::Serialize;
use tracing::info;

use pressgrid_queue::payload::{self, DomainAddPayload, DomainRemovePayload};
use pressgrid_runner::ExecutionError;
use pressgrid_state::*;

use crate::context::ServiceContext;
use crate::environment::mutation_job;
use crate::error::{ServiceError, ServiceResult};
use crate::lifecycle::{self, code_or};
use crate::validate::normalize_hostname;

pub const DOMAIN_ADD_FAILED: &str = "DOMAIN_ADD_FAILED";
pub const DOMAIN_REMOVE_FAILED: &str = "DOMAIN_REMOVE_FAILED";
pub const DOMAIN_DNS_MISMATCH: &str = "DOMAIN_DNS_MISMATCH";

pub const TLS_ISSUER: &str = "letsencrypt";

/// Non-retryable failure for a hostname that does not point at the node.
pub fn dns_mismatch_error(hostname: &str, node_ip: &str) -> ExecutionError {
    let hostname = match hostname.trim() {
        "" => "<unknown-hostname>",
        h => h,
    };
    let node_ip = match node_ip.trim() {
        "" => "<unknown-node-ip>",
        ip => ip,
    };
    ExecutionError::fatal(
        DOMAIN_DNS_MISMATCH,
        format!("dns mismatch: {hostname} does not resolve to node ip {node_ip}"),
    )
}

#[derive(Debug, Clone, Serialize)]
pub struct DomainAccepted {
    pub domain: Domain,
    pub job_id: String,
}

#[derive(Clone)]
pub struct DomainService {
    ctx: ServiceContext,
}

impl DomainService {
    pub fn new(ctx: ServiceContext) -> Self {
        Self { ctx }
    }

    pub fn get(&self, domain_id: &str) -> ServiceResult<Domain> {
        self.ctx
            .store
            .get::<Domain>(domain_id)?
            .ok_or_else(|| ServiceError::DomainNotFound(domain_id.to_string()))
    }

    pub fn list_by_environment(&self, environment_id: &str) -> ServiceResult<Vec<Domain>> {
        let mut domains: Vec<Domain> = self
            .ctx
            .store
            .list::<Domain>()?
            .into_iter()
            .filter(|d| d.environment_id == environment_id)
            .collect();
        domains.sort_by(|a, b| a.hostname.cmp(&b.hostname));
        Ok(domains)
    }

    pub fn add(&self, environment_id: &str, hostname: &str) -> ServiceResult<DomainAccepted> {
        let hostname = normalize_hostname(hostname)?;
        let now = self.ctx.clock.now();

        let accepted = self.ctx.store.with_tx(|tx| {
            let env = lifecycle::load_active_environment(tx, environment_id)?;
            let node = lifecycle::load_node(tx, &env.node_id)?;
            let node_ip = node
                .public_ip()
                .ok_or_else(|| ServiceError::NodeMissingPublicIp(node.id.clone()))?
                .to_string();
            if tx.list::<Domain>()?.iter().any(|d| d.hostname == hostname) {
                return Err(ServiceError::DomainConflict(hostname.clone()));
            }

            let domain = Domain {
                id: self.ctx.ids.new_id(),
                environment_id: env.id.clone(),
                hostname: hostname.clone(),
                tls_status: TlsStatus::Pending,
                tls_issuer: TLS_ISSUER.into(),
                created_at: now,
                updated_at: now,
            };
            tx.put(&domain)?;

            let body = payload::encode(&DomainAddPayload {
                environment_id: env.id.clone(),
                domain_id: domain.id.clone(),
                domain_hostname: hostname.clone(),
                node_public_ip: node_ip,
            })?;
            let job = self.ctx.queue.enqueue_in(tx, mutation_job(JobType::DomainAdd, body, &env))?;
            Ok(DomainAccepted { domain, job_id: job.id })
        })?;

        info!(domain_id = %accepted.domain.id, hostname = %accepted.domain.hostname, job_id = %accepted.job_id, "domain add accepted");
        self.ctx.audit_accepted("domain.add", "domain", &accepted.domain.id);
        Ok(accepted)
    }

    /// Queue removal. The row is deleted when the job succeeds.
    pub fn remove(&self, domain_id: &str) -> ServiceResult<DomainAccepted> {
        let accepted = self.ctx.store.with_tx(|tx| {
            let domain = tx
                .get::<Domain>(domain_id)?
                .ok_or_else(|| ServiceError::DomainNotFound(domain_id.to_string()))?;
            let env = lifecycle::load_active_environment(tx, &domain.environment_id)?;
            let body = payload::encode(&DomainRemovePayload {
                environment_id: env.id.clone(),
                domain_id: domain.id.clone(),
                domain_hostname: domain.hostname.clone(),
                preview_url: env.preview_url.clone(),
            })?;
            let job = self.ctx.queue.enqueue_in(tx, mutation_job(JobType::DomainRemove, body, &env))?;
            Ok::<_, ServiceError>(DomainAccepted { domain, job_id: job.id })
        })?;

        self.ctx.audit_accepted("domain.remove", "domain", &accepted.domain.id);
        Ok(accepted)
    }

    // ── Completion APIs ────────────────────────────────────────────

    /// TLS is live; the domain becomes primary when the environment has none.
    pub fn mark_add_succeeded(&self, job_id: &str, domain_id: &str) -> ServiceResult<()> {
        let now = self.ctx.clock.now();
        self.ctx.store.with_tx(|tx| {
            let mut domain = self.load(tx, domain_id)?;
            domain.tls_status = TlsStatus::Active;
            domain.updated_at = now;
            tx.put(&domain)?;

            let mut env = lifecycle::load_environment(tx, &domain.environment_id)?;
            if env.primary_domain_id.is_none() {
                env.primary_domain_id = Some(domain.id.clone());
                lifecycle::save_environment(tx, &mut env, now)?;
            }
            lifecycle::succeed_job(&self.ctx.queue, tx, job_id, now)
        })
    }

    pub fn mark_add_failed(&self, job_id: &str, domain_id: &str, code: &str, message: &str) -> ServiceResult<()> {
        let now = self.ctx.clock.now();
        self.ctx.store.with_tx(|tx| {
            let mut domain = self.load(tx, domain_id)?;
            domain.tls_status = TlsStatus::Failed;
            domain.updated_at = now;
            tx.put(&domain)?;
            lifecycle::fail_job(&self.ctx.queue, tx, job_id, code_or(code, DOMAIN_ADD_FAILED), message, now)
        })
    }

    /// Delete the row and clear the environment's primary pointer if it was this domain.
    pub fn mark_remove_succeeded(&self, job_id: &str, domain_id: &str) -> ServiceResult<()> {
        let now = self.ctx.clock.now();
        self.ctx.store.with_tx(|tx| {
            let domain = self.load(tx, domain_id)?;
            tx.delete::<Domain>(&domain.id)?;

            let mut env = lifecycle::load_environment(tx, &domain.environment_id)?;
            if env.primary_domain_id.as_deref() == Some(domain.id.as_str()) {
                env.primary_domain_id = None;
                lifecycle::save_environment(tx, &mut env, now)?;
            }
            lifecycle::succeed_job(&self.ctx.queue, tx, job_id, now)
        })
    }

    pub fn mark_remove_failed(&self, job_id: &str, domain_id: &str, code: &str, message: &str) -> ServiceResult<()> {
        let now = self.ctx.clock.now();
        self.ctx.store.with_tx(|tx| {
            self.load(tx, domain_id)?;
            lifecycle::fail_job(&self.ctx.queue, tx, job_id, code_or(code, DOMAIN_REMOVE_FAILED), message, now)
        })
    }

    fn load(&self, tx: &StoreTx, domain_id: &str) -> ServiceResult<Domain> {
        tx.get::<Domain>(domain_id)?
            .ok_or_else(|| ServiceError::DomainNotFound(domain_id.to_string()))
    }
}
