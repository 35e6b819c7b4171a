use async_trait::async_trait;
use serde_json::json;
use tokio::sync::watch;
use tracing::{info, warn};

use pressgrid_queue::payload::{DomainAddPayload, DomainRemovePayload};
use pressgrid_runner::{ExecutionError, Playbook};
use pressgrid_services::dns_mismatch_error;
use pressgrid_state::Job;

use super::{completed, decode_or_settle, raw_field, settle_failure, JobHandler};

/// Marker the domain playbook prints when the hostname points elsewhere.
const DNS_MISMATCH_MARKER: &str = "dns mismatch";

handler!(
    /// `domain_add`: verify DNS, then issue TLS for a custom hostname.
    DomainAddHandler
);

impl DomainAddHandler {
    async fn execute(&self, p: &DomainAddPayload, shutdown: watch::Receiver<bool>) -> Result<(), ExecutionError> {
        let env = self.ctx.environment(&p.environment_id)?;
        let target = self.ctx.target(&env.node_id)?;
        let vars = json!({
            "site_id": env.site_id,
            "environment_id": env.id,
            "domain_id": p.domain_id,
            "domain_hostname": p.domain_hostname,
            "node_public_ip": p.node_public_ip,
        });
        match self.ctx.run(Playbook::DomainAdd, &target, &vars, shutdown).await {
            Ok(_) => Ok(()),
            Err(err) if err.message.to_ascii_lowercase().contains(DNS_MISMATCH_MARKER) => {
                warn!(domain_id = %p.domain_id, hostname = %p.domain_hostname, "dns does not point at node");
                Err(dns_mismatch_error(&p.domain_hostname, &p.node_public_ip))
            }
            Err(err) => Err(err),
        }
    }
}

#[async_trait]
impl JobHandler for DomainAddHandler {
    async fn handle(&self, job: &Job, shutdown: watch::Receiver<bool>) -> Result<(), ExecutionError> {
        let domains = &self.ctx.services.domains;
        let p: DomainAddPayload = decode_or_settle(job, |code, message| {
            domains.mark_add_failed(&job.id, raw_field(job, "domain_id"), code, message)
        })?;
        match self.execute(&p, shutdown).await {
            Ok(()) => {
                info!(job_id = %job.id, domain_id = %p.domain_id, hostname = %p.domain_hostname, "domain attached");
                completed(domains.mark_add_succeeded(&job.id, &p.domain_id))
            }
            Err(err) => settle_failure(job, err, |code, message| {
                domains.mark_add_failed(&job.id, &p.domain_id, code, message)
            }),
        }
    }
}

handler!(
    /// `domain_remove`: drop the vhost and certificate; the row goes on success.
    DomainRemoveHandler
);

impl DomainRemoveHandler {
    async fn execute(&self, p: &DomainRemovePayload, shutdown: watch::Receiver<bool>) -> Result<(), ExecutionError> {
        let env = self.ctx.environment(&p.environment_id)?;
        let target = self.ctx.target(&env.node_id)?;
        let vars = json!({
            "site_id": env.site_id,
            "environment_id": env.id,
            "domain_id": p.domain_id,
            "domain_hostname": p.domain_hostname,
            "preview_url": p.preview_url,
        });
        self.ctx.run(Playbook::DomainRemove, &target, &vars, shutdown).await?;
        Ok(())
    }
}

#[async_trait]
impl JobHandler for DomainRemoveHandler {
    async fn handle(&self, job: &Job, shutdown: watch::Receiver<bool>) -> Result<(), ExecutionError> {
        let domains = &self.ctx.services.domains;
        let p: DomainRemovePayload = decode_or_settle(job, |code, message| {
            domains.mark_remove_failed(&job.id, raw_field(job, "domain_id"), code, message)
        })?;
        match self.execute(&p, shutdown).await {
            Ok(()) => completed(domains.mark_remove_succeeded(&job.id, &p.domain_id)),
            Err(err) => settle_failure(job, err, |code, message| {
                domains.mark_remove_failed(&job.id, &p.domain_id, code, message)
            }),
        }
    }
}
