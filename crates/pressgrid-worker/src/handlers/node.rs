use async_trait::async_trait;
use serde_json::json;
use tokio::sync::watch;
use tracing::info;

use pressgrid_queue::payload::NodeProvisionPayload;
use pressgrid_runner::{ExecutionError, InventoryTarget, Playbook};
use pressgrid_services::node::{NODE_PROVISION_FAILED, NODE_PROVISION_TIMEOUT};
use pressgrid_state::Job;

use super::{completed, decode_or_settle, internal, row_key, settle_failure, JobHandler};

handler!(
    /// `node_provision`: install the hosting stack on a registered node.
    NodeProvisionHandler
);

impl NodeProvisionHandler {
    async fn execute(&self, p: &NodeProvisionPayload, shutdown: watch::Receiver<bool>) -> Result<(), ExecutionError> {
        let node = self
            .ctx
            .services
            .nodes
            .mark_provisioning(&p.node_id)
            .map_err(internal)?;
        let vars = json!({
            "node_id": node.id,
            "node_hostname": node.hostname,
            "node_public_ip": node.public_ip().unwrap_or_default(),
        });
        let result = self
            .ctx
            .executor
            .run_with_timeout(
                Playbook::NodeProvision,
                &InventoryTarget::for_node(&node),
                &vars,
                shutdown,
                self.ctx.provision_timeout,
            )
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(err) if err.is_timeout() => Err(err.with_code(NODE_PROVISION_TIMEOUT)),
            Err(err) => Err(err.with_code(NODE_PROVISION_FAILED)),
        }
    }
}

#[async_trait]
impl JobHandler for NodeProvisionHandler {
    async fn handle(&self, job: &Job, shutdown: watch::Receiver<bool>) -> Result<(), ExecutionError> {
        let nodes = &self.ctx.services.nodes;
        let p: NodeProvisionPayload = decode_or_settle(job, |code, message| {
            nodes.mark_unreachable(&job.id, row_key(&job.node_id), code, message)
        })?;
        match self.execute(&p, shutdown).await {
            Ok(()) => {
                info!(job_id = %job.id, node_id = %p.node_id, "node provisioned");
                completed(nodes.mark_active(&job.id, &p.node_id))
            }
            Err(err) => settle_failure(job, err, |code, message| {
                nodes.mark_unreachable(&job.id, &p.node_id, code, message)
            }),
        }
    }
}
