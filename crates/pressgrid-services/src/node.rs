//! NodeService — node registration and the provisioning state machine.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use pressgrid_queue::payload::{self, NodeProvisionPayload};
use pressgrid_queue::{EnqueueInput, QueueError};
use pressgrid_state::*;

use crate::context::ServiceContext;
use crate::error::{ServiceError, ServiceResult};
use crate::lifecycle::{self, code_or};

pub const NODE_PROVISION_FAILED: &str = "NODE_PROVISION_FAILED";
pub const NODE_PROVISION_TIMEOUT: &str = "NODE_PROVISION_TIMEOUT";

#[derive(Debug, Clone)]
pub struct RegisterNodeInput {
    pub name: String,
    pub hostname: String,
    pub public_ip: Option<String>,
    pub ssh_port: u16,
    pub ssh_user: String,
    pub ssh_private_key_path: Option<String>,
    pub is_local: bool,
}

impl Default for RegisterNodeInput {
    fn default() -> Self {
        Self {
            name: String::new(),
            hostname: String::new(),
            public_ip: None,
            ssh_port: 22,
            ssh_user: "root".into(),
            ssh_private_key_path: None,
            is_local: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RegisterNodeResult {
    pub node: Node,
    pub job_id: String,
}

#[derive(Clone)]
pub struct NodeService {
    ctx: ServiceContext,
}

impl NodeService {
    pub fn new(ctx: ServiceContext) -> Self {
        Self { ctx }
    }

    pub fn get(&self, node_id: &str) -> ServiceResult<Node> {
        self.ctx
            .store
            .get::<Node>(node_id)?
            .ok_or_else(|| ServiceError::NodeNotFound(node_id.to_string()))
    }

    pub fn list(&self) -> ServiceResult<Vec<Node>> {
        let mut nodes = self.ctx.store.list::<Node>()?;
        nodes.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        Ok(nodes)
    }

    /// Insert a `provisioning` node and queue `node_provision`.
    pub fn register(&self, input: RegisterNodeInput) -> ServiceResult<RegisterNodeResult> {
        let name = input.name.trim().to_string();
        let hostname = input.hostname.trim().to_lowercase();
        let ssh_user = input.ssh_user.trim().to_string();
        if hostname.is_empty() || hostname.chars().any(char::is_whitespace) {
            return Err(ServiceError::InvalidInput(format!("invalid node hostname {hostname:?}")));
        }
        if input.ssh_port == 0 {
            return Err(ServiceError::InvalidInput("ssh_port must be in 1..65535".into()));
        }
        if ssh_user.is_empty() {
            return Err(ServiceError::InvalidInput("ssh_user is required".into()));
        }
        let now = self.ctx.clock.now();

        let result = self.ctx.store.with_tx(|tx| {
            let node = Node {
                id: self.ctx.ids.new_id(),
                name: if name.is_empty() { hostname.clone() } else { name.clone() },
                hostname: hostname.clone(),
                public_ip: input
                    .public_ip
                    .as_deref()
                    .map(str::trim)
                    .filter(|ip| !ip.is_empty())
                    .map(str::to_string),
                ssh_port: input.ssh_port,
                ssh_user: ssh_user.clone(),
                ssh_private_key_path: input
                    .ssh_private_key_path
                    .as_deref()
                    .map(str::trim)
                    .filter(|k| !k.is_empty())
                    .map(str::to_string),
                status: NodeStatus::Provisioning,
                is_local: input.is_local,
                state_version: 1,
                created_at: now,
                updated_at: now,
            };
            tx.put(&node)?;
            let job = self.ctx.queue.enqueue_in(tx, provision_job(&node.id)?)?;
            Ok::<_, ServiceError>(RegisterNodeResult { node, job_id: job.id })
        })?;

        info!(node_id = %result.node.id, hostname = %result.node.hostname, job_id = %result.job_id, "node registered");
        self.ctx.audit_accepted("node.register", "node", &result.node.id);
        Ok(result)
    }

    /// Queue `node_provision` unless a job already holds the node.
    pub fn ensure_provision_queued(&self, node_id: &str) -> ServiceResult<Option<Job>> {
        let queued = self.ctx.store.with_tx(|tx| {
            lifecycle::load_node(tx, node_id)?;
            match self.ctx.queue.enqueue_in(tx, provision_job(node_id)?) {
                Ok(job) => Ok(Some(job)),
                Err(QueueError::ConcurrencyConflict { .. }) => Ok(None),
                Err(err) => Err(ServiceError::from(err)),
            }
        })?;
        if queued.is_none() {
            debug!(node_id, "provision already queued");
        }
        Ok(queued)
    }

    // ── Provisioning transitions ───────────────────────────────────

    pub fn mark_provisioning(&self, node_id: &str) -> ServiceResult<Node> {
        let now = self.ctx.clock.now();
        self.ctx
            .store
            .with_tx(|tx| set_node_status(tx, node_id, NodeStatus::Provisioning, now))
    }

    pub fn mark_active(&self, job_id: &str, node_id: &str) -> ServiceResult<()> {
        let now = self.ctx.clock.now();
        self.ctx.store.with_tx(|tx| {
            set_node_status(tx, node_id, NodeStatus::Active, now)?;
            lifecycle::succeed_job(&self.ctx.queue, tx, job_id, now)
        })
    }

    pub fn mark_unreachable(&self, job_id: &str, node_id: &str, code: &str, message: &str) -> ServiceResult<()> {
        let now = self.ctx.clock.now();
        self.ctx.store.with_tx(|tx| {
            set_node_status(tx, node_id, NodeStatus::Unreachable, now)?;
            lifecycle::fail_job(&self.ctx.queue, tx, job_id, code_or(code, NODE_PROVISION_FAILED), message, now)
        })
    }
}

fn provision_job(node_id: &str) -> ServiceResult<EnqueueInput> {
    let body = payload::encode(&NodeProvisionPayload {
        node_id: node_id.to_string(),
    })?;
    Ok(EnqueueInput::new(JobType::NodeProvision, body).node(node_id))
}

fn set_node_status(tx: &StoreTx, node_id: &str, status: NodeStatus, now: DateTime<Utc>) -> ServiceResult<Node> {
    let mut node = lifecycle::load_node(tx, node_id)?;
    if node.status != status {
        node.status = status;
        node.state_version += 1;
        node.updated_at = now;
        tx.put(&node)?;
    }
    Ok(node)
}
