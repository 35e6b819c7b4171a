//! Node readiness report: static checks, then SSH probes.

use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use pressgrid_runner::{is_unreachable_output, SshError, SshRunner};
use pressgrid_state::{Node, NodeStatus};

pub const NODE_STATUS_NOT_ACTIVE: &str = "node_status_not_active";
pub const NODE_HOST_MISSING: &str = "node_host_missing";
pub const SSH_PORT_INVALID: &str = "ssh_port_invalid";
pub const SSH_USER_MISSING: &str = "ssh_user_missing";
pub const NODE_UNREACHABLE: &str = "node_unreachable";
pub const SUDO_UNAVAILABLE: &str = "sudo_unavailable";
pub const RUNTIME_MISSING: &str = "runtime_missing";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReadinessReason {
    pub code: &'static str,
    pub guidance: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReadinessReport {
    pub node_id: String,
    pub ready: bool,
    pub reasons: Vec<ReadinessReason>,
}

fn reason(code: &'static str) -> ReadinessReason {
    let guidance = match code {
        NODE_STATUS_NOT_ACTIVE => "wait for provisioning to finish or re-run node provisioning",
        NODE_HOST_MISSING => "set the node hostname or public ip",
        SSH_PORT_INVALID => "set an ssh port between 1 and 65535",
        SSH_USER_MISSING => "set the ssh user the control plane connects as",
        NODE_UNREACHABLE => "check network access, firewall rules and the ssh key",
        SUDO_UNAVAILABLE => "grant the ssh user passwordless sudo",
        RUNTIME_MISSING => "install wp-cli on the node or re-run provisioning",
        _ => "",
    };
    ReadinessReason { code, guidance }
}

#[derive(Clone)]
pub struct ReadinessChecker {
    ssh: Arc<dyn SshRunner>,
}

impl ReadinessChecker {
    pub fn new(ssh: Arc<dyn SshRunner>) -> Self {
        Self { ssh }
    }

    pub async fn evaluate(&self, node: &Node) -> ReadinessReport {
        let mut reasons = static_reasons(node);
        if reasons.is_empty() && !node.is_local {
            reasons.extend(self.probe(node).await);
        }
        ReadinessReport {
            node_id: node.id.clone(),
            ready: reasons.is_empty(),
            reasons,
        }
    }

    async fn probe(&self, node: &Node) -> Option<ReadinessReason> {
        let host = connect_host(node);
        let probes: [(&[&str], &'static str); 2] = [
            (&["sudo", "-n", "true"], SUDO_UNAVAILABLE),
            (&["command", "-v", "wp"], RUNTIME_MISSING),
        ];
        for (args, failure) in probes {
            let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
            match self.ssh.run(host, node.ssh_port, node.ssh_user.trim(), &args).await {
                Ok(_) => {}
                Err(SshError::Spawn(message)) => {
                    debug!(node_id = %node.id, %message, "ssh probe could not start");
                    return Some(reason(NODE_UNREACHABLE));
                }
                Err(err) if is_unreachable_output(err.output()) => {
                    return Some(reason(NODE_UNREACHABLE));
                }
                Err(_) => return Some(reason(failure)),
            }
        }
        None
    }
}

fn connect_host(node: &Node) -> &str {
    node.public_ip().unwrap_or_else(|| node.hostname.trim())
}

fn static_reasons(node: &Node) -> Vec<ReadinessReason> {
    let mut reasons = Vec::new();
    if node.status != NodeStatus::Active {
        reasons.push(reason(NODE_STATUS_NOT_ACTIVE));
    }
    if node.hostname.trim().is_empty() && node.public_ip().is_none() {
        reasons.push(reason(NODE_HOST_MISSING));
    }
    if node.ssh_port == 0 {
        reasons.push(reason(SSH_PORT_INVALID));
    }
    if node.ssh_user.trim().is_empty() {
        reasons.push(reason(SSH_USER_MISSING));
    }
    reasons
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::Utc;

    use super::*;

    /// Replies to each probe in order and records the commands it saw.
    struct ScriptedSsh {
        replies: Mutex<Vec<Result<String, SshError>>>,
        seen: Mutex<Vec<String>>,
    }

    impl ScriptedSsh {
        fn new(replies: Vec<Result<String, SshError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl SshRunner for ScriptedSsh {
        async fn run(&self, host: &str, _port: u16, _user: &str, args: &[String]) -> Result<String, SshError> {
            self.seen.lock().unwrap().push(format!("{host}: {}", args.join(" ")));
            let mut replies = self.replies.lock().unwrap();
            if replies.is_empty() {
                return Ok(String::new());
            }
            replies.remove(0)
        }
    }

    fn node(status: NodeStatus) -> Node {
        let now = Utc::now();
        Node {
            id: "n1".into(),
            name: "web-1".into(),
            hostname: "web-1.example".into(),
            public_ip: Some("198.51.100.10".into()),
            ssh_port: 22,
            ssh_user: "deploy".into(),
            ssh_private_key_path: None,
            status,
            is_local: false,
            state_version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    fn codes(report: &ReadinessReport) -> Vec<&'static str> {
        report.reasons.iter().map(|r| r.code).collect()
    }

    #[tokio::test]
    async fn static_failures_skip_probes() {
        let ssh = ScriptedSsh::new(vec![]);
        let checker = ReadinessChecker::new(ssh.clone());
        let mut n = node(NodeStatus::Provisioning);
        n.ssh_user = " ".into();

        let report = checker.evaluate(&n).await;
        assert!(!report.ready);
        assert_eq!(codes(&report), vec![NODE_STATUS_NOT_ACTIVE, SSH_USER_MISSING]);
        assert!(ssh.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn healthy_node_runs_both_probes() {
        let ssh = ScriptedSsh::new(vec![Ok(String::new()), Ok("/usr/local/bin/wp\n".into())]);
        let checker = ReadinessChecker::new(ssh.clone());

        let report = checker.evaluate(&node(NodeStatus::Active)).await;
        assert!(report.ready);
        assert_eq!(
            *ssh.seen.lock().unwrap(),
            vec!["198.51.100.10: sudo -n true", "198.51.100.10: command -v wp"]
        );
    }

    #[tokio::test]
    async fn probe_failures_map_to_reasons() {
        let refused = SshError::Exit {
            code: 255,
            output: "ssh: connect to host: Connection refused".into(),
        };
        let report = ReadinessChecker::new(ScriptedSsh::new(vec![Err(refused)]))
            .evaluate(&node(NodeStatus::Active))
            .await;
        assert_eq!(codes(&report), vec![NODE_UNREACHABLE]);

        let no_sudo = SshError::Exit { code: 1, output: "sudo: a password is required".into() };
        let report = ReadinessChecker::new(ScriptedSsh::new(vec![Err(no_sudo)]))
            .evaluate(&node(NodeStatus::Active))
            .await;
        assert_eq!(codes(&report), vec![SUDO_UNAVAILABLE]);

        let no_wp = SshError::Exit { code: 1, output: String::new() };
        let report = ReadinessChecker::new(ScriptedSsh::new(vec![Ok(String::new()), Err(no_wp)]))
            .evaluate(&node(NodeStatus::Active))
            .await;
        assert_eq!(codes(&report), vec![RUNTIME_MISSING]);
        assert!(!report.reasons[0].guidance.is_empty());
    }

    #[tokio::test]
    async fn local_nodes_are_not_probed() {
        let ssh = ScriptedSsh::new(vec![]);
        let mut n = node(NodeStatus::Active);
        n.is_local = true;
        let report = ReadinessChecker::new(ssh.clone()).evaluate(&n).await;
        assert!(report.ready);
        assert!(ssh.seen.lock().unwrap().is_empty());
    }
}
