//! Ansible inventory rendering.

use std::fmt::Write as _;

use pressgrid_state::Node;

/// The single host a playbook run targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventoryTarget {
    pub host: String,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub private_key_path: Option<String>,
    /// Run against the control-plane host itself.
    pub local: bool,
}

impl InventoryTarget {
    pub fn local(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: None,
            user: None,
            private_key_path: None,
            local: true,
        }
    }

    pub fn ssh(host: impl Into<String>, port: u16, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: Some(port),
            user: Some(user.into()),
            private_key_path: None,
            local: false,
        }
    }

    /// Target for a registered node.
    pub fn for_node(node: &Node) -> Self {
        let host = if node.hostname.trim().is_empty() {
            node.public_ip().unwrap_or_default().to_string()
        } else {
            node.hostname.trim().to_string()
        };
        if node.is_local {
            return Self::local(host);
        }
        let mut target = Self::ssh(host, node.ssh_port, node.ssh_user.trim());
        target.private_key_path = node
            .ssh_private_key_path
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_string);
        target
    }

    /// Render the `[target]` inventory group.
    pub fn render(&self) -> String {
        let mut line = self.host.clone();
        if self.local {
            line.push_str(" ansible_connection=local");
        } else {
            if let Some(port) = self.port {
                let _ = write!(line, " ansible_port={port}");
            }
            if let Some(user) = self.user.as_deref().filter(|u| !u.is_empty()) {
                let _ = write!(line, " ansible_user={user}");
            }
            if let Some(key) = &self.private_key_path {
                let _ = write!(line, " ansible_ssh_private_key_file={key}");
            }
        }
        format!("[target]\n{line}\n")
    }
}
