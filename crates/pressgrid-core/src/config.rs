//! pressgrid.toml configuration parser.
//!
//! Every section is optional; missing keys fall back to the defaults below,
//! so an empty file is a valid config.
//!
//! ```toml
//! [daemon]
//! data_dir = "/var/lib/pressgrid"
//! worker_count = 2
//!
//! [ansible]
//! binary = "/opt/pressgrid/.venv/bin/ansible-playbook"
//! playbook_dir = "/opt/pressgrid/ansible/playbooks"
//!
//! [preview]
//! domain = "preview.example.net"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Overrides `[ansible].binary`.
pub const ENV_ANSIBLE_BIN: &str = "PRESSGRID_ANSIBLE_BIN";
/// Overrides `[daemon].data_dir`.
pub const ENV_DATA_DIR: &str = "PRESSGRID_DATA_DIR";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PressConfig {
    pub daemon: DaemonConfig,
    pub ansible: AnsibleConfig,
    pub ssh: SshConfig,
    pub backups: BackupsConfig,
    pub preview: PreviewConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub data_dir: PathBuf,
    pub worker_count: usize,
    pub poll_interval_ms: u64,
    pub shutdown_grace_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/pressgrid"),
            worker_count: 1,
            poll_interval_ms: 1000,
            shutdown_grace_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnsibleConfig {
    pub binary: PathBuf,
    pub playbook_dir: PathBuf,
    /// Per-playbook deadline.
    pub timeout_secs: u64,
    /// Run `--syntax-check` before every apply.
    pub syntax_check: bool,
}

impl Default for AnsibleConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("ansible-playbook"),
            playbook_dir: PathBuf::from("ansible/playbooks"),
            timeout_secs: 30 * 60,
            syntax_check: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    pub binary: PathBuf,
    pub connect_timeout_secs: u64,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("ssh"),
            connect_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupsConfig {
    /// Root for local backup artifacts (`<dir>/pressgrid-artifacts/...`).
    pub artifact_dir: PathBuf,
    pub retention_days: i64,
    pub cleanup_interval_secs: u64,
}

impl Default for BackupsConfig {
    fn default() -> Self {
        Self {
            artifact_dir: std::env::temp_dir(),
            retention_days: 30,
            cleanup_interval_secs: 6 * 60 * 60,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreviewConfig {
    /// Wildcard preview domain. When unset, previews use sslip.io.
    pub domain: Option<String>,
}

impl PressConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: PressConfig = toml::from_str(&content)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from `path` when given, otherwise start from defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => {
                let mut config = Self::default();
                config.apply_env_overrides();
                Ok(config)
            }
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(bin) = std::env::var(ENV_ANSIBLE_BIN) {
            if !bin.trim().is_empty() {
                self.ansible.binary = PathBuf::from(bin.trim());
            }
        }
        if let Ok(dir) = std::env::var(ENV_DATA_DIR) {
            if !dir.trim().is_empty() {
                self.daemon.data_dir = PathBuf::from(dir.trim());
            }
        }
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn db_path(&self) -> PathBuf {
        self.daemon.data_dir.join("pressgrid.redb")
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.daemon.poll_interval_ms.max(10))
    }

    pub fn playbook_timeout(&self) -> Duration {
        Duration::from_secs(self.ansible.timeout_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.backups.cleanup_interval_secs.max(1))
    }

    pub fn preview_domain(&self) -> Option<&str> {
        self.preview
            .domain
            .as_deref()
            .map(str::trim)
            .filter(|d| !d.is_empty())
    }
}
