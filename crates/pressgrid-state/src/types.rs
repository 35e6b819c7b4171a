//! Domain types for the pressgrid state store.
//!
//! These types are the persisted state of nodes, sites, environments,
//! releases, backups, domains, drift checks, jobs and audit entries. All
//! are JSON-serialized into redb tables; timestamps serialize as RFC3339 UTC.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Node ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Provisioning,
    Active,
    Unreachable,
    Decommissioned,
}

/// An SSH-reachable host running the site runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub name: String,
    pub hostname: String,
    pub public_ip: Option<String>,
    pub ssh_port: u16,
    pub ssh_user: String,
    pub ssh_private_key_path: Option<String>,
    pub status: NodeStatus,
    /// The node is the control-plane host itself (ansible_connection=local).
    pub is_local: bool,
    pub state_version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Node {
    /// Public IP with surrounding whitespace removed, if any is set.
    pub fn public_ip(&self) -> Option<&str> {
        self.public_ip
            .as_deref()
            .map(str::trim)
            .filter(|ip| !ip.is_empty())
    }
}

// ── Site / Environment ─────────────────────────────────────────────

/// Lifecycle status shared by sites and environments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleStatus {
    Active,
    Cloning,
    Deploying,
    Restoring,
    Failed,
}

impl LifecycleStatus {
    /// A mutation is in flight for the entity.
    pub fn is_mutating(self) -> bool {
        matches!(self, Self::Cloning | Self::Deploying | Self::Restoring)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Site {
    pub id: String,
    pub name: String,
    /// Unique, lowercased.
    pub slug: String,
    pub status: LifecycleStatus,
    pub primary_environment_id: Option<String>,
    pub state_version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentType {
    Production,
    Staging,
    Clone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PromotionPreset {
    ContentProtect,
    CommerceProtect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftStatus {
    Unknown,
    Clean,
    Drifted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Environment {
    pub id: String,
    pub site_id: String,
    pub name: String,
    /// Unique within the site.
    pub slug: String,
    pub environment_type: EnvironmentType,
    pub status: LifecycleStatus,
    pub node_id: String,
    pub source_environment_id: Option<String>,
    pub promotion_preset: PromotionPreset,
    pub preview_url: String,
    pub primary_domain_id: Option<String>,
    pub current_release_id: Option<String>,
    pub drift_status: DriftStatus,
    pub drift_checked_at: Option<DateTime<Utc>>,
    pub last_drift_check_id: Option<String>,
    pub fastcgi_cache_enabled: bool,
    pub redis_cache_enabled: bool,
    pub state_version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ── Release ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Unknown,
    Healthy,
    Unhealthy,
}

/// An installed application version on an environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Release {
    pub id: String,
    pub environment_id: String,
    pub source_type: String,
    pub source_ref: String,
    pub path: String,
    pub health_status: HealthStatus,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ── Backup ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupScope {
    Db,
    Files,
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Expired,
}

impl BackupStatus {
    /// Allowed edges: pending → running → (completed | failed), (completed | failed) → expired.
    pub fn can_transition_to(self, next: BackupStatus) -> bool {
        use BackupStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Completed, Expired)
                | (Failed, Expired)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Backup {
    pub id: String,
    pub environment_id: String,
    pub backup_scope: BackupScope,
    pub status: BackupStatus,
    pub storage_type: String,
    pub storage_path: String,
    pub retention_until: DateTime<Utc>,
    pub checksum: Option<String>,
    pub size_bytes: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

// ── Domain ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TlsStatus {
    Pending,
    Active,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Domain {
    pub id: String,
    pub environment_id: String,
    /// Unique, lowercased.
    pub hostname: String,
    pub tls_status: TlsStatus,
    pub tls_issuer: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ── Drift check ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftCheckStatus {
    Clean,
    Drifted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftCheck {
    pub id: String,
    pub environment_id: String,
    pub promotion_preset: PromotionPreset,
    pub status: DriftCheckStatus,
    pub db_checksums: serde_json::Value,
    pub file_checksums: serde_json::Value,
    pub checked_at: DateTime<Utc>,
}

// ── Job ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    NodeProvision,
    SiteCreate,
    EnvCreate,
    EnvDeploy,
    EnvRestore,
    EnvUpdate,
    EnvPromote,
    EnvCacheToggle,
    CachePurge,
    BackupCreate,
    BackupCleanup,
    DomainAdd,
    DomainRemove,
    DriftCheck,
    HealthCheck,
    ReleaseRollback,
    SiteImport,
}

impl JobType {
    pub const ALL: [JobType; 17] = [
        JobType::NodeProvision,
        JobType::SiteCreate,
        JobType::EnvCreate,
        JobType::EnvDeploy,
        JobType::EnvRestore,
        JobType::EnvUpdate,
        JobType::EnvPromote,
        JobType::EnvCacheToggle,
        JobType::CachePurge,
        JobType::BackupCreate,
        JobType::BackupCleanup,
        JobType::DomainAdd,
        JobType::DomainRemove,
        JobType::DriftCheck,
        JobType::HealthCheck,
        JobType::ReleaseRollback,
        JobType::SiteImport,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobType::NodeProvision => "node_provision",
            JobType::SiteCreate => "site_create",
            JobType::EnvCreate => "env_create",
            JobType::EnvDeploy => "env_deploy",
            JobType::EnvRestore => "env_restore",
            JobType::EnvUpdate => "env_update",
            JobType::EnvPromote => "env_promote",
            JobType::EnvCacheToggle => "env_cache_toggle",
            JobType::CachePurge => "cache_purge",
            JobType::BackupCreate => "backup_create",
            JobType::BackupCleanup => "backup_cleanup",
            JobType::DomainAdd => "domain_add",
            JobType::DomainRemove => "domain_remove",
            JobType::DriftCheck => "drift_check",
            JobType::HealthCheck => "health_check",
            JobType::ReleaseRollback => "release_rollback",
            JobType::SiteImport => "site_import",
        }
    }

    pub fn parse(value: &str) -> Option<JobType> {
        Self::ALL.into_iter().find(|t| t.as_str() == value.trim())
    }

    /// Successful completion of these jobs schedules a `health_check`.
    pub fn triggers_health_check(self) -> bool {
        matches!(
            self,
            JobType::EnvDeploy | JobType::EnvRestore | JobType::EnvPromote
        )
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_active(self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Running)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

/// A durable unit of asynchronous work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub job_type: JobType,
    pub status: JobStatus,
    pub site_id: Option<String>,
    pub environment_id: Option<String>,
    pub node_id: Option<String>,
    /// Type-specific JSON object.
    pub payload: serde_json::Value,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub run_after: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Runnable at `now`: queued and past any backoff.
    pub fn is_runnable_at(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Queued && self.run_after.is_none_or(|at| at <= now)
    }

    /// Ordering key for FIFO claims.
    pub fn queue_order(&self) -> (DateTime<Utc>, &str) {
        (self.created_at, self.id.as_str())
    }
}

// ── Restore request ────────────────────────────────────────────────

/// Sidecar row describing which backup an `env_restore` job restores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreRequest {
    pub job_id: String,
    pub environment_id: String,
    pub backup_id: String,
    pub created_at: DateTime<Utc>,
}

// ── Audit ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: String,
    pub user_id: String,
    pub action: String,
    pub resource_type: String,
    pub resource_id: String,
    pub result: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AuditEntry {
    /// Correlation key for async results: `{action}:{resource_type}:{resource_id}`.
    pub fn correlation_key(action: &str, resource_type: &str, resource_id: &str) -> String {
        format!("{action}:{resource_type}:{resource_id}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_type_wire_names_round_trip() {
        for job_type in JobType::ALL {
            let json = serde_json::to_string(&job_type).unwrap();
            assert_eq!(json, format!("\"{}\"", job_type.as_str()));
            assert_eq!(JobType::parse(job_type.as_str()), Some(job_type));
        }
        assert_eq!(JobType::parse("nope"), None);
    }

    #[test]
    fn promotion_preset_is_kebab_case() {
        let json = serde_json::to_string(&PromotionPreset::CommerceProtect).unwrap();
        assert_eq!(json, "\"commerce-protect\"");
    }

    #[test]
    fn backup_dag_rejects_backwards_edges() {
        use BackupStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(Failed.can_transition_to(Expired));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Completed));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Expired.can_transition_to(Completed));
    }

    #[test]
    fn only_in_flight_statuses_are_mutating() {
        assert!(LifecycleStatus::Cloning.is_mutating());
        assert!(LifecycleStatus::Restoring.is_mutating());
        assert!(!LifecycleStatus::Active.is_mutating());
        assert!(!LifecycleStatus::Failed.is_mutating());
    }
}
