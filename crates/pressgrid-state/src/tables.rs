//! redb table definitions for the pressgrid state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain
//! types). Entities are keyed by their id; audit rows by their correlation key.

use redb::TableDefinition;

/// Nodes keyed by `{node_id}`.
pub const NODES: TableDefinition<&str, &[u8]> = TableDefinition::new("nodes");

/// Sites keyed by `{site_id}`.
pub const SITES: TableDefinition<&str, &[u8]> = TableDefinition::new("sites");

/// Environments keyed by `{environment_id}`.
pub const ENVIRONMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("environments");

/// Releases keyed by `{release_id}`.
pub const RELEASES: TableDefinition<&str, &[u8]> = TableDefinition::new("releases");

/// Backups keyed by `{backup_id}`.
pub const BACKUPS: TableDefinition<&str, &[u8]> = TableDefinition::new("backups");

/// Domains keyed by `{domain_id}`.
pub const DOMAINS: TableDefinition<&str, &[u8]> = TableDefinition::new("domains");

/// Drift checks keyed by `{drift_check_id}`.
pub const DRIFT_CHECKS: TableDefinition<&str, &[u8]> = TableDefinition::new("drift_checks");

/// Jobs keyed by `{job_id}`, in every status.
pub const JOBS: TableDefinition<&str, &[u8]> = TableDefinition::new("jobs");

/// Index of queued-or-running job ids. Values are empty.
pub const ACTIVE_JOBS: TableDefinition<&str, &[u8]> = TableDefinition::new("active_jobs");

/// Restore sidecars keyed by `{job_id}`.
pub const RESTORE_REQUESTS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("restore_requests");

/// Audit entries keyed by `{action}:{resource_type}:{resource_id}` or `{entry_id}`.
pub const AUDIT: TableDefinition<&str, &[u8]> = TableDefinition::new("audit");
