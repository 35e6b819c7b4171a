//! Dependencies shared by every service.

use std::sync::Arc;

use chrono::Duration;
use tracing::warn;

use pressgrid_core::{SharedClock, SharedIds};
use pressgrid_queue::JobQueue;
use pressgrid_state::StateStore;

use crate::audit::{AuditEvent, SharedAudit, StoreAuditRecorder};

pub const DEFAULT_RETENTION_DAYS: i64 = 30;

#[derive(Clone)]
pub struct ServiceContext {
    pub store: StateStore,
    pub queue: JobQueue,
    pub clock: SharedClock,
    pub ids: SharedIds,
    pub audit: SharedAudit,
    /// Base domain for preview URLs of new environments.
    pub preview_domain: Option<String>,
    pub backup_retention: Duration,
}

impl ServiceContext {
    /// Context with a store-backed audit recorder and no preview domain.
    pub fn new(store: StateStore, clock: SharedClock, ids: SharedIds) -> Self {
        let queue = JobQueue::new(store.clone(), clock.clone(), ids.clone());
        let audit = Arc::new(StoreAuditRecorder::new(store.clone(), clock.clone(), ids.clone()));
        Self {
            store,
            queue,
            clock,
            ids,
            audit,
            preview_domain: None,
            backup_retention: Duration::days(DEFAULT_RETENTION_DAYS),
        }
    }

    pub fn with_preview_domain(mut self, domain: Option<String>) -> Self {
        self.preview_domain = domain
            .map(|d| d.trim().trim_matches('.').to_ascii_lowercase())
            .filter(|d| !d.is_empty());
        self
    }

    pub fn with_backup_retention_days(mut self, days: i64) -> Self {
        if days > 0 {
            self.backup_retention = Duration::days(days);
        }
        self
    }

    pub fn with_audit(mut self, audit: SharedAudit) -> Self {
        self.audit = audit;
        self
    }

    /// Record an `accepted` entry for a committed command. Failures are logged only.
    pub(crate) fn audit_accepted(&self, action: &str, resource_type: &str, resource_id: &str) {
        let event = AuditEvent::system(action, resource_type, resource_id);
        if let Err(e) = self.audit.record_async_accepted(&event) {
            warn!(%action, %resource_id, error = %e, "audit write failed");
        }
    }
}
