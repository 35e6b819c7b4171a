//! Audit recording.
//!
//! Entries are keyed by `(action, resource_type, resource_id)`, so an async
//! command records one `accepted` row and later result updates overwrite it.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use pressgrid_core::{SharedClock, SharedIds};
use pressgrid_state::{AuditEntry, StateResult, StateStore, StoreTx};

/// User id recorded for control-plane initiated actions.
pub const SYSTEM_USER: &str = "admin";

pub const RESULT_ACCEPTED: &str = "accepted";
pub const RESULT_SUCCEEDED: &str = "succeeded";
pub const RESULT_RETRYING: &str = "retrying";
pub const RESULT_FAILED: &str = "failed";

/// What an audit row is about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEvent {
    pub user_id: String,
    pub action: String,
    pub resource_type: String,
    pub resource_id: String,
}

impl AuditEvent {
    pub fn system(
        action: impl Into<String>,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
    ) -> Self {
        Self {
            user_id: SYSTEM_USER.to_string(),
            action: action.into(),
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
        }
    }
}

pub trait AuditRecorder: Send + Sync {
    /// Write `event` with `result`, replacing any row with the same key.
    fn record(&self, event: &AuditEvent, result: &str) -> StateResult<()>;

    /// Write an `accepted` row unless one already exists for the key.
    fn record_async_accepted(&self, event: &AuditEvent) -> StateResult<()>;

    /// Overwrite the result of a correlated row, creating it if missing.
    fn update_async_result(
        &self,
        action: &str,
        resource_type: &str,
        resource_id: &str,
        result: &str,
    ) -> StateResult<()>;
}

pub type SharedAudit = Arc<dyn AuditRecorder>;

/// Audit recorder persisting into the state store's audit table.
#[derive(Clone)]
pub struct StoreAuditRecorder {
    store: StateStore,
    clock: SharedClock,
    ids: SharedIds,
}

impl StoreAuditRecorder {
    pub fn new(store: StateStore, clock: SharedClock, ids: SharedIds) -> Self {
        Self { store, clock, ids }
    }

    fn upsert(&self, tx: &StoreTx, event: &AuditEvent, result: &str, now: DateTime<Utc>) -> StateResult<()> {
        let key = AuditEntry::correlation_key(&event.action, &event.resource_type, &event.resource_id);
        let entry = match tx.get::<AuditEntry>(&key)? {
            Some(mut existing) => {
                existing.result = result.to_string();
                existing.updated_at = now;
                existing
            }
            None => AuditEntry {
                id: self.ids.new_id(),
                user_id: event.user_id.clone(),
                action: event.action.clone(),
                resource_type: event.resource_type.clone(),
                resource_id: event.resource_id.clone(),
                result: result.to_string(),
                created_at: now,
                updated_at: now,
            },
        };
        tx.put(&entry)
    }
}

impl AuditRecorder for StoreAuditRecorder {
    fn record(&self, event: &AuditEvent, result: &str) -> StateResult<()> {
        let now = self.clock.now();
        self.store.with_tx(|tx| self.upsert(tx, event, result, now))
    }

    fn record_async_accepted(&self, event: &AuditEvent) -> StateResult<()> {
        let now = self.clock.now();
        self.store.with_tx(|tx| {
            let key = AuditEntry::correlation_key(&event.action, &event.resource_type, &event.resource_id);
            if tx.get::<AuditEntry>(&key)?.is_some() {
                return Ok(());
            }
            self.upsert(tx, event, RESULT_ACCEPTED, now)
        })
    }

    fn update_async_result(
        &self,
        action: &str,
        resource_type: &str,
        resource_id: &str,
        result: &str,
    ) -> StateResult<()> {
        let event = AuditEvent::system(action, resource_type, resource_id);
        self.record(&event, result)
    }
}
