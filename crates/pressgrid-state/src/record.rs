//! Binding between domain types and their redb tables.

use redb::TableDefinition;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::tables::*;
use crate::types::*;

/// A JSON-encoded row stored under a string key in one table.
pub trait Record: Serialize + DeserializeOwned {
    const TABLE: TableDefinition<'static, &'static str, &'static [u8]>;

    fn table_key(&self) -> String;
}

macro_rules! keyed_by_id {
    ($ty:ty, $table:expr) => {
        impl Record for $ty {
            const TABLE: TableDefinition<'static, &'static str, &'static [u8]> = $table;

            fn table_key(&self) -> String {
                self.id.clone()
            }
        }
    };
}

keyed_by_id!(Node, NODES);
keyed_by_id!(Site, SITES);
keyed_by_id!(Environment, ENVIRONMENTS);
keyed_by_id!(Release, RELEASES);
keyed_by_id!(Backup, BACKUPS);
keyed_by_id!(Domain, DOMAINS);
keyed_by_id!(DriftCheck, DRIFT_CHECKS);
keyed_by_id!(Job, JOBS);

impl Record for RestoreRequest {
    const TABLE: TableDefinition<'static, &'static str, &'static [u8]> = RESTORE_REQUESTS;

    fn table_key(&self) -> String {
        self.job_id.clone()
    }
}

impl Record for AuditEntry {
    const TABLE: TableDefinition<'static, &'static str, &'static [u8]> = AUDIT;

    fn table_key(&self) -> String {
        AuditEntry::correlation_key(&self.action, &self.resource_type, &self.resource_id)
    }
}
