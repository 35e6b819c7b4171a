//! StateStore — redb-backed state persistence for pressgrid.
//!
//! Writes go through [`StateStore::with_tx`], which hands the closure a
//! [`StoreTx`] and commits only when the closure returns `Ok`. Reads go
//! through [`StateStore::read`] (a consistent snapshot) or the `get`/`list`
//! shortcuts. The store supports both on-disk and in-memory backends (the
//! latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{
    Database, ReadTransaction, ReadableDatabase, ReadableTable, TableDefinition, TableError,
    TableHandle, WriteTransaction,
};
use tracing::{debug, warn};

use crate::error::{StateError, StateResult};
use crate::record::Record;
use crate::tables::*;
use crate::types::Job;

type RawTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Attach the table name to a failed `open_table`.
fn table_err(table: RawTable) -> impl FnOnce(TableError) -> StateError {
    move |source| StateError::Table {
        table: table.name().to_string(),
        source,
    }
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path)?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder().create_with_backend(backend)?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write()?;
        for table in [
            NODES,
            SITES,
            ENVIRONMENTS,
            RELEASES,
            BACKUPS,
            DOMAINS,
            DRIFT_CHECKS,
            JOBS,
            ACTIVE_JOBS,
            RESTORE_REQUESTS,
            AUDIT,
        ] {
            // Opening a table in a write transaction creates it if absent.
            txn.open_table(table).map_err(table_err(table))?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Run `f` inside one write transaction.
    ///
    /// The transaction commits when `f` returns `Ok` and is aborted when it
    /// returns `Err`, so no partial write of a failed command is ever visible.
    /// redb serializes write transactions; keep `f` free of I/O other than
    /// the store itself.
    pub fn with_tx<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&StoreTx) -> Result<T, E>,
        E: From<StateError>,
    {
        let txn = self.db.begin_write().map_err(|e| E::from(StateError::from(e)))?;
        let tx = StoreTx { txn };
        match f(&tx) {
            Ok(value) => {
                tx.txn.commit().map_err(|e| E::from(StateError::from(e)))?;
                Ok(value)
            }
            Err(err) => {
                if let Err(abort_err) = tx.txn.abort() {
                    warn!(error = %abort_err, "transaction abort failed");
                }
                Err(err)
            }
        }
    }

    /// Run `f` against a read snapshot.
    pub fn read<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&StoreView) -> Result<T, E>,
        E: From<StateError>,
    {
        let txn = self.db.begin_read().map_err(|e| E::from(StateError::from(e)))?;
        f(&StoreView { txn })
    }

    /// Get a single record by key.
    pub fn get<R: Record>(&self, key: &str) -> StateResult<Option<R>> {
        self.read(|view| view.get::<R>(key))
    }

    /// List every record of a type.
    pub fn list<R: Record>(&self) -> StateResult<Vec<R>> {
        self.read(|view| view.list::<R>())
    }
}

// ── Transaction handles ────────────────────────────────────────────

/// Read-write handle passed to [`StateStore::with_tx`] closures.
pub struct StoreTx {
    txn: WriteTransaction,
}

impl StoreTx {
    pub fn get<R: Record>(&self, key: &str) -> StateResult<Option<R>> {
        let table = self.txn.open_table(R::TABLE).map_err(table_err(R::TABLE))?;
        read_one(&table, R::TABLE, key)
    }

    pub fn list<R: Record>(&self) -> StateResult<Vec<R>> {
        let table = self.txn.open_table(R::TABLE).map_err(table_err(R::TABLE))?;
        read_all(&table, R::TABLE)
    }

    /// Insert or replace a record under its own key.
    ///
    /// Jobs must be written with [`StoreTx::save_job`] so the active index
    /// stays in sync.
    pub fn put<R: Record>(&self, record: &R) -> StateResult<()> {
        self.put_at(&record.table_key(), record)
    }

    /// Insert or replace a record under an explicit key.
    pub fn put_at<R: Record>(&self, key: &str, record: &R) -> StateResult<()> {
        let value = serde_json::to_vec(record).map_err(|source| StateError::Encode {
            table: R::TABLE.name().to_string(),
            key: key.to_string(),
            source,
        })?;
        write_raw(&self.txn, R::TABLE, key, &value)
    }

    /// Delete a record by key. Returns true if it existed.
    pub fn delete<R: Record>(&self, key: &str) -> StateResult<bool> {
        let mut table = self.txn.open_table(R::TABLE).map_err(table_err(R::TABLE))?;
        let existed = table.remove(key)?.is_some();
        Ok(existed)
    }

    /// Persist a job and keep the queued-or-running index in step with its status.
    pub fn save_job(&self, job: &Job) -> StateResult<()> {
        self.put_at(&job.id, job)?;
        let mut index = self.txn.open_table(ACTIVE_JOBS).map_err(table_err(ACTIVE_JOBS))?;
        if job.status.is_active() {
            index.insert(job.id.as_str(), b"".as_slice())?;
        } else {
            index.remove(job.id.as_str())?;
        }
        Ok(())
    }

    /// All queued-or-running jobs.
    pub fn active_jobs(&self) -> StateResult<Vec<Job>> {
        let ids: Vec<String> = {
            let index = self.txn.open_table(ACTIVE_JOBS).map_err(table_err(ACTIVE_JOBS))?;
            collect_keys(&index)?
        };
        let jobs = self.txn.open_table(JOBS).map_err(table_err(JOBS))?;
        let mut results = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(job) = read_one::<Job>(&jobs, JOBS, &id)? {
                results.push(job);
            }
        }
        Ok(results)
    }
}

/// Read-only snapshot handle passed to [`StateStore::read`] closures.
pub struct StoreView {
    txn: ReadTransaction,
}

impl StoreView {
    pub fn get<R: Record>(&self, key: &str) -> StateResult<Option<R>> {
        let table = self.txn.open_table(R::TABLE).map_err(table_err(R::TABLE))?;
        read_one(&table, R::TABLE, key)
    }

    pub fn list<R: Record>(&self) -> StateResult<Vec<R>> {
        let table = self.txn.open_table(R::TABLE).map_err(table_err(R::TABLE))?;
        read_all(&table, R::TABLE)
    }

    /// All queued-or-running jobs.
    pub fn active_jobs(&self) -> StateResult<Vec<Job>> {
        let index = self.txn.open_table(ACTIVE_JOBS).map_err(table_err(ACTIVE_JOBS))?;
        let jobs = self.txn.open_table(JOBS).map_err(table_err(JOBS))?;
        let mut results = Vec::new();
        for id in collect_keys(&index)? {
            if let Some(job) = read_one::<Job>(&jobs, JOBS, &id)? {
                results.push(job);
            }
        }
        Ok(results)
    }
}

// ── Raw table helpers ──────────────────────────────────────────────

fn decode<R: Record>(def: RawTable, key: &str, bytes: &[u8]) -> StateResult<R> {
    serde_json::from_slice(bytes).map_err(|source| StateError::Decode {
        table: def.name().to_string(),
        key: key.to_string(),
        source,
    })
}

fn read_one<R: Record>(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    def: RawTable,
    key: &str,
) -> StateResult<Option<R>> {
    match table.get(key)? {
        Some(guard) => Ok(Some(decode(def, key, guard.value())?)),
        None => Ok(None),
    }
}

fn read_all<R: Record>(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    def: RawTable,
) -> StateResult<Vec<R>> {
    let mut results = Vec::new();
    for entry in table.iter()? {
        let (key, value) = entry?;
        results.push(decode(def, key.value(), value.value())?);
    }
    Ok(results)
}

fn collect_keys(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
) -> StateResult<Vec<String>> {
    let mut keys = Vec::new();
    for entry in table.iter()? {
        let (key, _) = entry?;
        keys.push(key.value().to_string());
    }
    Ok(keys)
}

fn write_raw(txn: &WriteTransaction, def: RawTable, key: &str, value: &[u8]) -> StateResult<()> {
    let mut table = txn.open_table(def).map_err(table_err(def))?;
    table.insert(key, value)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::*;
    use chrono::{DateTime, Utc};

    fn ts() -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_704_067_200, 0).unwrap()
    }

    fn test_site(id: &str, slug: &str) -> Site {
        Site {
            id: id.to_string(),
            name: slug.to_uppercase(),
            slug: slug.to_string(),
            status: LifecycleStatus::Active,
            primary_environment_id: None,
            state_version: 1,
            created_at: ts(),
            updated_at: ts(),
        }
    }

    fn test_job(id: &str, status: JobStatus) -> Job {
        Job {
            id: id.to_string(),
            job_type: JobType::SiteCreate,
            status,
            site_id: Some("site-1".to_string()),
            environment_id: None,
            node_id: Some("node-1".to_string()),
            payload: serde_json::json!({"site_id": "site-1"}),
            attempt_count: 0,
            max_attempts: 3,
            run_after: None,
            locked_by: None,
            locked_at: None,
            started_at: None,
            finished_at: None,
            error_code: None,
            error_message: None,
            created_at: ts(),
            updated_at: ts(),
        }
    }

    #[derive(Debug)]
    struct Boom;

    impl From<StateError> for Boom {
        fn from(_: StateError) -> Self {
            Boom
        }
    }

    // ── Transactions ───────────────────────────────────────────────

    #[test]
    fn with_tx_commits_on_ok() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .with_tx(|tx| tx.put(&test_site("s1", "acme")))
            .unwrap();

        let site: Option<Site> = store.get("s1").unwrap();
        assert_eq!(site.unwrap().slug, "acme");
    }

    #[test]
    fn with_tx_rolls_back_on_err() {
        let store = StateStore::open_in_memory().unwrap();
        let result: Result<(), Boom> = store.with_tx(|tx| {
            tx.put(&test_site("s1", "acme"))?;
            Err(Boom)
        });

        assert!(result.is_err());
        assert!(store.get::<Site>("s1").unwrap().is_none());
    }

    #[test]
    fn reads_inside_tx_see_own_writes() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .with_tx(|tx| {
                tx.put(&test_site("s1", "acme"))?;
                let seen: Option<Site> = tx.get("s1")?;
                assert!(seen.is_some());
                assert_eq!(tx.list::<Site>()?.len(), 1);
                Ok::<_, StateError>(())
            })
            .unwrap();
    }

    #[test]
    fn delete_reports_existence() {
        let store = StateStore::open_in_memory().unwrap();
        store.with_tx(|tx| tx.put(&test_site("s1", "acme"))).unwrap();

        let first = store.with_tx(|tx| tx.delete::<Site>("s1")).unwrap();
        let second = store.with_tx(|tx| tx.delete::<Site>("s1")).unwrap();
        assert!(first);
        assert!(!second);
    }

    // ── Active job index ───────────────────────────────────────────

    #[test]
    fn save_job_maintains_active_index() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .with_tx(|tx| {
                tx.save_job(&test_job("j1", JobStatus::Queued))?;
                tx.save_job(&test_job("j2", JobStatus::Running))?;
                tx.save_job(&test_job("j3", JobStatus::Succeeded))
            })
            .unwrap();

        let mut active: Vec<String> = store
            .read(|view| view.active_jobs())
            .unwrap()
            .into_iter()
            .map(|j| j.id)
            .collect();
        active.sort();
        assert_eq!(active, vec!["j1", "j2"]);

        store
            .with_tx(|tx| tx.save_job(&test_job("j1", JobStatus::Cancelled)))
            .unwrap();
        let active = store.read(|view| view.active_jobs()).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "j2");
        assert_eq!(store.list::<Job>().unwrap().len(), 3);
    }

    // ── Persistence ────────────────────────────────────────────────

    #[test]
    fn persistent_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pressgrid.redb");

        {
            let store = StateStore::open(&path).unwrap();
            store.with_tx(|tx| tx.put(&test_site("s1", "acme"))).unwrap();
            store
                .with_tx(|tx| tx.save_job(&test_job("j1", JobStatus::Queued)))
                .unwrap();
        }

        let store = StateStore::open(&path).unwrap();
        assert!(store.get::<Site>("s1").unwrap().is_some());
        assert_eq!(store.read(|view| view.active_jobs()).unwrap().len(), 1);
    }

    #[test]
    fn corrupt_record_names_table_and_key() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .with_tx(|tx| write_raw(&tx.txn, SITES, "s1", b"not json"))
            .unwrap();

        let err = store.get::<Site>("s1").unwrap_err();
        match &err {
            StateError::Decode { table, key, .. } => {
                assert_eq!(table, "sites");
                assert_eq!(key, "s1");
            }
            other => panic!("expected decode error, got {other:?}"),
        }
        assert!(err.to_string().starts_with("decode sites/s1:"));
        assert!(matches!(store.list::<Site>(), Err(StateError::Decode { .. })));
    }

    #[test]
    fn audit_entries_key_by_correlation() {
        let store = StateStore::open_in_memory().unwrap();
        let entry = AuditEntry {
            id: "a1".into(),
            user_id: "admin".into(),
            action: "site_create".into(),
            resource_type: "job".into(),
            resource_id: "j1".into(),
            result: "accepted".into(),
            created_at: ts(),
            updated_at: ts(),
        };
        store.with_tx(|tx| tx.put(&entry)).unwrap();

        let key = AuditEntry::correlation_key("site_create", "job", "j1");
        let stored: AuditEntry = store.get(&key).unwrap().unwrap();
        assert_eq!(stored.result, "accepted");
    }
}
