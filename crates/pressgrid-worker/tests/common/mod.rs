//! Shared harness for worker integration tests.
//!
//! An in-memory store, a frozen clock and a playbook runner that answers
//! from a per-playbook script instead of spawning ansible.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tempfile::TempDir;
use tokio::sync::watch;

use pressgrid_core::{Clock, ManualClock, SequentialIds};
use pressgrid_queue::JobFilter;
use pressgrid_runner::{Playbook, PlaybookExecutor, PlaybookInvocation, PlaybookRunner, RunnerError};
use pressgrid_services::{
    artifacts, AuditEvent, AuditRecorder, CreateSiteInput, ServiceContext, Services, SharedAudit,
};
use pressgrid_state::*;
use pressgrid_worker::{HandlerContext, HandlerRegistry, Processed, Worker};

// ── Scripted runner ───────────────────────────────────────────────

pub enum Reply {
    Output(String),
    Exit { code: i32, output: String },
    /// Never returns; the executor's timeout or shutdown ends the run.
    Hang,
}

/// Answers each playbook from its queue of replies; an empty queue succeeds.
#[derive(Default)]
pub struct ScriptedRunner {
    replies: Mutex<HashMap<Playbook, VecDeque<Reply>>>,
    calls: Mutex<Vec<(Playbook, Value)>>,
}

impl ScriptedRunner {
    pub fn push(&self, playbook: Playbook, reply: Reply) {
        self.replies
            .lock()
            .unwrap()
            .entry(playbook)
            .or_default()
            .push_back(reply);
    }

    pub fn fail(&self, playbook: Playbook, code: i32, output: &str) {
        self.push(
            playbook,
            Reply::Exit {
                code,
                output: output.to_string(),
            },
        );
    }

    /// Extra vars of every run of `playbook`, oldest first.
    pub fn vars_of(&self, playbook: Playbook) -> Vec<Value> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(p, _)| *p == playbook)
            .map(|(_, vars)| vars.clone())
            .collect()
    }

    pub fn playbooks(&self) -> Vec<Playbook> {
        self.calls.lock().unwrap().iter().map(|(p, _)| *p).collect()
    }
}

#[async_trait]
impl PlaybookRunner for ScriptedRunner {
    async fn run(&self, invocation: &PlaybookInvocation) -> Result<String, RunnerError> {
        self.calls
            .lock()
            .unwrap()
            .push((invocation.playbook, invocation.extra_vars.clone()));
        let reply = self
            .replies
            .lock()
            .unwrap()
            .get_mut(&invocation.playbook)
            .and_then(VecDeque::pop_front);
        match reply {
            None => Ok(format!("{} ok", invocation.playbook)),
            Some(Reply::Output(output)) => Ok(output),
            Some(Reply::Exit { code, output }) => Err(RunnerError::Exit { code, output }),
            Some(Reply::Hang) => std::future::pending().await,
        }
    }
}

// ── Audit ─────────────────────────────────────────────────────────

/// Store-backed recorder that counts `accepted` writes and can be told to
/// reject them.
pub struct FlakyAudit {
    inner: SharedAudit,
    accepted_calls: AtomicUsize,
    reject_accepted: AtomicBool,
}

impl FlakyAudit {
    pub fn new(inner: SharedAudit) -> Self {
        Self {
            inner,
            accepted_calls: AtomicUsize::new(0),
            reject_accepted: AtomicBool::new(false),
        }
    }

    pub fn accepted_calls(&self) -> usize {
        self.accepted_calls.load(Ordering::SeqCst)
    }

    pub fn reject_accepted(&self, reject: bool) {
        self.reject_accepted.store(reject, Ordering::SeqCst);
    }
}

impl AuditRecorder for FlakyAudit {
    fn record(&self, event: &AuditEvent, result: &str) -> StateResult<()> {
        self.inner.record(event, result)
    }

    fn record_async_accepted(&self, event: &AuditEvent) -> StateResult<()> {
        self.accepted_calls.fetch_add(1, Ordering::SeqCst);
        if self.reject_accepted.load(Ordering::SeqCst) {
            let key = AuditEntry::correlation_key(&event.action, &event.resource_type, &event.resource_id);
            return Err(StateError::Encode {
                table: "audit".into(),
                key,
                source: serde_json::from_str::<u8>("audit").unwrap_err(),
            });
        }
        self.inner.record_async_accepted(event)
    }

    fn update_async_result(
        &self,
        action: &str,
        resource_type: &str,
        resource_id: &str,
        result: &str,
    ) -> StateResult<()> {
        self.inner.update_async_result(action, resource_type, resource_id, result)
    }
}

// ── Harness ───────────────────────────────────────────────────────

pub struct Harness {
    pub services: Services,
    pub clock: Arc<ManualClock>,
    pub runner: Arc<ScriptedRunner>,
    pub worker: Worker,
    pub artifacts: TempDir,
    pub shutdown_tx: watch::Sender<bool>,
    pub shutdown: watch::Receiver<bool>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_audit(|audit| audit)
    }

    /// Harness whose services and worker record audit through `wrap(store recorder)`.
    pub fn with_audit<F>(wrap: F) -> Self
    where
        F: FnOnce(SharedAudit) -> SharedAudit,
    {
        let store = StateStore::open_in_memory().unwrap();
        let clock = Arc::new(ManualClock::at_epoch());
        let ctx = ServiceContext::new(store, clock.clone(), Arc::new(SequentialIds::new()));
        let audit = wrap(ctx.audit.clone());
        let services = Services::new(ctx.with_audit(audit));

        let runner = Arc::new(ScriptedRunner::default());
        let executor = PlaybookExecutor::new(runner.clone(), "/playbooks", Duration::from_secs(5));
        let artifacts = tempfile::tempdir().unwrap();
        let handler_ctx = HandlerContext::new(services.clone(), executor, artifacts.path())
            .with_provision_timeout(Duration::from_millis(200));
        let handlers = Arc::new(HandlerRegistry::standard(handler_ctx));
        let worker = Worker::new("worker-test", &services, handlers);

        let (shutdown_tx, shutdown) = watch::channel(false);
        Self {
            services,
            clock,
            runner,
            worker,
            artifacts,
            shutdown_tx,
            shutdown,
        }
    }

    // ── Driving the worker ────────────────────────────────────────

    /// Process exactly one job; panics when nothing is runnable.
    pub async fn step(&self) -> Processed {
        self.worker
            .process_next(&self.shutdown)
            .await
            .unwrap()
            .expect("a runnable job")
    }

    pub async fn idle(&self) -> bool {
        self.worker.process_next(&self.shutdown).await.unwrap().is_none()
    }

    pub fn advance_minutes(&self, minutes: i64) {
        self.clock.advance(chrono::Duration::minutes(minutes));
    }

    // ── Fixtures ──────────────────────────────────────────────────

    /// Insert an active remote node directly.
    pub fn active_node(&self, ip: &str) -> Node {
        let now = self.clock.now();
        let id = self.services.ctx.ids.new_id();
        let node = Node {
            id: id.clone(),
            name: "web-1".into(),
            hostname: "web-1.example".into(),
            public_ip: Some(ip.to_string()),
            ssh_port: 22,
            ssh_user: "root".into(),
            ssh_private_key_path: None,
            status: NodeStatus::Active,
            is_local: false,
            state_version: 1,
            created_at: now,
            updated_at: now,
        };
        self.services.ctx.store.with_tx(|tx| tx.put(&node)).unwrap();
        node
    }

    /// A site whose `site_create` job has run; returns the production environment.
    pub async fn ready_site(&self, slug: &str) -> Environment {
        let created = self
            .services
            .sites
            .create(CreateSiteInput {
                name: slug.to_uppercase(),
                slug: slug.to_string(),
            })
            .unwrap();
        let processed = self.step().await;
        assert_eq!(processed.job_id, created.job_id);
        self.environment(&created.environment.id)
    }

    /// Local path the backup playbook would write `backup`'s artifact to.
    pub fn artifact_path(&self, backup: &Backup) -> PathBuf {
        artifacts::local_artifact_path(self.artifacts.path(), &backup.storage_path)
    }

    /// Queue and run a full backup whose playbook leaves `body` as the artifact.
    pub async fn completed_backup(&self, environment_id: &str, body: &[u8]) -> Backup {
        let accepted = self
            .services
            .backups
            .create(environment_id, BackupScope::Full)
            .unwrap();
        artifacts::write_artifact(&self.artifact_path(&accepted.backup), body).unwrap();
        let processed = self.step().await;
        assert_eq!(processed.job_id, accepted.job_id);
        self.backup(&accepted.backup.id)
    }

    // ── Reads ─────────────────────────────────────────────────────

    pub fn site(&self, id: &str) -> Site {
        self.services.ctx.store.get::<Site>(id).unwrap().unwrap()
    }

    pub fn environment(&self, id: &str) -> Environment {
        self.services.ctx.store.get::<Environment>(id).unwrap().unwrap()
    }

    pub fn backup(&self, id: &str) -> Backup {
        self.services.ctx.store.get::<Backup>(id).unwrap().unwrap()
    }

    pub fn release(&self, id: &str) -> Release {
        self.services.ctx.store.get::<Release>(id).unwrap().unwrap()
    }

    pub fn audit_row(&self, job: &Job) -> Option<AuditEntry> {
        let key = AuditEntry::correlation_key(job.job_type.as_str(), "job", &job.id);
        self.services.ctx.store.get::<AuditEntry>(&key).unwrap()
    }

    pub fn job(&self, id: &str) -> Job {
        self.services.ctx.queue.get(id).unwrap()
    }

    pub fn jobs_of(&self, job_type: JobType) -> Vec<Job> {
        self.services
            .ctx
            .queue
            .list(&JobFilter {
                job_type: Some(job_type),
                ..Default::default()
            })
            .unwrap()
    }
}
