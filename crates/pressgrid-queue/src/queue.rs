//! JobQueue — the durable FIFO behind every lifecycle mutation.
//!
//! Every operation runs in a single redb write transaction. Service
//! commands that must enqueue atomically with their own state changes use
//! the `*_in` variants with the transaction handle they already hold.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use pressgrid_core::{truncate_tail, SharedClock, SharedIds, JOB_ERROR_MESSAGE_MAX};
use pressgrid_state::*;

use crate::error::{QueueError, QueueResult};
use crate::gate;

/// Attempts granted to a job unless the producer says otherwise.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Input to [`JobQueue::enqueue`].
#[derive(Debug, Clone)]
pub struct EnqueueInput {
    /// Explicit id, for jobs whose id doubles as an entity id.
    pub job_id: Option<String>,
    pub job_type: JobType,
    pub site_id: Option<String>,
    pub environment_id: Option<String>,
    pub node_id: Option<String>,
    pub payload: serde_json::Value,
    pub max_attempts: u32,
}

impl EnqueueInput {
    pub fn new(job_type: JobType, payload: serde_json::Value) -> Self {
        Self {
            job_id: None,
            job_type,
            site_id: None,
            environment_id: None,
            node_id: None,
            payload,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn job_id(mut self, id: impl Into<String>) -> Self {
        self.job_id = Some(id.into());
        self
    }

    pub fn site(mut self, id: impl Into<String>) -> Self {
        self.site_id = Some(id.into());
        self
    }

    pub fn environment(mut self, id: impl Into<String>) -> Self {
        self.environment_id = Some(id.into());
        self
    }

    pub fn node(mut self, id: impl Into<String>) -> Self {
        self.node_id = Some(id.into());
        self
    }

    pub fn max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = max;
        self
    }
}

/// Filter for [`JobQueue::list`]. Empty fields match everything.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub job_type: Option<JobType>,
    pub site_id: Option<String>,
    pub environment_id: Option<String>,
    pub limit: Option<usize>,
}

impl JobFilter {
    fn matches(&self, job: &Job) -> bool {
        self.status.is_none_or(|s| s == job.status)
            && self.job_type.is_none_or(|t| t == job.job_type)
            && self
                .site_id
                .as_deref()
                .is_none_or(|id| job.site_id.as_deref() == Some(id))
            && self
                .environment_id
                .as_deref()
                .is_none_or(|id| job.environment_id.as_deref() == Some(id))
    }
}

/// Job counts per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub queued: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
}

/// The store-backed job queue.
#[derive(Clone)]
pub struct JobQueue {
    store: StateStore,
    clock: SharedClock,
    ids: SharedIds,
}

impl JobQueue {
    pub fn new(store: StateStore, clock: SharedClock, ids: SharedIds) -> Self {
        Self { store, clock, ids }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    // ── Enqueue ────────────────────────────────────────────────────

    /// Admit a job in its own transaction.
    pub fn enqueue(&self, input: EnqueueInput) -> QueueResult<Job> {
        self.store.with_tx(|tx| self.enqueue_in(tx, input))
    }

    /// Admit a job inside the caller's transaction.
    ///
    /// A `ConcurrencyConflict` leaves the transaction untouched; callers
    /// propagate it so their own writes abort with it.
    pub fn enqueue_in(&self, tx: &StoreTx, input: EnqueueInput) -> QueueResult<Job> {
        validate(&input)?;
        let active = tx.active_jobs()?;
        gate::check_admission(&active, input.site_id.as_deref(), input.node_id.as_deref())?;

        let id = match input.job_id {
            Some(id) => {
                if tx.get::<Job>(&id)?.is_some() {
                    return Err(QueueError::InvalidInput(format!("job id {id} already exists")));
                }
                id
            }
            None => self.ids.new_id(),
        };

        let now = self.clock.now();
        let job = Job {
            id,
            job_type: input.job_type,
            status: JobStatus::Queued,
            site_id: input.site_id,
            environment_id: input.environment_id,
            node_id: input.node_id,
            payload: input.payload,
            attempt_count: 0,
            max_attempts: input.max_attempts,
            run_after: None,
            locked_by: None,
            locked_at: None,
            started_at: None,
            finished_at: None,
            error_code: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        };
        tx.save_job(&job)?;
        debug!(job_id = %job.id, job_type = %job.job_type, "job enqueued");
        Ok(job)
    }

    // ── Claim ──────────────────────────────────────────────────────

    /// Claim the next runnable job for `worker_id`.
    pub fn claim_next_runnable(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> QueueResult<Option<Job>> {
        self.store.with_tx(|tx| {
            let active = tx.active_jobs()?;
            let Some(candidate) = gate::next_claimable(&active, now) else {
                return Ok(None);
            };

            let mut job = candidate.clone();
            job.status = JobStatus::Running;
            job.locked_by = Some(worker_id.to_string());
            job.locked_at = Some(now);
            job.started_at.get_or_insert(now);
            job.attempt_count += 1;
            job.updated_at = now;
            tx.save_job(&job)?;

            info!(
                job_id = %job.id,
                job_type = %job.job_type,
                %worker_id,
                attempt = job.attempt_count,
                "job claimed"
            );
            Ok(Some(job))
        })
    }

    // ── Completion ─────────────────────────────────────────────────

    pub fn complete_success(&self, id: &str, now: DateTime<Utc>) -> QueueResult<Job> {
        self.store.with_tx(|tx| self.complete_success_in(tx, id, now))
    }

    /// Mark an active job succeeded. Already-terminal jobs are returned unchanged.
    pub fn complete_success_in(
        &self,
        tx: &StoreTx,
        id: &str,
        now: DateTime<Utc>,
    ) -> QueueResult<Job> {
        let mut job = load(tx, id)?;
        if job.status.is_terminal() {
            return Ok(job);
        }
        job.status = JobStatus::Succeeded;
        job.error_code = None;
        job.error_message = None;
        finish(&mut job, now);
        tx.save_job(&job)?;
        Ok(job)
    }

    pub fn complete_failure(
        &self,
        id: &str,
        code: &str,
        message: &str,
        now: DateTime<Utc>,
    ) -> QueueResult<Job> {
        self.store
            .with_tx(|tx| self.complete_failure_in(tx, id, code, message, now))
    }

    /// Mark an active job failed. Already-terminal jobs are returned unchanged.
    pub fn complete_failure_in(
        &self,
        tx: &StoreTx,
        id: &str,
        code: &str,
        message: &str,
        now: DateTime<Utc>,
    ) -> QueueResult<Job> {
        let mut job = load(tx, id)?;
        if job.status.is_terminal() {
            return Ok(job);
        }
        job.status = JobStatus::Failed;
        job.error_code = Some(code.to_string());
        job.error_message = Some(truncate_tail(message, JOB_ERROR_MESSAGE_MAX));
        finish(&mut job, now);
        tx.save_job(&job)?;
        Ok(job)
    }

    /// Put a running job back in the queue until `run_after`.
    pub fn requeue(
        &self,
        id: &str,
        run_after: DateTime<Utc>,
        code: &str,
        message: &str,
        now: DateTime<Utc>,
    ) -> QueueResult<Job> {
        self.store.with_tx(|tx| {
            let mut job = load(tx, id)?;
            if job.status != JobStatus::Running {
                return Ok(job);
            }
            job.status = JobStatus::Queued;
            job.locked_by = None;
            job.locked_at = None;
            job.run_after = Some(run_after);
            job.error_code = Some(code.to_string());
            job.error_message = Some(truncate_tail(message, JOB_ERROR_MESSAGE_MAX));
            job.updated_at = now;
            tx.save_job(&job)?;
            Ok(job)
        })
    }

    /// Cancel a queued or running job.
    pub fn cancel(&self, id: &str) -> QueueResult<Job> {
        let now = self.clock.now();
        self.store.with_tx(|tx| {
            let mut job = load(tx, id)?;
            if !job.status.is_active() {
                return Err(QueueError::NotCancellable {
                    id: job.id,
                    status: job.status,
                });
            }
            job.status = JobStatus::Cancelled;
            job.error_code = None;
            job.error_message = None;
            finish(&mut job, now);
            tx.save_job(&job)?;
            info!(job_id = %job.id, job_type = %job.job_type, "job cancelled");
            Ok(job)
        })
    }

    // ── Reads ──────────────────────────────────────────────────────

    pub fn get(&self, id: &str) -> QueueResult<Job> {
        self.store
            .get::<Job>(id)?
            .ok_or_else(|| QueueError::NotFound(id.to_string()))
    }

    /// Jobs matching `filter`, newest first.
    pub fn list(&self, filter: &JobFilter) -> QueueResult<Vec<Job>> {
        let mut jobs: Vec<Job> = self
            .store
            .list::<Job>()?
            .into_iter()
            .filter(|j| filter.matches(j))
            .collect();
        jobs.sort_by(|a, b| b.queue_order().cmp(&a.queue_order()));
        if let Some(limit) = filter.limit {
            jobs.truncate(limit);
        }
        Ok(jobs)
    }

    pub fn count_by_status(&self) -> QueueResult<StatusCounts> {
        let mut counts = StatusCounts::default();
        for job in self.store.list::<Job>()? {
            match job.status {
                JobStatus::Queued => counts.queued += 1,
                JobStatus::Running => counts.running += 1,
                JobStatus::Succeeded => counts.succeeded += 1,
                JobStatus::Failed => counts.failed += 1,
                JobStatus::Cancelled => counts.cancelled += 1,
            }
        }
        Ok(counts)
    }
}

fn validate(input: &EnqueueInput) -> QueueResult<()> {
    if input.max_attempts == 0 {
        return Err(QueueError::InvalidInput("max_attempts must be positive".into()));
    }
    if !input.payload.is_object() {
        return Err(QueueError::InvalidInput(format!(
            "{} payload must be a JSON object",
            input.job_type
        )));
    }
    let blank = |v: &Option<String>| v.as_deref().is_some_and(|s| s.trim().is_empty());
    if blank(&input.job_id)
        || blank(&input.site_id)
        || blank(&input.environment_id)
        || blank(&input.node_id)
    {
        return Err(QueueError::InvalidInput("job ids must not be blank".into()));
    }
    Ok(())
}

fn load(tx: &StoreTx, id: &str) -> QueueResult<Job> {
    tx.get::<Job>(id)?
        .ok_or_else(|| QueueError::NotFound(id.to_string()))
}

fn finish(job: &mut Job, now: DateTime<Utc>) {
    job.locked_by = None;
    job.locked_at = None;
    job.finished_at = Some(now);
    job.updated_at = now;
}
