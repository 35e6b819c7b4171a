//! The claim → dispatch → settle loop.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use pressgrid_core::SharedClock;
use pressgrid_queue::JobQueue;
use pressgrid_runner::{codes, ExecutionError};
use pressgrid_services::audit::{RESULT_FAILED, RESULT_RETRYING, RESULT_SUCCEEDED};
use pressgrid_services::{AuditEvent, Services, SharedAudit};
use pressgrid_state::{Job, JobStatus, JobType};

use crate::error::WorkerResult;
use crate::handlers::HandlerRegistry;

pub const AUDIT_WRITE_FAILED: &str = "AUDIT_WRITE_FAILED";

/// Resource type of the per-job audit correlation row.
const JOB_RESOURCE: &str = "job";

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Delay before attempt `attempt + 1`: 1m, 5m, then 15m for every later attempt.
pub fn retry_delay(attempt: u32) -> chrono::Duration {
    const DELAYS_MINUTES: [i64; 3] = [1, 5, 15];
    let index = attempt.clamp(1, DELAYS_MINUTES.len() as u32) as usize - 1;
    chrono::Duration::minutes(DELAYS_MINUTES[index])
}

/// How one claimed job ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    Retrying { run_after: DateTime<Utc> },
    Failed { code: String },
    /// Cancelled while the handler was running.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Processed {
    pub job_id: String,
    pub job_type: JobType,
    pub attempt: u32,
    pub outcome: Outcome,
}

#[derive(Clone)]
pub struct Worker {
    id: String,
    queue: JobQueue,
    audit: SharedAudit,
    clock: SharedClock,
    handlers: Arc<HandlerRegistry>,
    poll_interval: Duration,
}

impl Worker {
    pub fn new(id: impl Into<String>, services: &Services, handlers: Arc<HandlerRegistry>) -> Self {
        Self {
            id: id.into(),
            queue: services.ctx.queue.clone(),
            audit: services.ctx.audit.clone(),
            clock: services.ctx.clock.clone(),
            handlers,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Poll until `shutdown` flips to `true` or its sender is dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(worker_id = %self.id, poll_ms = self.poll_interval.as_millis() as u64, "worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let idle = match self.process_next(&shutdown).await {
                Ok(Some(_)) => false,
                Ok(None) => true,
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "worker iteration failed");
                    true
                }
            };
            if !idle {
                continue;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!(worker_id = %self.id, "worker stopped");
    }

    /// Claim and run at most one job. `None` means nothing was runnable.
    pub async fn process_next(&self, shutdown: &watch::Receiver<bool>) -> WorkerResult<Option<Processed>> {
        let Some(job) = self.queue.claim_next_runnable(&self.id, self.clock.now())? else {
            return Ok(None);
        };

        if job.attempt_count == 1 {
            let event = AuditEvent::system(job.job_type.as_str(), JOB_RESOURCE, &job.id);
            if let Err(e) = self.audit.record_async_accepted(&event) {
                error!(job_id = %job.id, job_type = %job.job_type, error = %e, "accepted audit write failed");
                let stored = self
                    .queue
                    .complete_failure(&job.id, AUDIT_WRITE_FAILED, "audit write failed", self.clock.now())?;
                return Ok(Some(processed(&job, settled(&stored, AUDIT_WRITE_FAILED))));
            }
        }

        let outcome = match self.handlers.get(job.job_type) {
            None => {
                let message = format!("handler missing for job type: {}", job.job_type);
                self.fail(&job, ExecutionError::fatal(codes::ANSIBLE_UNKNOWN_EXIT, message))?
            }
            Some(handler) => {
                debug!(job_id = %job.id, job_type = %job.job_type, attempt = job.attempt_count, "dispatching");
                match handler.handle(&job, shutdown.clone()).await {
                    Ok(()) => self.succeed(&job)?,
                    Err(err) => {
                        let err = err.normalized();
                        if err.retryable && job.attempt_count < job.max_attempts {
                            self.retry(&job, err)?
                        } else {
                            self.fail(&job, err)?
                        }
                    }
                }
            }
        };
        Ok(Some(processed(&job, outcome)))
    }

    // ── Settlement ─────────────────────────────────────────────────

    fn succeed(&self, job: &Job) -> WorkerResult<Outcome> {
        let stored = self.queue.complete_success(&job.id, self.clock.now())?;
        let outcome = settled(&stored, codes::ANSIBLE_UNKNOWN_EXIT);
        self.update_audit(job, &outcome);
        if outcome == Outcome::Succeeded {
            info!(job_id = %job.id, job_type = %job.job_type, attempt = job.attempt_count, "job succeeded");
        }
        Ok(outcome)
    }

    fn retry(&self, job: &Job, err: ExecutionError) -> WorkerResult<Outcome> {
        let now = self.clock.now();
        let run_after = now + retry_delay(job.attempt_count);
        self.queue.requeue(&job.id, run_after, &err.code, &err.message, now)?;
        warn!(
            job_id = %job.id,
            job_type = %job.job_type,
            attempt = job.attempt_count,
            code = %err.code,
            %run_after,
            "job failed, retry scheduled"
        );
        let outcome = Outcome::Retrying { run_after };
        self.update_audit(job, &outcome);
        Ok(outcome)
    }

    fn fail(&self, job: &Job, err: ExecutionError) -> WorkerResult<Outcome> {
        let stored = self
            .queue
            .complete_failure(&job.id, &err.code, &err.message, self.clock.now())?;
        let outcome = settled(&stored, &err.code);
        warn!(
            job_id = %job.id,
            job_type = %job.job_type,
            attempt = job.attempt_count,
            code = %err.code,
            "job failed"
        );
        self.update_audit(job, &outcome);
        Ok(outcome)
    }

    fn update_audit(&self, job: &Job, outcome: &Outcome) {
        let result = match outcome {
            Outcome::Succeeded => RESULT_SUCCEEDED,
            Outcome::Retrying { .. } => RESULT_RETRYING,
            Outcome::Failed { .. } | Outcome::Cancelled => RESULT_FAILED,
        };
        if let Err(e) = self
            .audit
            .update_async_result(job.job_type.as_str(), JOB_RESOURCE, &job.id, result)
        {
            warn!(job_id = %job.id, %result, error = %e, "audit result update failed");
        }
    }
}

fn processed(job: &Job, outcome: Outcome) -> Processed {
    Processed {
        job_id: job.id.clone(),
        job_type: job.job_type,
        attempt: job.attempt_count,
        outcome,
    }
}

/// Outcome as the job row records it; a completion API or a cancel may have got there first.
fn settled(stored: &Job, fallback_code: &str) -> Outcome {
    match stored.status {
        JobStatus::Succeeded => Outcome::Succeeded,
        JobStatus::Cancelled => Outcome::Cancelled,
        _ => Outcome::Failed {
            code: stored
                .error_code
                .clone()
                .unwrap_or_else(|| fallback_code.to_string()),
        },
    }
}
