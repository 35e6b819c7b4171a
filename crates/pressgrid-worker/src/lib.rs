//! pressgrid-worker — executes queued lifecycle jobs.
//!
//! A [`Worker`] claims one runnable job at a time, dispatches it to the
//! [`JobHandler`] registered for its type and settles the outcome on the
//! job row: success, backoff requeue, or terminal failure. Any number of
//! workers may share one store; the claim transaction hands each job to
//! exactly one of them.
//!
//! # Architecture
//!
//! ```text
//! Worker (one per worker_id)
//!   ├── JobQueue::claim_next_runnable ── nothing? sleep poll_interval
//!   ├── audit "accepted" on first attempt
//!   ├── HandlerRegistry[job_type] ── handler
//!   │     ├── PlaybookExecutor (inventory + extra vars, timeout, shutdown)
//!   │     └── Services::mark_*_succeeded / mark_*_failed
//!   │           └── env_deploy / env_restore / env_promote: health_check
//!   │               queued in the same transaction
//!   └── settle: complete | requeue(1m, 5m, 15m) | fail
//!
//! CleanupScheduler
//!   └── every interval (first tick immediate): BackupService::enqueue_expired_cleanup
//! ```
//!
//! # Shutdown
//!
//! Every loop takes a `watch::Receiver<bool>`. Flipping it to `true` stops
//! idle loops within one tick and cancels in-flight playbooks, which then
//! surface as `ANSIBLE_TIMEOUT` and are requeued for the next start.

pub mod cleanup;
pub mod error;
pub mod handlers;
pub mod worker;

pub use cleanup::{CleanupScheduler, DEFAULT_CLEANUP_INTERVAL};
pub use error::{WorkerError, WorkerResult};
pub use handlers::{HandlerContext, HandlerRegistry, JobHandler};
pub use worker::{retry_delay, Outcome, Processed, Worker, AUDIT_WRITE_FAILED};
