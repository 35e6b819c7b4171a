//! pressgrid-queue — durable job queue for lifecycle mutations.
//!
//! Every mutation of a node, site or environment becomes a [`Job`] row in
//! the state store. The queue:
//!
//! - Admits jobs through the mutation gate (one active job per site and per node)
//! - Hands out the oldest runnable job to a worker (FIFO by `created_at`, `id`)
//! - Records success, failure, backoff requeue and cancellation
//! - Encodes and decodes the per-type JSON payloads
//!
//! # Architecture
//!
//! ```text
//! JobQueue
//!   ├── StateStore (JOBS + ACTIVE_JOBS tables, one write txn per op)
//!   ├── gate (admission + claim eligibility over active jobs)
//!   └── payload (typed JSON bodies, unknown fields rejected)
//! ```
//!
//! [`Job`]: pressgrid_state::Job

pub mod error;
pub mod gate;
pub mod payload;
pub mod queue;

pub use error::{ConflictScope, QueueError, QueueResult};
pub use payload::JobPayload;
pub use queue::{EnqueueInput, JobFilter, JobQueue, StatusCounts, DEFAULT_MAX_ATTEMPTS};
