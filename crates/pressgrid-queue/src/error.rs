//! Job queue error types.

use std::fmt;

use thiserror::Error;

use pressgrid_state::{JobStatus, JobType};

/// Which key of the mutation gate refused admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictScope {
    Site,
    Node,
}

impl fmt::Display for ConflictScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictScope::Site => f.write_str("site"),
            ConflictScope::Node => f.write_str("node"),
        }
    }
}

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("{scope} {id}: mutation concurrency conflict")]
    ConcurrencyConflict { scope: ConflictScope, id: String },

    #[error("job not found: {0}")]
    NotFound(String),

    #[error("job {id} is {} and cannot be cancelled", status.as_str())]
    NotCancellable { id: String, status: JobStatus },

    #[error("invalid {job_type} payload: {reason}")]
    InvalidPayload { job_type: JobType, reason: String },

    #[error("state store error: {0}")]
    State(#[from] pressgrid_state::StateError),
}

impl QueueError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, QueueError::ConcurrencyConflict { .. })
    }
}

pub type QueueResult<T> = Result<T, QueueError>;
