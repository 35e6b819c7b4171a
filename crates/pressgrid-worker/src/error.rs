use thiserror::Error;

use pressgrid_queue::QueueError;

/// Failures of the worker loop itself. Handler failures never surface
/// here; they are settled on the job row.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
}

pub type WorkerResult<T> = Result<T, WorkerError>;
