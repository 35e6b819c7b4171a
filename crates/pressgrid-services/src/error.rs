//! Service error taxonomy.

use thiserror::Error;

use pressgrid_queue::{ConflictScope, QueueError};
use pressgrid_state::{JobStatus, LifecycleStatus, StateError};

/// Errors surfaced by service commands and completion APIs.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    // ── Not found ──────────────────────────────────────────────────
    #[error("site not found: {0}")]
    SiteNotFound(String),

    #[error("environment not found: {0}")]
    EnvironmentNotFound(String),

    #[error("backup not found: {0}")]
    BackupNotFound(String),

    #[error("domain not found: {0}")]
    DomainNotFound(String),

    #[error("release not found for environment {0}")]
    ReleaseNotFound(String),

    #[error("no previous release to roll back to for environment {0}")]
    NoRollbackRelease(String),

    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("job not found: {0}")]
    JobNotFound(String),

    // ── Conflicts ──────────────────────────────────────────────────
    #[error("slug already in use: {0}")]
    SlugConflict(String),

    #[error("domain already attached: {0}")]
    DomainConflict(String),

    #[error("{scope} {id}: mutation concurrency conflict")]
    ConcurrencyConflict { scope: ConflictScope, id: String },

    #[error("job {id} is {} and cannot be cancelled", status.as_str())]
    NotCancellable { id: String, status: JobStatus },

    // ── Preconditions ──────────────────────────────────────────────
    #[error("environment {id} is {status:?}, not active")]
    EnvironmentNotActive { id: String, status: LifecycleStatus },

    #[error("{kind} {id} is not failed")]
    ResourceNotFailed { kind: &'static str, id: String },

    #[error("reset rejected: {0}")]
    ResetValidationFailed(String),

    #[error("backup {0} is not a completed backup")]
    BackupNotCompleted(String),

    #[error("drift gate not met: {0}")]
    DriftGateNotMet(String),

    #[error("backup gate not met: {0}")]
    BackupGateNotMet(String),

    #[error("node {0} has no public ip")]
    NodeMissingPublicIp(String),

    #[error("no active node available")]
    NoAvailableNode,

    #[error("invalid {entity} transition: {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    // ── SSH queries ────────────────────────────────────────────────
    #[error("node unreachable: {0}")]
    NodeUnreachable(String),

    #[error("wp-cli error: {0}")]
    WpCliError(String),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

impl ServiceError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::InvalidInput(_) => "InvalidInput",
            ServiceError::SiteNotFound(_) => "SiteNotFound",
            ServiceError::EnvironmentNotFound(_) => "EnvironmentNotFound",
            ServiceError::BackupNotFound(_) => "BackupNotFound",
            ServiceError::DomainNotFound(_) => "DomainNotFound",
            ServiceError::ReleaseNotFound(_) => "ReleaseNotFound",
            ServiceError::NoRollbackRelease(_) => "NoRollbackRelease",
            ServiceError::NodeNotFound(_) => "NodeNotFound",
            ServiceError::JobNotFound(_) => "JobNotFound",
            ServiceError::SlugConflict(_) => "SlugConflict",
            ServiceError::DomainConflict(_) => "DomainConflict",
            ServiceError::ConcurrencyConflict { .. } => "ConcurrencyConflict",
            ServiceError::NotCancellable { .. } => "NotCancellable",
            ServiceError::EnvironmentNotActive { .. } => "EnvironmentNotActive",
            ServiceError::ResourceNotFailed { .. } => "ResourceNotFailed",
            ServiceError::ResetValidationFailed(_) => "ResetValidationFailed",
            ServiceError::BackupNotCompleted(_) => "BackupNotCompleted",
            ServiceError::DriftGateNotMet(_) => "DriftGateNotMet",
            ServiceError::BackupGateNotMet(_) => "BackupGateNotMet",
            ServiceError::NodeMissingPublicIp(_) => "NodeMissingPublicIP",
            ServiceError::NoAvailableNode => "NoAvailableNode",
            ServiceError::InvalidTransition { .. } => "InvalidTransition",
            ServiceError::NodeUnreachable(_) => "NodeUnreachable",
            ServiceError::WpCliError(_) => "WPCliError",
            ServiceError::State(_) => "Internal",
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ServiceError::ConcurrencyConflict { .. })
    }
}

impl From<QueueError> for ServiceError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::ConcurrencyConflict { scope, id } => {
                ServiceError::ConcurrencyConflict { scope, id }
            }
            QueueError::NotCancellable { id, status } => ServiceError::NotCancellable { id, status },
            QueueError::NotFound(id) => ServiceError::JobNotFound(id),
            QueueError::InvalidInput(msg) => ServiceError::InvalidInput(msg),
            err @ QueueError::InvalidPayload { .. } => ServiceError::InvalidInput(err.to_string()),
            QueueError::State(err) => ServiceError::State(err),
        }
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;
