//! pressgrid-services — the state machines of the control plane.
//!
//! Every command follows the same shape: one store transaction that loads
//! the entities, validates preconditions, advances their status (bumping
//! `state_version`) and enqueues the job that will carry out the effect.
//! A gate conflict aborts the whole transaction.
//!
//! ```text
//!   command ──► with_tx { load ─► validate ─► transition ─► enqueue } ──► audit "accepted"
//!                                                              │
//!   worker ─► handler ─► playbook ─► mark_*_succeeded / mark_*_failed
//!                                      with_tx { terminal status, reconcile site, finish job }
//! ```
//!
//! Handlers never write entity status themselves; they call the
//! completion APIs of the owning service.

pub mod artifacts;
pub mod audit;
pub mod backup;
pub mod context;
pub mod domain;
pub mod environment;
pub mod error;
pub mod import;
mod lifecycle;
pub mod magic_login;
pub mod node;
pub mod promotion;
pub mod readiness;
pub mod release;
pub mod site;
pub mod validate;

#[cfg(test)]
mod testing;

pub use audit::{AuditEvent, AuditRecorder, SharedAudit, StoreAuditRecorder};
pub use backup::{BackupAccepted, BackupService};
pub use context::ServiceContext;
pub use domain::{dns_mismatch_error, DomainAccepted, DomainService};
pub use environment::{
    Accepted, CacheToggleInput, CreateEnvironmentInput, DeployAccepted, DeployInput,
    EnvironmentService, RestoreInput, UpdatesAccepted, UpdatesInput,
};
pub use error::{ServiceError, ServiceResult};
pub use import::{ImportAccepted, ImportService};
pub use magic_login::{MagicLogin, MagicLoginService};
pub use node::{NodeService, RegisterNodeInput, RegisterNodeResult};
pub use promotion::{DriftCheckAccepted, PromoteAccepted, PromotionService};
pub use readiness::{ReadinessChecker, ReadinessReason, ReadinessReport};
pub use release::{ReleaseService, RollbackQueued};
pub use site::{CreateSiteInput, CreateSiteResult, SiteService};

/// Every queue-backed service over one shared context.
#[derive(Clone)]
pub struct Services {
    pub ctx: ServiceContext,
    pub sites: SiteService,
    pub environments: EnvironmentService,
    pub backups: BackupService,
    pub domains: DomainService,
    pub promotion: PromotionService,
    pub releases: ReleaseService,
    pub imports: ImportService,
    pub nodes: NodeService,
}

impl Services {
    pub fn new(ctx: ServiceContext) -> Self {
        Self {
            sites: SiteService::new(ctx.clone()),
            environments: EnvironmentService::new(ctx.clone()),
            backups: BackupService::new(ctx.clone()),
            domains: DomainService::new(ctx.clone()),
            promotion: PromotionService::new(ctx.clone()),
            releases: ReleaseService::new(ctx.clone()),
            imports: ImportService::new(ctx.clone()),
            nodes: NodeService::new(ctx.clone()),
            ctx,
        }
    }
}
