//! Shared fixture for service unit tests.

use std::sync::Arc;

use chrono::Duration;

use pressgrid_core::{Clock, ManualClock, SequentialIds};
use pressgrid_queue::JobFilter;
use pressgrid_state::*;

use crate::artifacts;
use crate::backup::BackupService;
use crate::context::ServiceContext;
use crate::domain::DomainService;
use crate::environment::EnvironmentService;
use crate::import::ImportService;
use crate::node::NodeService;
use crate::promotion::PromotionService;
use crate::release::ReleaseService;
use crate::site::{CreateSiteInput, CreateSiteResult, SiteService};

pub(crate) struct Fixture {
    pub ctx: ServiceContext,
    pub clock: Arc<ManualClock>,
}

impl Fixture {
    pub fn new() -> Self {
        Self::build(None)
    }

    pub fn with_preview_domain(domain: &str) -> Self {
        Self::build(Some(domain.to_string()))
    }

    fn build(preview_domain: Option<String>) -> Self {
        let store = StateStore::open_in_memory().unwrap();
        let clock = Arc::new(ManualClock::at_epoch());
        let ctx = ServiceContext::new(store, clock.clone(), Arc::new(SequentialIds::new()))
            .with_preview_domain(preview_domain);
        Self { ctx, clock }
    }

    pub fn sites(&self) -> SiteService {
        SiteService::new(self.ctx.clone())
    }

    pub fn environments(&self) -> EnvironmentService {
        EnvironmentService::new(self.ctx.clone())
    }

    pub fn backups(&self) -> BackupService {
        BackupService::new(self.ctx.clone())
    }

    pub fn domains(&self) -> DomainService {
        DomainService::new(self.ctx.clone())
    }

    pub fn promotion(&self) -> PromotionService {
        PromotionService::new(self.ctx.clone())
    }

    pub fn releases(&self) -> ReleaseService {
        ReleaseService::new(self.ctx.clone())
    }

    pub fn imports(&self) -> ImportService {
        ImportService::new(self.ctx.clone())
    }

    pub fn nodes(&self) -> NodeService {
        NodeService::new(self.ctx.clone())
    }

    pub fn advance_minutes(&self, minutes: i64) {
        self.clock.advance(Duration::minutes(minutes));
    }

    /// Insert an active remote node with `ip` as its public address.
    pub fn active_node(&self, ip: &str) -> Node {
        let now = self.clock.now();
        let id = self.ctx.ids.new_id();
        let node = Node {
            id: id.clone(),
            name: format!("node-{}", &id[id.len() - 4..]),
            hostname: format!("node-{}.example", &id[id.len() - 4..]),
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
        self.ctx.store.with_tx(|tx| tx.put(&node)).unwrap();
        node
    }

    pub fn create_site(&self, slug: &str) -> CreateSiteResult {
        self.sites()
            .create(CreateSiteInput {
                name: slug.to_uppercase(),
                slug: slug.to_string(),
            })
            .unwrap()
    }

    /// A created site whose `site_create` job has succeeded.
    pub fn ready_site(&self, slug: &str) -> Site {
        let created = self.create_site(slug);
        self.sites()
            .mark_create_succeeded(&created.job_id, &created.site.id, &created.environment.id)
            .unwrap();
        self.site(&created.site.id)
    }

    pub fn finish_job(&self, job_id: &str) {
        self.ctx.queue.complete_success(job_id, self.clock.now()).unwrap();
    }

    pub fn site(&self, site_id: &str) -> Site {
        self.ctx.store.get::<Site>(site_id).unwrap().unwrap()
    }

    pub fn production(&self, site: &Site) -> Environment {
        let env_id = site.primary_environment_id.as_deref().unwrap();
        self.ctx.store.get::<Environment>(env_id).unwrap().unwrap()
    }

    pub fn backup(&self, backup_id: &str) -> Backup {
        self.ctx.store.get::<Backup>(backup_id).unwrap().unwrap()
    }

    pub fn pending_backup(&self, environment_id: &str) -> Backup {
        self.insert_backup(environment_id, BackupStatus::Pending, None)
    }

    pub fn completed_backup(&self, environment_id: &str, size_bytes: u64) -> Backup {
        self.insert_backup(environment_id, BackupStatus::Completed, Some(size_bytes))
    }

    fn insert_backup(&self, environment_id: &str, status: BackupStatus, size_bytes: Option<u64>) -> Backup {
        let now = self.clock.now();
        let id = self.ctx.ids.new_id();
        let completed = status == BackupStatus::Completed;
        let backup = Backup {
            id: id.clone(),
            environment_id: environment_id.to_string(),
            backup_scope: BackupScope::Full,
            status,
            storage_type: "s3".into(),
            storage_path: artifacts::storage_path(environment_id, &id),
            retention_until: now + self.ctx.backup_retention,
            checksum: completed.then(|| artifacts::checksum_bytes(id.as_bytes())),
            size_bytes,
            created_at: now,
            completed_at: completed.then_some(now),
        };
        self.ctx.store.with_tx(|tx| tx.put(&backup)).unwrap();
        backup
    }

    pub fn jobs_of(&self, job_type: JobType) -> Vec<Job> {
        self.ctx
            .queue
            .list(&JobFilter {
                job_type: Some(job_type),
                ..Default::default()
            })
            .unwrap()
    }
}
