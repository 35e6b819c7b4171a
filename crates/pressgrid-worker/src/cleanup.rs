//! Periodic retention sweep.
//!
//! Each tick asks [`BackupService::enqueue_expired_cleanup`] to queue
//! `backup_cleanup` jobs for expired backups. The sweep itself never
//! touches artifacts; the queued jobs do, through the regular workers.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info};

use pressgrid_services::BackupService;

pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);

pub struct CleanupScheduler {
    backups: BackupService,
    interval: Duration,
}

impl CleanupScheduler {
    pub fn new(backups: BackupService, interval: Duration) -> Self {
        Self { backups, interval }
    }

    /// One sweep. Returns the number of cleanup jobs queued; errors count as zero.
    pub fn tick(&self) -> usize {
        match self.backups.enqueue_expired_cleanup() {
            Ok(enqueued) => {
                debug!(enqueued, "retention sweep");
                enqueued
            }
            Err(e) => {
                error!(code = e.code(), error = %e, "retention sweep failed");
                0
            }
        }
    }

    /// Sweep immediately, then every `interval` until `shutdown` flips to `true`.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "cleanup scheduler started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.tick();
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("cleanup scheduler stopped");
    }
}
