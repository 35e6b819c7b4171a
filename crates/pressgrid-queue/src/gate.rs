//! Mutation gate and claim eligibility.
//!
//! Both rules work over the set of queued-or-running jobs read inside the
//! caller's write transaction:
//!
//! - admission: a new job is refused while any active job shares its
//!   `site_id` or its `node_id`;
//! - claim: the oldest runnable job wins, unless a running job or an older
//!   queued job holds one of its keys.

use chrono::{DateTime, Utc};

use pressgrid_state::{Job, JobStatus};

use crate::error::{ConflictScope, QueueError, QueueResult};

/// Refuse admission when an active job already holds the site or node.
pub fn check_admission(
    active: &[Job],
    site_id: Option<&str>,
    node_id: Option<&str>,
) -> QueueResult<()> {
    if let Some(site_id) = site_id {
        if active.iter().any(|j| j.site_id.as_deref() == Some(site_id)) {
            return Err(QueueError::ConcurrencyConflict {
                scope: ConflictScope::Site,
                id: site_id.to_string(),
            });
        }
    }
    if let Some(node_id) = node_id {
        if active.iter().any(|j| j.node_id.as_deref() == Some(node_id)) {
            return Err(QueueError::ConcurrencyConflict {
                scope: ConflictScope::Node,
                id: node_id.to_string(),
            });
        }
    }
    Ok(())
}

/// Pick the job to claim at `now`, if any.
pub fn next_claimable(active: &[Job], now: DateTime<Utc>) -> Option<&Job> {
    let mut runnable: Vec<&Job> = active.iter().filter(|j| j.is_runnable_at(now)).collect();
    runnable.sort_by(|a, b| a.queue_order().cmp(&b.queue_order()));

    runnable.into_iter().find(|candidate| {
        !active.iter().any(|other| {
            other.id != candidate.id
                && holds_before(other, candidate)
                && shares_key(other, candidate)
        })
    })
}

/// `other` blocks `candidate` if it is running, or queued ahead of it.
fn holds_before(other: &Job, candidate: &Job) -> bool {
    match other.status {
        JobStatus::Running => true,
        JobStatus::Queued => other.queue_order() < candidate.queue_order(),
        _ => false,
    }
}

fn shares_key(a: &Job, b: &Job) -> bool {
    let same = |x: &Option<String>, y: &Option<String>| matches!((x, y), (Some(x), Some(y)) if x == y);
    same(&a.site_id, &b.site_id) || same(&a.node_id, &b.node_id)
}
