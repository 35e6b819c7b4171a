//! Failure paths: gate conflicts, retry backoff, terminal failures, rollback,
//! broken payloads and audit writes.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use common::{FlakyAudit, Harness, Reply};

use pressgrid_runner::{codes, Playbook};
use pressgrid_services::domain::DOMAIN_DNS_MISMATCH;
use pressgrid_services::node::NODE_PROVISION_TIMEOUT;
use pressgrid_services::release::HEALTH_CHECK_FAILED;
use pressgrid_services::audit::{RESULT_FAILED, RESULT_RETRYING};
use pressgrid_services::{DeployInput, RegisterNodeInput, RestoreInput, SharedAudit};
use pressgrid_state::*;
use pressgrid_worker::{HandlerRegistry, Outcome, Worker, AUDIT_WRITE_FAILED};

fn git_deploy(environment_id: &str, source_ref: &str) -> DeployInput {
    DeployInput {
        environment_id: environment_id.to_string(),
        source_type: "git".into(),
        source_ref: source_ref.to_string(),
    }
}

#[tokio::test]
async fn second_mutation_on_same_site_conflicts() {
    let h = Harness::new();
    h.active_node("203.0.113.10");
    let prod = h.ready_site("acme").await;

    h.services.environments.deploy(git_deploy(&prod.id, "main")).unwrap();
    let err = h.services.backups.create(&prod.id, BackupScope::Full).unwrap_err();
    assert!(err.is_conflict(), "unexpected error: {err}");

    // The rejected command left nothing behind.
    assert!(h.services.backups.list_by_environment(&prod.id).unwrap().is_empty());
    assert_eq!(h.jobs_of(JobType::BackupCreate).len(), 0);
}

#[tokio::test]
async fn health_check_is_queued_with_the_deploy_completion() {
    let h = Harness::new();
    h.active_node("203.0.113.10");
    let prod = h.ready_site("acme").await;
    let deploy = h.services.environments.deploy(git_deploy(&prod.id, "main")).unwrap();
    assert_eq!(h.step().await.outcome, Outcome::Succeeded);

    // No window after the deploy commits for another mutation to slip in.
    let err = h.services.backups.create(&prod.id, BackupScope::Full).unwrap_err();
    assert!(err.is_conflict(), "unexpected error: {err}");

    let health = h.jobs_of(JobType::HealthCheck);
    assert_eq!(health.len(), 1);
    assert_eq!(health[0].status, JobStatus::Queued);
    assert_eq!(health[0].payload["release_id"], deploy.release.id.as_str());

    let processed = h.step().await;
    assert_eq!(processed.job_type, JobType::HealthCheck);
    assert_eq!(processed.outcome, Outcome::Succeeded);
}

#[tokio::test]
async fn retryable_failure_backs_off_then_fails_environment() {
    let h = Harness::new();
    h.active_node("203.0.113.10");
    let prod = h.ready_site("acme").await;
    for _ in 0..3 {
        h.runner.fail(Playbook::EnvDeploy, 1, "fatal: could not read from remote repository");
    }
    let deploy = h.services.environments.deploy(git_deploy(&prod.id, "main")).unwrap();
    let t0 = h.job(&deploy.job_id).created_at;

    let first = h.step().await;
    assert_eq!(first.attempt, 1);
    assert_eq!(
        first.outcome,
        Outcome::Retrying {
            run_after: t0 + chrono::Duration::minutes(1)
        }
    );
    assert_eq!(h.environment(&prod.id).status, LifecycleStatus::Deploying);
    assert_eq!(h.job(&deploy.job_id).status, JobStatus::Queued);

    // Not runnable before the backoff elapses.
    assert!(h.idle().await);

    h.advance_minutes(1);
    let second = h.step().await;
    assert_eq!(second.attempt, 2);
    assert!(matches!(second.outcome, Outcome::Retrying { .. }));

    h.advance_minutes(4);
    assert!(h.idle().await);
    h.advance_minutes(1);
    let third = h.step().await;
    assert_eq!(third.attempt, 3);
    assert_eq!(
        third.outcome,
        Outcome::Failed {
            code: codes::ANSIBLE_PLAY_ERROR.into()
        }
    );

    let job = h.job(&deploy.job_id);
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error_code.as_deref(), Some(codes::ANSIBLE_PLAY_ERROR));
    assert!(job.error_message.unwrap().contains("could not read"));
    assert_eq!(h.environment(&prod.id).status, LifecycleStatus::Failed);
    assert_eq!(h.site(&prod.site_id).status, LifecycleStatus::Failed);
    // A failed deploy never triggers a health check.
    assert!(h.jobs_of(JobType::HealthCheck).is_empty());
}

#[tokio::test]
async fn fatal_failure_completes_on_first_attempt() {
    let h = Harness::new();
    h.active_node("203.0.113.10");
    let prod = h.ready_site("acme").await;
    h.runner.fail(Playbook::EnvDeploy, 5, "ERROR! Syntax Error while loading YAML");

    h.services.environments.deploy(git_deploy(&prod.id, "main")).unwrap();
    let processed = h.step().await;

    assert_eq!(processed.attempt, 1);
    assert_eq!(
        processed.outcome,
        Outcome::Failed {
            code: codes::ANSIBLE_SYNTAX_ERROR.into()
        }
    );
    assert_eq!(h.environment(&prod.id).status, LifecycleStatus::Failed);
}

#[tokio::test]
async fn failed_health_check_rolls_back_to_previous_release() {
    let h = Harness::new();
    h.active_node("203.0.113.10");
    let prod = h.ready_site("acme").await;

    let v1 = h.services.environments.deploy(git_deploy(&prod.id, "v1")).unwrap();
    h.step().await;
    h.step().await;
    assert_eq!(h.release(&v1.release.id).health_status, HealthStatus::Healthy);

    h.advance_minutes(1);
    h.runner.fail(Playbook::HealthCheck, 2, "http 500 from preview url");
    let v2 = h.services.environments.deploy(git_deploy(&prod.id, "v2")).unwrap();
    assert_eq!(h.step().await.outcome, Outcome::Succeeded);

    let health = h.step().await;
    assert_eq!(health.job_type, JobType::HealthCheck);
    assert_eq!(
        health.outcome,
        Outcome::Failed {
            code: HEALTH_CHECK_FAILED.into()
        }
    );
    assert_eq!(h.release(&v2.release.id).health_status, HealthStatus::Unhealthy);
    assert_eq!(h.environment(&prod.id).status, LifecycleStatus::Restoring);

    let rollback = h.step().await;
    assert_eq!(rollback.job_type, JobType::ReleaseRollback);
    assert_eq!(rollback.outcome, Outcome::Succeeded);

    let env = h.environment(&prod.id);
    assert_eq!(env.status, LifecycleStatus::Active);
    assert_eq!(env.current_release_id.as_deref(), Some(v1.release.id.as_str()));

    let vars = h.runner.vars_of(Playbook::ReleaseRollback);
    assert_eq!(vars[0]["failed_release_id"], v2.release.id.as_str());
    assert_eq!(vars[0]["restored_release_id"], v1.release.id.as_str());
    assert_eq!(vars[0]["health_check_job_id"], health.job_id.as_str());

    // The rollback is not itself health-checked.
    assert!(h.idle().await);
}

#[tokio::test]
async fn failed_health_check_without_previous_release_fails_job_only() {
    let h = Harness::new();
    h.active_node("203.0.113.10");
    let prod = h.ready_site("acme").await;
    h.runner.fail(Playbook::HealthCheck, 2, "http 502");

    h.services.environments.deploy(git_deploy(&prod.id, "v1")).unwrap();
    h.step().await;
    let health = h.step().await;

    assert_eq!(
        health.outcome,
        Outcome::Failed {
            code: HEALTH_CHECK_FAILED.into()
        }
    );
    assert!(h.jobs_of(JobType::ReleaseRollback).is_empty());
    assert_eq!(h.environment(&prod.id).status, LifecycleStatus::Active);
}

#[tokio::test]
async fn restore_failure_is_final_after_one_attempt() {
    let h = Harness::new();
    h.active_node("203.0.113.10");
    let prod = h.ready_site("acme").await;
    let backup = h.completed_backup(&prod.id, b"dump").await;
    h.runner.fail(Playbook::EnvRestore, 2, "mysql import failed");

    h.services
        .environments
        .restore(RestoreInput {
            environment_id: prod.id.clone(),
            backup_id: backup.id.clone(),
        })
        .unwrap();
    let processed = h.step().await;

    assert_eq!(
        processed.outcome,
        Outcome::Failed {
            code: codes::ANSIBLE_HOST_FAILED.into()
        }
    );
    assert_eq!(h.environment(&prod.id).status, LifecycleStatus::Failed);
}

#[tokio::test]
async fn dns_mismatch_fails_domain_without_retry() {
    let h = Harness::new();
    h.active_node("203.0.113.10");
    let prod = h.ready_site("acme").await;
    h.runner.fail(
        Playbook::DomainAdd,
        2,
        "TASK [verify dns] fatal: DNS mismatch for shop.example.com",
    );

    let accepted = h.services.domains.add(&prod.id, "shop.example.com").unwrap();
    let processed = h.step().await;

    assert_eq!(processed.attempt, 1);
    assert_eq!(
        processed.outcome,
        Outcome::Failed {
            code: DOMAIN_DNS_MISMATCH.into()
        }
    );
    let domain = h.services.ctx.store.get::<Domain>(&accepted.domain.id).unwrap().unwrap();
    assert_eq!(domain.tls_status, TlsStatus::Failed);
    let job = h.job(&accepted.job_id);
    assert!(job.error_message.unwrap().contains("203.0.113.10"));
}

#[tokio::test]
async fn provision_timeout_is_retried_with_its_own_code() {
    let h = Harness::new();
    h.runner.push(Playbook::NodeProvision, Reply::Hang);
    let registered = h
        .services
        .nodes
        .register(RegisterNodeInput {
            hostname: "web-3.example".into(),
            public_ip: Some("198.51.100.9".into()),
            ..Default::default()
        })
        .unwrap();

    let processed = h.step().await;
    assert!(matches!(processed.outcome, Outcome::Retrying { .. }));
    let job = h.job(&registered.job_id);
    assert_eq!(job.error_code.as_deref(), Some(NODE_PROVISION_TIMEOUT));
    assert_eq!(
        h.services.nodes.get(&registered.node.id).unwrap().status,
        NodeStatus::Provisioning
    );

    h.advance_minutes(1);
    assert_eq!(h.step().await.outcome, Outcome::Succeeded);
    assert_eq!(
        h.services.nodes.get(&registered.node.id).unwrap().status,
        NodeStatus::Active
    );
}

#[tokio::test]
async fn shutdown_interrupts_running_playbook_and_requeues() {
    let h = Harness::new();
    h.active_node("203.0.113.10");
    let prod = h.ready_site("acme").await;
    h.runner.push(Playbook::EnvDeploy, Reply::Hang);
    let deploy = h.services.environments.deploy(git_deploy(&prod.id, "main")).unwrap();

    let stop = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        h.shutdown_tx.send(true).unwrap();
    };
    let (processed, ()) = tokio::time::timeout(Duration::from_secs(3), async { tokio::join!(h.step(), stop) })
        .await
        .expect("shutdown did not interrupt the playbook");

    assert!(matches!(processed.outcome, Outcome::Retrying { .. }));
    let job = h.job(&deploy.job_id);
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.error_code.as_deref(), Some(codes::ANSIBLE_TIMEOUT));
    assert_eq!(h.environment(&prod.id).status, LifecycleStatus::Deploying);
}

#[tokio::test]
async fn cancelled_job_is_not_run() {
    let h = Harness::new();
    h.active_node("203.0.113.10");
    let prod = h.ready_site("acme").await;
    let deploy = h.services.environments.deploy(git_deploy(&prod.id, "main")).unwrap();

    h.services.ctx.queue.cancel(&deploy.job_id).unwrap();

    assert!(h.idle().await);
    assert!(h.runner.vars_of(Playbook::EnvDeploy).is_empty());
    assert_eq!(h.job(&deploy.job_id).status, JobStatus::Cancelled);
}

// ── Handler bookkeeping ───────────────────────────────────────────

fn flaky_harness() -> (Harness, Arc<FlakyAudit>) {
    let mut recorder = None;
    let h = Harness::with_audit(|store| {
        let flaky = Arc::new(FlakyAudit::new(store));
        let shared: SharedAudit = flaky.clone();
        recorder = Some(flaky);
        shared
    });
    (h, recorder.unwrap())
}

#[tokio::test]
async fn accepted_audit_is_written_on_first_attempt_only() {
    let (h, audit) = flaky_harness();
    h.active_node("203.0.113.10");
    let prod = h.ready_site("acme").await;
    for _ in 0..3 {
        h.runner.fail(Playbook::EnvDeploy, 1, "fatal: could not read from remote repository");
    }
    let deploy = h.services.environments.deploy(git_deploy(&prod.id, "main")).unwrap();
    let before = audit.accepted_calls();

    assert!(matches!(h.step().await.outcome, Outcome::Retrying { .. }));
    assert_eq!(audit.accepted_calls(), before + 1);
    let job = h.job(&deploy.job_id);
    assert_eq!(h.audit_row(&job).unwrap().result, RESULT_RETRYING);

    h.advance_minutes(1);
    assert!(matches!(h.step().await.outcome, Outcome::Retrying { .. }));
    h.advance_minutes(5);
    assert!(matches!(h.step().await.outcome, Outcome::Failed { .. }));
    assert_eq!(audit.accepted_calls(), before + 1);

    let rows: Vec<AuditEntry> = h
        .services
        .ctx
        .store
        .list::<AuditEntry>()
        .unwrap()
        .into_iter()
        .filter(|entry| entry.resource_id == deploy.job_id)
        .collect();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].result, RESULT_FAILED);
}

#[tokio::test]
async fn failed_accepted_audit_fails_job_before_dispatch() {
    let (h, audit) = flaky_harness();
    h.active_node("203.0.113.10");
    let prod = h.ready_site("acme").await;
    let purge = h.services.environments.purge_cache(&prod.id).unwrap();

    audit.reject_accepted(true);
    let processed = h.step().await;

    assert_eq!(
        processed.outcome,
        Outcome::Failed {
            code: AUDIT_WRITE_FAILED.into()
        }
    );
    assert!(h.runner.vars_of(Playbook::CachePurge).is_empty());
    let job = h.job(&purge.job_id);
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error_code.as_deref(), Some(AUDIT_WRITE_FAILED));
    assert!(h.audit_row(&job).is_none());
}

#[tokio::test]
async fn job_without_handler_fails_with_unknown_exit() {
    let h = Harness::new();
    h.active_node("203.0.113.10");
    let prod = h.ready_site("acme").await;
    let purge = h.services.environments.purge_cache(&prod.id).unwrap();

    let bare = Worker::new("bare", &h.services, Arc::new(HandlerRegistry::new()));
    let processed = bare.process_next(&h.shutdown).await.unwrap().unwrap();

    assert_eq!(
        processed.outcome,
        Outcome::Failed {
            code: codes::ANSIBLE_UNKNOWN_EXIT.into()
        }
    );
    let job = h.job(&purge.job_id);
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error_message.as_deref().unwrap().contains("cache_purge"));
    assert_eq!(h.audit_row(&job).unwrap().result, RESULT_FAILED);
}

#[tokio::test]
async fn backup_fails_when_its_node_is_gone() {
    let h = Harness::new();
    let node = h.active_node("203.0.113.10");
    let prod = h.ready_site("acme").await;
    let accepted = h.services.backups.create(&prod.id, BackupScope::Full).unwrap();
    h.services.ctx.store.with_tx(|tx| tx.delete::<Node>(&node.id)).unwrap();

    let processed = h.step().await;

    assert_eq!(
        processed.outcome,
        Outcome::Failed {
            code: codes::ANSIBLE_UNKNOWN_EXIT.into()
        }
    );
    assert!(h.runner.vars_of(Playbook::BackupCreate).is_empty());
    assert_eq!(h.backup(&accepted.backup.id).status, BackupStatus::Failed);
}

#[tokio::test]
async fn unreadable_backup_artifact_fails_backup() {
    let h = Harness::new();
    h.active_node("203.0.113.10");
    let prod = h.ready_site("acme").await;
    let accepted = h.services.backups.create(&prod.id, BackupScope::Full).unwrap();
    // A directory where the artifact file should be.
    std::fs::create_dir_all(h.artifact_path(&accepted.backup)).unwrap();

    let processed = h.step().await;

    assert!(matches!(processed.outcome, Outcome::Failed { .. }));
    let backup = h.backup(&accepted.backup.id);
    assert_eq!(backup.status, BackupStatus::Failed);
    assert!(backup.checksum.is_none());
}

#[tokio::test]
async fn undecodable_deploy_payload_fails_environment() {
    let h = Harness::new();
    h.active_node("203.0.113.10");
    let prod = h.ready_site("acme").await;
    let deploy = h.services.environments.deploy(git_deploy(&prod.id, "main")).unwrap();
    let mut job = h.job(&deploy.job_id);
    job.payload = json!({ "environment_id": 42 });
    h.services.ctx.store.with_tx(|tx| tx.save_job(&job)).unwrap();

    let processed = h.step().await;

    assert_eq!(processed.attempt, 1);
    assert_eq!(
        processed.outcome,
        Outcome::Failed {
            code: codes::ANSIBLE_UNKNOWN_EXIT.into()
        }
    );
    assert!(h.runner.vars_of(Playbook::EnvDeploy).is_empty());
    assert_eq!(h.environment(&prod.id).status, LifecycleStatus::Failed);
    assert!(h.jobs_of(JobType::HealthCheck).is_empty());
}

#[tokio::test]
async fn undecodable_backup_payload_fails_backup() {
    let h = Harness::new();
    h.active_node("203.0.113.10");
    let prod = h.ready_site("acme").await;
    let accepted = h.services.backups.create(&prod.id, BackupScope::Full).unwrap();
    let mut job = h.job(&accepted.job_id);
    job.payload = json!([]);
    h.services.ctx.store.with_tx(|tx| tx.save_job(&job)).unwrap();

    assert!(matches!(h.step().await.outcome, Outcome::Failed { .. }));
    assert_eq!(h.backup(&accepted.backup.id).status, BackupStatus::Failed);
}
