//! Job payload wire formats.
//!
//! Each job type carries one JSON object. Producers (services) build the
//! struct and [`encode`] it; consumers (handlers) [`decode`] it, which
//! rejects unknown fields.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use pressgrid_state::{BackupScope, Job, JobType, PromotionPreset};

use crate::error::{QueueError, QueueResult};

/// A payload bound to exactly one job type.
pub trait JobPayload: Serialize + DeserializeOwned {
    const JOB_TYPE: JobType;
}

pub fn encode<P: JobPayload>(payload: &P) -> QueueResult<serde_json::Value> {
    serde_json::to_value(payload).map_err(|e| QueueError::InvalidPayload {
        job_type: P::JOB_TYPE,
        reason: e.to_string(),
    })
}

pub fn decode<P: JobPayload>(job: &Job) -> QueueResult<P> {
    if job.job_type != P::JOB_TYPE {
        return Err(QueueError::InvalidPayload {
            job_type: P::JOB_TYPE,
            reason: format!("job {} has type {}", job.id, job.job_type),
        });
    }
    serde_json::from_value(job.payload.clone()).map_err(|e| QueueError::InvalidPayload {
        job_type: P::JOB_TYPE,
        reason: e.to_string(),
    })
}

macro_rules! payload {
    ($name:ident => $job_type:ident { $($field:ident : $ty:ty),* $(,)? }) => {
        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
        #[serde(deny_unknown_fields)]
        pub struct $name {
            $(pub $field: $ty,)*
        }

        impl JobPayload for $name {
            const JOB_TYPE: JobType = JobType::$job_type;
        }
    };
}

payload!(NodeProvisionPayload => NodeProvision {
    node_id: String,
});

payload!(SiteCreatePayload => SiteCreate {
    site_id: String,
    environment_id: String,
    node_id: String,
});

payload!(EnvCreatePayload => EnvCreate {
    site_id: String,
    environment_id: String,
    node_id: String,
    source_environment_id: String,
});

payload!(EnvDeployPayload => EnvDeploy {
    environment_id: String,
    release_id: String,
    source_type: String,
    source_ref: String,
});

payload!(EnvUpdatePayload => EnvUpdate {
    environment_id: String,
    scope: String,
    pre_update_backup_id: String,
    pre_update_backup_fresh: bool,
});

payload!(EnvRestorePayload => EnvRestore {
    environment_id: String,
    backup_id: String,
});

payload!(EnvPromotePayload => EnvPromote {
    source_environment_id: String,
    target_environment_id: String,
    promotion_preset: PromotionPreset,
    drift_check_id: String,
    pre_promote_backup_id: String,
    release_id: String,
});

/// Only the flags the caller asked to change are present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnvCacheTogglePayload {
    pub environment_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fastcgi_cache_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redis_cache_enabled: Option<bool>,
}

impl JobPayload for EnvCacheTogglePayload {
    const JOB_TYPE: JobType = JobType::EnvCacheToggle;
}

payload!(CachePurgePayload => CachePurge {
    environment_id: String,
    fastcgi_cache_enabled: bool,
    redis_cache_enabled: bool,
});

payload!(BackupCreatePayload => BackupCreate {
    backup_id: String,
    environment_id: String,
    backup_scope: BackupScope,
    storage_path: String,
});

payload!(BackupCleanupPayload => BackupCleanup {
    backup_id: String,
    environment_id: String,
    storage_path: String,
});

payload!(DomainAddPayload => DomainAdd {
    environment_id: String,
    domain_id: String,
    domain_hostname: String,
    node_public_ip: String,
});

payload!(DomainRemovePayload => DomainRemove {
    environment_id: String,
    domain_id: String,
    domain_hostname: String,
    preview_url: String,
});

payload!(DriftCheckPayload => DriftCheck {
    environment_id: String,
    drift_check_id: String,
    promotion_preset: PromotionPreset,
});

payload!(HealthCheckPayload => HealthCheck {
    environment_id: String,
    release_id: String,
    trigger_job_type: JobType,
});

payload!(ReleaseRollbackPayload => ReleaseRollback {
    environment_id: String,
    failed_release_id: String,
    restored_release_id: String,
    health_check_job_id: String,
});

payload!(SiteImportPayload => SiteImport {
    site_id: String,
    environment_id: String,
    node_id: String,
    archive_url: String,
    release_id: String,
    target_url: String,
});
