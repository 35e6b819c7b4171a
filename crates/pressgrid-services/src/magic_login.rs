//! One-time WordPress admin login links, fetched synchronously over SSH.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use pressgrid_runner::{is_unreachable_output, SshRunner};

use crate::context::ServiceContext;
use crate::error::{ServiceError, ServiceResult};
use crate::lifecycle;

pub const MAGIC_LOGIN_TIMEOUT: Duration = Duration::from_secs(10);
pub const MAGIC_LOGIN_TTL_SECS: i64 = 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MagicLogin {
    pub login_url: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct MagicLoginService {
    ctx: ServiceContext,
    ssh: Arc<dyn SshRunner>,
    timeout: Duration,
}

impl MagicLoginService {
    pub fn new(ctx: ServiceContext, ssh: Arc<dyn SshRunner>) -> Self {
        Self {
            ctx,
            ssh,
            timeout: MAGIC_LOGIN_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn login(&self, environment_id: &str) -> ServiceResult<MagicLogin> {
        let (env, node) = self.ctx.store.read(|view| {
            let env = view
                .get::<pressgrid_state::Environment>(environment_id)?
                .ok_or_else(|| ServiceError::EnvironmentNotFound(environment_id.to_string()))?;
            let node = view
                .get::<pressgrid_state::Node>(&env.node_id)?
                .ok_or_else(|| ServiceError::NodeNotFound(env.node_id.clone()))?;
            Ok::<_, ServiceError>((env, node))
        })?;
        lifecycle::require_active(&env)?;

        let args = login_command(&env.id);
        let host = node.public_ip().unwrap_or_else(|| node.hostname.trim()).to_string();
        debug!(environment_id, %host, "requesting magic login");

        let output = match tokio::time::timeout(
            self.timeout,
            self.ssh.run(&host, node.ssh_port, node.ssh_user.trim(), &args),
        )
        .await
        {
            Err(_) => {
                warn!(environment_id, %host, "magic login timed out");
                return Err(ServiceError::NodeUnreachable(format!(
                    "{host}: no answer within {}s",
                    self.timeout.as_secs()
                )));
            }
            Ok(Err(err)) if is_unreachable_output(err.output()) => {
                return Err(ServiceError::NodeUnreachable(err.output().trim().to_string()));
            }
            Ok(Err(err)) => {
                return Err(ServiceError::WpCliError(format!("{err}: {}", err.output().trim())));
            }
            Ok(Ok(output)) => output,
        };

        let login_url = output.trim();
        if login_url.is_empty() {
            return Err(ServiceError::WpCliError("wp-cli returned no login url".into()));
        }
        Ok(MagicLogin {
            login_url: login_url.to_string(),
            expires_at: self.ctx.clock.now() + chrono::Duration::seconds(MAGIC_LOGIN_TTL_SECS),
        })
    }
}

fn login_command(environment_id: &str) -> Vec<String> {
    [
        "wp".to_string(),
        format!("--path=/var/www/sites/{environment_id}/current"),
        "user".into(),
        "session".into(),
        "create".into(),
        "admin".into(),
        "--porcelain".into(),
    ]
    .to_vec()
}
