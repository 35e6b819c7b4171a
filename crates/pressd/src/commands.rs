//! Operator subcommands. Each one runs a single service call and prints
//! the result as pretty JSON on stdout.

use serde::Serialize;

use pressgrid_core::PressConfig;
use pressgrid_queue::JobFilter;
use pressgrid_services::{CreateSiteInput, MagicLoginService, ReadinessChecker, RegisterNodeInput};
use pressgrid_state::JobStatus;

use crate::context::{open_services, ssh_runner};

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn node_add(config: &PressConfig, input: RegisterNodeInput) -> anyhow::Result<()> {
    let services = open_services(config)?;
    print_json(&services.nodes.register(input)?)
}

pub async fn node_readiness(config: &PressConfig, node_id: &str) -> anyhow::Result<()> {
    let services = open_services(config)?;
    let node = services.nodes.get(node_id)?;
    let report = ReadinessChecker::new(ssh_runner(config)).evaluate(&node).await;
    print_json(&report)
}

pub fn site_create(config: &PressConfig, name: String, slug: String) -> anyhow::Result<()> {
    let services = open_services(config)?;
    print_json(&services.sites.create(CreateSiteInput { name, slug })?)
}

pub fn jobs_list(config: &PressConfig, status: Option<JobStatus>, limit: Option<usize>) -> anyhow::Result<()> {
    let services = open_services(config)?;
    let jobs = services.ctx.queue.list(&JobFilter {
        status,
        limit,
        ..Default::default()
    })?;
    print_json(&jobs)
}

pub fn jobs_cancel(config: &PressConfig, id: &str) -> anyhow::Result<()> {
    let services = open_services(config)?;
    print_json(&services.ctx.queue.cancel(id)?)
}

pub async fn magic_login(config: &PressConfig, environment_id: &str) -> anyhow::Result<()> {
    let services = open_services(config)?;
    let login = MagicLoginService::new(services.ctx.clone(), ssh_runner(config))
        .login(environment_id)
        .await?;
    print_json(&login)
}
