//! pressd — the pressgrid daemon.
//!
//! One binary for both roles:
//! - `run`: N queue workers plus the backup retention sweep, until Ctrl-C
//! - operator commands that call the services directly and print JSON
//!
//! # Usage
//!
//! ```text
//! pressd run --config /etc/pressgrid/pressgrid.toml
//! pressd node add --hostname web-1.example.net --public-ip 203.0.113.7
//! pressd site create --name "Acme" --slug acme
//! pressd jobs list --status failed --limit 20
//! ```

mod commands;
mod context;
mod daemon;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use pressgrid_core::PressConfig;
use pressgrid_state::JobStatus;

const DEFAULT_LOG_FILTER: &str = "info,pressd=debug,pressgrid=debug";

#[derive(Parser)]
#[command(name = "pressd", about = "pressgrid control-plane daemon")]
struct Cli {
    /// Path to pressgrid.toml. Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run workers and the retention sweep until interrupted.
    Run,

    /// Manage nodes.
    Node {
        #[command(subcommand)]
        command: NodeCommand,
    },

    /// Manage sites.
    Site {
        #[command(subcommand)]
        command: SiteCommand,
    },

    /// Inspect and cancel jobs.
    Jobs {
        #[command(subcommand)]
        command: JobsCommand,
    },

    /// Issue a one-time WordPress admin login URL.
    MagicLogin { environment_id: String },
}

#[derive(Subcommand)]
enum NodeCommand {
    /// Register a node and queue its provisioning.
    Add {
        #[arg(long, default_value = "")]
        name: String,
        #[arg(long)]
        hostname: String,
        #[arg(long)]
        public_ip: Option<String>,
        #[arg(long, default_value_t = 22)]
        ssh_port: u16,
        #[arg(long, default_value = "root")]
        ssh_user: String,
        #[arg(long)]
        ssh_key: Option<String>,
        /// The node is this host.
        #[arg(long)]
        local: bool,
    },
    /// Check whether a node can take sites.
    Readiness { node_id: String },
}

#[derive(Subcommand)]
enum SiteCommand {
    /// Create a site with its production environment.
    Create {
        #[arg(long)]
        name: String,
        #[arg(long)]
        slug: String,
    },
}

#[derive(Subcommand)]
enum JobsCommand {
    List {
        #[arg(long, value_enum)]
        status: Option<StatusArg>,
        #[arg(long)]
        limit: Option<usize>,
    },
    Cancel { id: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum StatusArg {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl From<StatusArg> for JobStatus {
    fn from(arg: StatusArg) -> Self {
        match arg {
            StatusArg::Queued => JobStatus::Queued,
            StatusArg::Running => JobStatus::Running,
            StatusArg::Succeeded => JobStatus::Succeeded,
            StatusArg::Failed => JobStatus::Failed,
            StatusArg::Cancelled => JobStatus::Cancelled,
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = PressConfig::load(cli.config.as_deref())?;

    match cli.command {
        Command::Run => daemon::run(config).await,
        Command::Node { command } => match command {
            NodeCommand::Add {
                name,
                hostname,
                public_ip,
                ssh_port,
                ssh_user,
                ssh_key,
                local,
            } => commands::node_add(
                &config,
                pressgrid_services::RegisterNodeInput {
                    name,
                    hostname,
                    public_ip,
                    ssh_port,
                    ssh_user,
                    ssh_private_key_path: ssh_key,
                    is_local: local,
                },
            ),
            NodeCommand::Readiness { node_id } => commands::node_readiness(&config, &node_id).await,
        },
        Command::Site { command } => match command {
            SiteCommand::Create { name, slug } => commands::site_create(&config, name, slug),
        },
        Command::Jobs { command } => match command {
            JobsCommand::List { status, limit } => commands::jobs_list(&config, status.map(JobStatus::from), limit),
            JobsCommand::Cancel { id } => commands::jobs_cancel(&config, &id),
        },
        Command::MagicLogin { environment_id } => commands::magic_login(&config, &environment_id).await,
    }
}
