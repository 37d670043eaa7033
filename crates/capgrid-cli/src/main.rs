use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};

mod client;
mod commands;

use client::{ApiClient, exit_code};

#[derive(Parser)]
#[command(
    name = "capctl",
    about = "capgrid: policy-driven capacity controller",
    version,
    propagate_version = true
)]
struct Cli {
    /// Address of the capgridd API.
    #[arg(long, global = true, env = "CAPGRID_SERVER", default_value = "127.0.0.1:7480")]
    server: String,

    /// Request timeout, e.g. "30s" or "2m".
    #[arg(long, global = true, default_value = "2m")]
    timeout: String,

    /// Print raw JSON instead of a summary.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show pools, nodes, pending demand and the policy in force
    Status,
    /// Run a reconcile pass
    Reconcile {
        /// Plan only: print the actions without provisioning or emitting events
        #[arg(long)]
        dry_run: bool,
    },
    /// Drain a node
    Drain {
        node: String,
        /// Drain even if the pool drops below min_size
        #[arg(long)]
        force: bool,
        /// Grace period, overriding the pool's, e.g. "90s"
        #[arg(long)]
        grace: Option<String>,
    },
    /// Validate a policy document without applying it
    Validate {
        #[arg(short, long, default_value = "capgrid.toml")]
        config: PathBuf,
    },
    /// Ask the daemon to reload its policy document
    Reload,
    /// Replay the event feed
    Events {
        #[arg(long, default_value = "0")]
        since: u64,
        #[arg(long, default_value = "100")]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn,capctl=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match dispatch(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(exit_code(&e))
        }
    }
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    let timeout = parse_duration_arg(&cli.timeout)?;
    let client = ApiClient::new(&cli.server, timeout);
    match cli.command {
        Commands::Status => commands::status::status(&client, cli.json).await,
        Commands::Reconcile { dry_run } => {
            commands::reconcile::reconcile(&client, dry_run, cli.json).await
        }
        Commands::Drain { node, force, grace } => {
            let grace = grace.as_deref().map(parse_duration_arg).transpose()?;
            commands::drain::drain(&client, &node, force, grace, cli.json).await
        }
        Commands::Reload => commands::reload::reload(&client, cli.json).await,
        Commands::Events { since, limit } => {
            commands::events::events(&client, since, limit, cli.json).await
        }
        Commands::Validate { config } => commands::validate::validate(&config, cli.json),
    }
}

fn parse_duration_arg(raw: &str) -> anyhow::Result<Duration> {
    capgrid_config::parse_duration(raw)
        .ok_or_else(|| client::CliError::Usage(format!("invalid duration {raw:?}")).into())
}
