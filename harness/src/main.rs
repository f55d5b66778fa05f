use anyhow::Context;
use clap::{Parser, Subcommand};
use relay_core::JobType;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use relay_harness::{config, enqueue, migrate, serve, subnode};

#[derive(Parser, Debug)]
#[command(name = "relay-harness")]
#[command(about = "Task relay and aggregation engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run DB migrations for the state database.
    Migrate,

    /// Run the relay: HTTP server, upstream pollers and expiry sweep.
    Serve {
        /// Serve the HTTP surface only; do not poll upstream.
        #[arg(long)]
        no_pollers: bool,

        /// Do not expire stale tasks.
        #[arg(long)]
        no_expiry_sweep: bool,
    },

    /// Manage registered SubNodes (Postgres backend).
    Subnode {
        #[command(subcommand)]
        command: SubnodeCommand,
    },

    /// Publish a job file onto a SubNode queue (manual testing helper).
    Enqueue {
        /// Target SubNode id.
        #[arg(long)]
        subnode: String,

        /// JSON job payload.
        #[arg(long)]
        file: PathBuf,

        /// `availability` or `distribution`; inferred from the payload when omitted.
        #[arg(long)]
        job_type: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum SubnodeCommand {
    /// Register a SubNode, or reassign the owner of an existing id.
    Add {
        owner: String,
        #[arg(long)]
        id: Option<String>,
    },
    List,
    Remove {
        id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,relay_dispatcher=debug")),
        )
        .init();

    let cli = Cli::parse();
    let cfg = config::HarnessConfig::from_env().context("load harness config")?;

    match cli.command {
        Command::Migrate => migrate::run(&cfg).await,
        Command::Serve {
            no_pollers,
            no_expiry_sweep,
        } => {
            let opts = serve::ServeOptions {
                enable_pollers: !no_pollers,
                enable_expiry_sweep: !no_expiry_sweep,
            };
            serve::run(&cfg, opts).await
        }
        Command::Subnode { command } => match command {
            SubnodeCommand::Add { owner, id } => subnode::add(&cfg, &owner, id.as_deref()).await,
            SubnodeCommand::List => subnode::list(&cfg).await,
            SubnodeCommand::Remove { id } => subnode::remove(&cfg, &id).await,
        },
        Command::Enqueue {
            subnode,
            file,
            job_type,
        } => {
            let job_type = job_type
                .map(|raw| raw.parse::<JobType>())
                .transpose()
                .context("parse --job-type")?;
            enqueue::run(&cfg, &subnode, &file, job_type).await
        }
    }
}
