use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

use cmd::jobs::JobsCommands;
use ticketsmith::config::Config;

#[derive(Parser)]
#[command(name = "ticketsmith")]
#[command(version, about = "Run tracked tickets as iterative coding-agent jobs")]
pub struct Cli {
    /// Config file (defaults to ./ticketsmith.toml when present)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// SQLite database path
    #[arg(long, global = true, env = "TICKETSMITH_DATABASE")]
    pub database: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create or migrate the database
    Init,
    /// Process queued jobs until interrupted
    Worker {
        /// Worker id (defaults to worker-<unix millis>)
        #[arg(long)]
        id: Option<String>,
        /// Concurrent handlers per topic
        #[arg(long)]
        concurrency: Option<usize>,
    },
    /// Create a job for a ticket and queue it
    Dispatch {
        #[arg(long)]
        project: String,
        #[arg(long)]
        ticket: String,
    },
    /// Inspect and control jobs
    Jobs {
        #[command(subcommand)]
        command: JobsCommands,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(database) = cli.database {
        config.database_path = database;
    }
    if let Commands::Worker { id, concurrency } = &cli.command {
        if let Some(id) = id {
            config.worker.worker_id = id.clone();
        }
        if let Some(concurrency) = concurrency {
            config.worker.concurrency = *concurrency;
        }
        config.validate()?;
    }
    let _log_guard = ticketsmith::logging::init(&config.logging)?;

    match cli.command {
        Commands::Init => cmd::cmd_init(&config).await?,
        Commands::Worker { .. } => cmd::cmd_worker(&config).await?,
        Commands::Dispatch { project, ticket } => {
            cmd::cmd_dispatch(&config, &project, &ticket).await?
        }
        Commands::Jobs { command } => cmd::cmd_jobs(&config, command).await?,
    }

    Ok(())
}
