//! queuectl - command-line front end for the job queue.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "queuectl")]
#[command(about = "Durable shell job queue", long_about = None)]
struct Cli {
    /// SQLite database file holding the job tables
    #[arg(long, env = "QUEUECTL_DB", default_value = "jobs.db")]
    db: PathBuf,

    /// Table namespace inside the database
    #[arg(long, env = "QUEUECTL_NAMESPACE", default_value = "queuectl")]
    namespace: String,

    /// JSON config file with max_retries and backoff_base
    #[arg(long, env = "QUEUECTL_CONFIG", default_value = "config.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enqueue a job, e.g. '{"command": "sleep 2", "max_retries": 3}'
    Enqueue {
        /// Job description as JSON
        job_json: String,
    },
    /// Manage workers
    Worker {
        #[command(subcommand)]
        command: WorkerCommands,
    },
    /// Show job counts per state
    Status,
    /// List jobs
    List {
        /// Only show jobs in this state
        #[arg(long)]
        state: Option<String>,
    },
    /// Inspect and retry dead jobs
    Dlq {
        #[command(subcommand)]
        command: DlqCommands,
    },
    /// Read or change the queue configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum WorkerCommands {
    /// Run workers until Ctrl+C
    Start {
        /// Number of workers to start
        #[arg(long, default_value = "1")]
        count: usize,
        /// Requeue jobs left processing for this many seconds by a previous run
        #[arg(long, default_value = "60")]
        stale_after: u64,
    },
}

#[derive(Subcommand)]
enum DlqCommands {
    /// List dead jobs
    List,
    /// Move a dead job back to pending
    Retry {
        /// Job ID
        job_id: String,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Set a config value
    Set { key: String, value: String },
    /// Print a config value
    Get { key: String },
    /// Print the whole config
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let store = commands::Store {
        db: cli.db,
        namespace: cli.namespace,
        config: cli.config,
    };

    match cli.command {
        Commands::Enqueue { job_json } => {
            commands::enqueue(&store, &job_json).await?;
        }
        Commands::Worker { command } => match command {
            WorkerCommands::Start { count, stale_after } => {
                commands::worker::start(&store, count, stale_after).await?;
            }
        },
        Commands::Status => {
            commands::status(&store).await?;
        }
        Commands::List { state } => {
            commands::list(&store, state.as_deref()).await?;
        }
        Commands::Dlq { command } => match command {
            DlqCommands::List => {
                commands::dlq::list(&store).await?;
            }
            DlqCommands::Retry { job_id } => {
                commands::dlq::retry(&store, &job_id).await?;
            }
        },
        Commands::Config { command } => match command {
            ConfigCommands::Set { key, value } => {
                commands::config::set(&store, &key, &value)?;
            }
            ConfigCommands::Get { key } => {
                commands::config::get(&store, &key)?;
            }
            ConfigCommands::Show => {
                commands::config::show(&store)?;
            }
        },
    }

    Ok(())
}
