//! Build farm CLI tool.

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "buildfarm")]
#[command(about = "Build farm dispatcher", long_about = None)]
struct Cli {
    /// Farm configuration file
    #[arg(long, short, env = "BUILDFARM_CONFIG", default_value = "farm.kdl", global = true)]
    config: String,

    /// Log output format
    #[arg(long, value_enum, default_value = "text", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the farm configuration
    Validate,
    /// Show the request a job would be dispatched with
    Compose {
        /// Job description (JSON)
        job: String,
        /// Worker to compose the request for
        #[arg(long)]
        worker: String,
    },
    /// Build one job on one worker and wait for the result
    Run {
        /// Job description (JSON)
        job: String,
        /// Worker to build on
        #[arg(long)]
        worker: String,
    },
    /// Drive queued builds on every configured worker
    Serve {
        #[arg(long, env = "DATABASE_URL")]
        database_url: String,
    },
    /// Cancel a build
    Cancel {
        /// Build ID
        id: String,
        #[arg(long, env = "DATABASE_URL")]
        database_url: String,
    },
    /// Reset a finished build and queue it again
    Retry {
        /// Build ID
        id: String,
        #[arg(long, env = "DATABASE_URL")]
        database_url: String,
    },
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Commands::Validate => {
            commands::validate(&cli.config)?;
        }
        Commands::Compose { job, worker } => {
            commands::build::compose(&cli.config, &job, &worker)?;
        }
        Commands::Run { job, worker } => {
            commands::build::run(&cli.config, &job, &worker).await?;
        }
        Commands::Serve { database_url } => {
            commands::serve::serve(&cli.config, &database_url).await?;
        }
        Commands::Cancel { id, database_url } => {
            commands::serve::cancel(&database_url, &id).await?;
        }
        Commands::Retry { id, database_url } => {
            commands::serve::retry(&database_url, &id).await?;
        }
    }

    Ok(())
}
