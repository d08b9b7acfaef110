// Fairqueue operator CLI
//
// Design Decision: Talk to PostgreSQL directly through the library's Scheduler, no HTTP layer.
// Design Decision: Support text/json/yaml output formats for scripting.
// Design Decision: Logs go to stderr so stdout stays parseable.

mod commands;
mod output;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fairqueue::{PostgresJobStore, Scheduler, SchedulerConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "fairqueue")]
#[command(about = "Fairqueue CLI - Enqueue jobs and inspect queues and dead letters")]
#[command(version)]
pub struct Cli {
    /// PostgreSQL connection string
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: String,

    /// Scheduler config file (YAML); falls back to FAIRQUEUE_* variables
    #[arg(long, short, env = "FAIRQUEUE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Output format
    #[arg(long, short, default_value = "text", value_parser = ["text", "json", "yaml"])]
    pub output: String,

    /// Suppress non-essential output
    #[arg(long, short)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Apply pending database migrations
    Migrate,

    /// Enqueue a job
    Enqueue(commands::jobs::EnqueueArgs),

    /// Show queued job counts
    Depth {
        /// Queue name (all configured queues if omitted)
        queue: Option<String>,
    },

    /// Inspect jobs
    Jobs {
        #[command(subcommand)]
        command: commands::jobs::JobsCommand,
    },

    /// Inspect dead-lettered jobs
    DeadLetters {
        #[command(subcommand)]
        command: commands::dead_letters::DeadLettersCommand,
    },
}

fn init_tracing() {
    let filter = std::env::var("RUST_LOG")
        .or_else(|_| std::env::var("LOG_LEVEL"))
        .ok()
        .and_then(|f| tracing_subscriber::EnvFilter::try_new(f).ok())
        .unwrap_or_else(|| tracing_subscriber::EnvFilter::new("fairqueue=info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn load_config(path: Option<&PathBuf>) -> Result<SchedulerConfig> {
    match path {
        Some(path) => SchedulerConfig::from_yaml_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => SchedulerConfig::from_env().context("Invalid FAIRQUEUE_* configuration"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    if let Ok(path) = dotenvy::dotenv() {
        eprintln!("Loaded .env from {:?}", path);
    }
    let cli = Cli::parse();
    init_tracing();

    let output_format = output::OutputFormat::from_str(&cli.output);
    let store = PostgresJobStore::connect(&cli.database_url)
        .await
        .context("Failed to connect to database")?;

    if let Commands::Migrate = cli.command {
        store.migrate().await.context("Migration failed")?;
        if !cli.quiet {
            println!("Migrations applied");
        }
        return Ok(());
    }

    let config = load_config(cli.config.as_ref())?;
    let scheduler = Scheduler::new(Arc::new(store), config).context("Invalid scheduler config")?;

    match cli.command {
        Commands::Migrate => Ok(()),
        Commands::Enqueue(args) => {
            commands::jobs::enqueue(&scheduler, output_format, cli.quiet, args).await
        }
        Commands::Depth { queue } => {
            commands::queues::depth(&scheduler, output_format, queue).await
        }
        Commands::Jobs { command } => commands::jobs::run(command, &scheduler, output_format).await,
        Commands::DeadLetters { command } => {
            commands::dead_letters::run(command, &scheduler, output_format).await
        }
    }
}
