// BeamFlow CLI
//
// Design Decision: Use clap derive for ergonomic argument parsing.
// Design Decision: Support text/json/yaml output formats for scripting.
// Design Decision: Embed beamflow-core directly rather than talk to a
// service over HTTP -- the kernel has no network surface of its own.

mod commands;
mod engine;
mod output;
mod workflows;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "beamflow")]
#[command(about = "BeamFlow CLI - start, inspect, and operate workflow instances")]
#[command(version)]
pub struct Cli {
    /// Path to a YAML engine config file. Overridden by --storage-dir if set.
    #[arg(long, env = "BEAMFLOW_CONFIG")]
    pub config: Option<String>,

    /// Use a SQLite-backed disk store rooted at this directory instead of memory
    #[arg(long, env = "BEAMFLOW_STORAGE_DIR")]
    pub storage_dir: Option<String>,

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
    /// Start, inspect, resume, and cancel workflow instances
    Workflow {
        #[command(subcommand)]
        command: commands::workflow::WorkflowCommand,
    },

    /// Operate the dead-letter queue
    Dlq {
        #[command(subcommand)]
        command: commands::dlq::DlqCommand,
    },

    /// Inspect and reset circuit breakers
    CircuitBreaker {
        #[command(subcommand)]
        command: commands::circuit_breaker::CircuitBreakerCommand,
    },
}

fn load_config(cli: &Cli) -> anyhow::Result<beamflow_core::EngineConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)?;
            serde_yaml::from_str(&raw)?
        }
        None => beamflow_core::EngineConfig::default(),
    };
    if let Some(dir) = &cli.storage_dir {
        config.storage.mode = beamflow_core::config::StorageMode::Disk;
        config.storage.dir = Some(dir.clone());
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let output_format = output::OutputFormat::from_str(&cli.output);
    let config = load_config(&cli)?;
    let supervisor = engine::boot(&config).await?;
    supervisor.recover_all().await?;

    match cli.command {
        Commands::Workflow { command } => {
            commands::workflow::run(command, &supervisor, output_format, cli.quiet).await
        }
        Commands::Dlq { command } => commands::dlq::run(command, &supervisor, output_format).await,
        Commands::CircuitBreaker { command } => {
            commands::circuit_breaker::run(command, &supervisor, output_format).await
        }
    }
}
