// Taskgate CLI
//
// Design Decision: Use clap derive for ergonomic argument parsing.
// Design Decision: Support text/json/yaml output formats for scripting.
// Design Decision: Logs go to stderr so structured output on stdout stays parseable.

mod commands;
mod output;

use clap::{Parser, Subcommand};
use output::OutputFormat;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "taskgate")]
#[command(about = "Taskgate CLI - Inspect configuration and drive synthetic load through the engine")]
#[command(version)]
pub struct Cli {
    /// Output format
    #[arg(long, short, value_enum, default_value_t = OutputFormat::Text)]
    pub output: OutputFormat,

    /// Suppress non-essential output
    #[arg(long, short)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Print the effective engine configuration
    Config {
        #[command(flatten)]
        engine: commands::EngineArgs,
    },

    /// Run a synthetic workload through the engine
    Run {
        #[command(flatten)]
        load: commands::run::LoadArgs,

        #[command(flatten)]
        engine: commands::EngineArgs,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.quiet {
        "taskgate=warn,taskgate_engine=warn"
    } else {
        "taskgate=info,taskgate_engine=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match cli.command {
        Commands::Config { engine } => commands::config::run(&engine, cli.output),
        Commands::Run { load, engine } => {
            commands::run::run(&load, &engine, cli.output, cli.quiet).await
        }
    }
}
