//! Conversation execution engine daemon.

use anyhow::Result;
use clap::Parser;
use tracing::error;

mod cmd;

#[derive(Parser)]
#[command(name = "convo-engine")]
#[command(about = "Runs AI coding assistants in containerized workspaces against Git repositories")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<cmd::Commands>,

    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Address to bind the streaming HTTP surface to
    #[arg(long, default_value = "127.0.0.1:8080")]
    bind: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("convo_engine={log_level}").into()),
        )
        .init();

    match cli.command {
        Some(cmd::Commands::CheckConfig) => {
            convo_engine::EngineConfig::load(&cli.config)?;
            println!("configuration OK: {}", cli.config);
        }
        None => {
            if let Err(e) = cmd::root::run(&cli.config, &cli.bind).await {
                error!("daemon error: {e}");
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
