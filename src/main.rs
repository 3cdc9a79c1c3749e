use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

use agent_bridge::{Bridge, Config};

#[derive(Debug, Parser)]
#[command(name = "agent-bridge")]
#[command(about = "Registers with an orchestrator and drives a local ACP coding agent")]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(long, default_value = "config.json")]
    config: PathBuf,
}

fn init_logging() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_ansi(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging()?;

    let cli = Cli::parse();
    let cfg = Config::load(&cli.config)?;

    tracing::info!(
        target = "agent_bridge::main",
        agent = %cfg.agent.id,
        url = %cfg.orchestrator_url,
        "starting agent bridge"
    );

    Arc::new(Bridge::new(cfg)).run().await;
    Ok(())
}
