//! The `mcpr` binary.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use mcpr_gateway::boot;

/// Local MCP router/gateway.
#[derive(Debug, Parser)]
#[command(name = "mcpr", version, about)]
struct Args {
    /// Path to the configuration file.
    #[arg(long, default_value = "mcpr.toml")]
    config: PathBuf,

    /// Override the configured HTTP port.
    #[arg(long)]
    port: Option<u16>,

    /// Override the configured log level.
    #[arg(long, env = "LOG_LEVEL")]
    log_level: Option<String>,
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config =
        mcpr_config::load_or_default(&args.config).context("loading configuration")?;
    if let Some(port) = args.port {
        config.http.port = port;
    }
    if let Some(level) = args.log_level {
        config.log_level = level;
    }

    init_tracing(&config.log_level);
    tracing::info!(config = %args.config.display(), "mcpr starting");

    boot::run(config).await
}
