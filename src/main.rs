//! Kapsule daemon - Incus container session integration
//!
//! Bridges the D-Bus system bus and the Incus backend, giving desktop
//! components one asynchronous interface for creating, managing and
//! entering session containers.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

mod cmd;

#[derive(Parser)]
#[command(name = "kapsuled")]
#[command(about = "Kapsule container session daemon")]
#[command(version)]
struct Cli {
    /// Path to configuration file (default: /etc/kapsule.conf)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Path to the Incus control socket
    #[arg(short, long, env = "INCUS_SOCKET", default_value = kapsule_daemon::incus::DEFAULT_SOCKET)]
    socket: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("kapsule_daemon={}", log_level).into()),
        )
        .init();

    info!("Starting Kapsule daemon v{}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = cmd::root::run(cli.config.as_deref(), &cli.socket).await {
        error!("Daemon error: {}", e);
        std::process::exit(1);
    }

    Ok(())
}
