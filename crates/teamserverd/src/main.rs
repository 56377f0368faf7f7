//! teamserverd: C2 teamserver daemon.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use teamserver_core::TeamServerConfig;
use teamserverd::TeamServer;

#[derive(Debug, Parser)]
#[command(name = "teamserverd", version, about = "C2 teamserver daemon")]
struct Cli {
    /// Address to listen on for agents and the status API.
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on.
    #[arg(long)]
    port: Option<u16>,

    /// Config file (default: $TEAMSERVER_CONFIG or ~/.config/teamserver/config.toml).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run the event bus without Noise authentication and encryption.
    #[arg(long)]
    insecure_bus: bool,

    /// Emit logs as JSON lines.
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if cli.json_logs {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    // Load config
    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => TeamServerConfig::file_path(),
    };
    if let Err(e) = TeamServerConfig::write_default_to(&config_path) {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let mut config = TeamServerConfig::load_from(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if cli.insecure_bus {
        config.bus.secure = false;
    }

    report_system(&config);

    let mut server = TeamServer::start(config).await?;

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for shutdown signal")?;
            tracing::info!("shutdown signal received");
            server.stop().await
        }
        failed = server.wait() => failed,
    }
}

fn report_system(config: &TeamServerConfig) {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    tracing::info!(
        os = std::env::consts::OS,
        arch = std::env::consts::ARCH,
        cores,
        suite = %config.server.cipher_suite,
        bus_secure = config.bus.secure,
        "teamserverd starting"
    );
    if !config.bus.secure {
        tracing::warn!("event bus security disabled; bus traffic is unauthenticated and unencrypted");
    }
}
