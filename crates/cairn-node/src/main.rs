//! Cairn Node - Git smart HTTP server.
//!
//! This is the main entry point for running a Cairn node.

use anyhow::Context;
use cairn_node::api::{create_router, AppState};
use cairn_node::config::NodeConfig;
use cairn_node::observability::{init_logging, LogFormat};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Cairn Node - Git smart HTTP server
#[derive(Parser, Debug)]
#[command(name = "cairn-node")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "cairn.yaml")]
    config: PathBuf,

    /// API listen address
    #[arg(long)]
    api_addr: Option<SocketAddr>,

    /// Data directory (selects the filesystem backend)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Log format (pretty, json)
    #[arg(long)]
    log_format: Option<String>,
}

impl Args {
    /// Command-line flags win over file and environment.
    fn apply(&self, config: &mut NodeConfig) {
        if let Some(addr) = self.api_addr {
            config.api.addr = addr;
        }
        if let Some(dir) = &self.data_dir {
            config.storage.backend = cairn_node::config::StorageBackend::Fs;
            config.storage.data_dir = dir.clone();
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if let Some(format) = &self.log_format {
            config.logging.format = format.clone();
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = NodeConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    args.apply(&mut config);
    validator::Validate::validate(&config).context("invalid configuration")?;

    init_logging(&config.logging.level, LogFormat::parse(&config.logging.format))
        .context("initializing logging")?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting Cairn node");
    tracing::info!(
        api_addr = %config.api.addr,
        backend = ?config.storage.backend,
        data_dir = %config.storage.data_dir.display(),
        "Node configuration"
    );

    let state = AppState::from_config(&config).context("opening storage")?;
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(config.api.addr)
        .await
        .with_context(|| format!("binding {}", config.api.addr))?;
    tracing::info!(addr = %config.api.addr, "Node is ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving HTTP")?;

    tracing::info!("Cairn node stopped");
    Ok(())
}
