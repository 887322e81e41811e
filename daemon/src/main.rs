/// Testmesh dispatch daemon - main entry point
use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use testmesh_daemon::{DaemonConfig, DispatchServer};
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "testmesh-daemon",
    about = "Dispatches test suite executions to remote agents",
    version = env!("CARGO_PKG_VERSION")
)]
struct Args {
    /// Configuration file path
    #[arg(
        short,
        long,
        value_name = "PATH",
        help = "Path to configuration file (TOML)"
    )]
    config: Option<PathBuf>,

    #[arg(long, value_name = "PORT", help = "JSON-RPC HTTP port (default: 8080)")]
    http_port: Option<u16>,

    #[arg(long, value_name = "PORT", help = "Agent WebSocket port (default: 8765)")]
    agent_port: Option<u16>,

    #[arg(long, value_name = "PORT", help = "Event stream WebSocket port (default: 8081)")]
    events_port: Option<u16>,

    /// SQLite database; overrides `storage.sqlite_path`
    #[arg(long, value_name = "PATH")]
    database: Option<PathBuf>,

    /// Log level
    #[arg(
        short,
        long,
        value_name = "LEVEL",
        help = "Log level (trace, debug, info, warn, error)"
    )]
    log_level: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, help = "Enable verbose output")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    let mut config = DaemonConfig::load_or_default(args.config.as_deref())?;

    // Apply CLI overrides
    if let Some(port) = args.http_port {
        config.server.http_port = port;
    }
    if let Some(port) = args.agent_port {
        config.server.agent_port = port;
    }
    if let Some(port) = args.events_port {
        config.server.events_port = port;
    }
    if let Some(path) = args.database {
        config.storage.sqlite_path = Some(path);
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }

    config.validate()?;
    testmesh_core::init_logging(&config.logging, args.verbose)?;

    info!(
        "Starting Testmesh dispatch daemon v{}",
        testmesh_daemon::VERSION
    );
    match &args.config {
        Some(path) => info!("Loaded configuration from: {}", path.display()),
        None => info!("Using default configuration"),
    }
    if config.auth.api_key.is_some() {
        info!("RPC authentication: ENABLED");
    } else {
        info!("RPC authentication: DISABLED");
    }

    let server = DispatchServer::new(config)
        .await
        .context("failed to initialize daemon")?;
    let handle = server.start().await.context("failed to start listeners")?;

    shutdown_signal().await?;
    info!("Shutting down daemon...");
    handle.shutdown().await;

    info!("Testmesh dispatch daemon stopped");
    Ok(())
}

async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .context("failed to install SIGTERM handler")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("failed to install CTRL+C handler")?;
                info!("Received CTRL+C signal");
            }
            _ = terminate.recv() => {
                info!("Received SIGTERM signal");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("failed to install CTRL+C handler")?;
        info!("Received CTRL+C signal");
    }

    Ok(())
}
