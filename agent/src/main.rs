/// Testmesh execution agent - main entry point
use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use testmesh_agent::{Agent, AgentConfig};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "testmesh-agent",
    about = "Runs test suites on behalf of a testmesh daemon",
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

    /// Daemon agent endpoint; overrides the file and TESTMESH_SERVER_URL
    #[arg(long, value_name = "URL")]
    server_url: Option<String>,

    /// Credential token; overrides the file and TESTMESH_AGENT_TOKEN
    #[arg(long, value_name = "TOKEN")]
    token: Option<String>,

    #[arg(long, value_name = "DIR", help = "Work dir for checkouts and workspace files")]
    work_dir: Option<PathBuf>,

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
    let args = Args::parse();

    let mut config = AgentConfig::load_or_default(args.config.as_deref())?;

    // Apply CLI overrides
    if let Some(url) = args.server_url {
        config.server_url = url;
    }
    if let Some(token) = args.token {
        config.token = token;
    }
    if let Some(dir) = args.work_dir {
        config.work_dir = Some(dir);
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }

    config.validate()?;
    testmesh_core::init_logging(&config.logging, args.verbose)?;

    info!("Starting Testmesh agent v{}", testmesh_agent::VERSION);
    info!("Daemon endpoint: {}", config.server_url);

    let agent = Agent::new(config).context("failed to initialize agent")?;
    let shutdown = CancellationToken::new();
    let runner = tokio::spawn(agent.run(shutdown.clone()));

    shutdown_signal().await?;
    info!("Shutting down agent...");
    shutdown.cancel();
    runner.await.context("agent task panicked")??;

    info!("Testmesh agent stopped");
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
