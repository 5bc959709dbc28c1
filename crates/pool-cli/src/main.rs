use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use pool_config::PoolConfig;
use pool_metrics::{LoggingAlertSink, NoopMetrics};
use pool_protocol::TcpControlClient;
use pool_supervisor::PoolSupervisor;

#[derive(Debug, Parser)]
#[command(name = "relaypool", version, about = "Proxy pool supervisor")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Initialize the pool from the environment and block until Ctrl-C / SIGTERM.
    Run,
    /// Initialize the pool, print a status snapshot, then shut down.
    Status,
    /// Initialize the pool, rotate one node (or every node), then shut down.
    Rotate {
        #[arg(long)]
        node: Option<String>,
    },
    /// Initialize the pool at the configured size, scale to `size`, then shut down.
    Scale { size: u32 },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = PoolConfig::from_env()?;
    config.validate()?;

    let cli = Cli::parse();
    match cli.command {
        Commands::Run => run(config).await,
        Commands::Status => status(config).await,
        Commands::Rotate { node } => rotate(config, node).await,
        Commands::Scale { size } => scale(config, size).await,
    }
}

async fn build_supervisor(config: PoolConfig) -> Result<PoolSupervisor> {
    let (supervisor, results) = PoolSupervisor::initialize(
        config,
        Arc::new(TcpControlClient),
        Arc::new(NoopMetrics::default()),
        Arc::new(LoggingAlertSink::default()),
    )
    .await?;

    for slot in &results {
        match &slot.result {
            Ok(()) => tracing::info!(node_id = %slot.node_id, "relay started"),
            Err(err) => tracing::warn!(node_id = %slot.node_id, error = %err, "relay failed to start"),
        }
    }

    Ok(supervisor)
}

async fn run(config: PoolConfig) -> Result<()> {
    let supervisor = build_supervisor(config).await?;

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        tokio::select! {
            _ = sigterm.recv() => {},
            _ = sigint.recv() => {},
        }
        Ok::<(), anyhow::Error>(())
    };

    #[cfg(not(unix))]
    let terminate = async {
        tokio::signal::ctrl_c().await?;
        Ok::<(), anyhow::Error>(())
    };

    terminate.await?;
    tracing::info!("shutting down pool");
    supervisor.shutdown().await;
    Ok(())
}

async fn status(config: PoolConfig) -> Result<()> {
    let supervisor = build_supervisor(config).await?;
    for snapshot in supervisor.status_all().await {
        println!(
            "{:<12} status={:?} healthy={} socks={} ctrl={} failed_checks={} rotations={}",
            snapshot.node_id,
            snapshot.status,
            snapshot.is_healthy,
            snapshot.socks_port,
            snapshot.control_port,
            snapshot.failed_checks,
            snapshot.rotation_count,
        );
    }
    supervisor.shutdown().await;
    Ok(())
}

async fn rotate(config: PoolConfig, node: Option<String>) -> Result<()> {
    let supervisor = build_supervisor(config).await?;
    match node {
        Some(node_id) => supervisor.rotate_node(&node_id).await?,
        None => {
            for slot in supervisor.rotate_all().await {
                match slot.result {
                    Ok(()) => println!("{}: rotated", slot.node_id),
                    Err(err) => println!("{}: {err}", slot.node_id),
                }
            }
        }
    }
    supervisor.shutdown().await;
    Ok(())
}

async fn scale(config: PoolConfig, size: u32) -> Result<()> {
    let supervisor = build_supervisor(config).await?;
    let results = supervisor.scale(size).await?;
    for slot in &results {
        match &slot.result {
            Ok(()) => println!("{}: ok", slot.node_id),
            Err(err) => println!("{}: {err}", slot.node_id),
        }
    }
    supervisor.shutdown().await;
    Ok(())
}
