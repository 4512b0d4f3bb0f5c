use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod config;

use chatter_relay::RelayServer;
use config::ChatterConfig;

#[derive(Parser)]
#[command(name = "chatter")]
#[command(version)]
#[command(about = "Chatter — realtime chat relay")]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the relay server
    Start {
        /// Override the configured listening port
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Write the default config to ~/.chatter/config.toml
    Init,

    /// Show the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging; RUST_LOG wins over --debug
    let filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    match cli.command {
        Commands::Init => cmd_init().await,
        Commands::Config => cmd_config(&cli.config).await,
        Commands::Start { port } => cmd_start(&cli.config, port).await,
    }
}

async fn cmd_init() -> Result<()> {
    let config_dir = config::config_dir();
    tokio::fs::create_dir_all(&config_dir)
        .await
        .with_context(|| format!("Failed to create config dir: {}", config_dir.display()))?;

    let config_path = config_dir.join("config.toml");
    if config_path.exists() {
        warn!("Config already exists at {}", config_path.display());
    } else {
        let default_config = include_str!("../../../config/default.toml");
        tokio::fs::write(&config_path, default_config).await?;
        info!("Created default config at {}", config_path.display());
    }

    println!("Chatter initialized at {}", config_dir.display());
    println!("Edit {} to set the port and allowed origins.", config_path.display());
    Ok(())
}

async fn cmd_config(config_path: &Option<PathBuf>) -> Result<()> {
    let cfg = ChatterConfig::load(config_path)?;
    println!("{}", toml::to_string_pretty(&cfg)?);
    Ok(())
}

async fn cmd_start(config_path: &Option<PathBuf>, port: Option<u16>) -> Result<()> {
    let mut cfg = ChatterConfig::load(config_path)?;
    if let Some(port) = port {
        cfg.server.port = port;
    }
    let addr = cfg.socket_addr()?;
    info!(
        "Starting relay (max {} connections, origins: {:?})",
        cfg.relay.max_connections, cfg.server.allowed_origins
    );

    let cancel = CancellationToken::new();
    let server = RelayServer::new(cfg.relay_options(), cancel.clone());
    let mut server_task = tokio::spawn(server.run(addr));

    println!("Chatter relay is running on {}. Press Ctrl+C to stop.", addr);

    // Wait for shutdown signal, or for the server to fail on its own
    tokio::select! {
        result = signal::ctrl_c() => {
            result?;
            info!("Received Ctrl+C, shutting down...");
            cancel.cancel();
            match server_task.await {
                Ok(result) => result?,
                Err(e) => error!("Relay task failed: {}", e),
            }
        }
        result = &mut server_task => {
            result.context("Relay task panicked")??;
        }
    }

    println!("Chatter stopped.");
    Ok(())
}
