use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use relay_broker::config::{FileConfig, Profile, RuntimeConfig, load_config};
use relay_broker::server::BoundServer;

#[derive(Parser)]
#[command(name = "relay-broker")]
#[command(about = "Rendezvous broker that pairs clients and relays bytes between them")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the broker in the foreground
    Serve(ServeArgs),

    /// Print the resolved configuration
    Config(ConfigArgs),
}

#[derive(Parser)]
struct ServeArgs {
    /// TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Configuration preset
    #[arg(long, value_enum)]
    profile: Option<Profile>,

    /// Host to bind to
    #[arg(short = 'b', long)]
    host: Option<String>,

    /// TCP listener port
    #[arg(short, long)]
    port: Option<u16>,

    /// WebSocket listener port
    #[arg(long)]
    ws_port: Option<u16>,

    /// Disable the WebSocket listener
    #[arg(long)]
    no_ws: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Parser)]
struct ConfigArgs {
    /// TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Configuration preset
    #[arg(long, value_enum)]
    profile: Option<Profile>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Serve(args) => serve(args).await,
        Commands::Config(args) => print_config(args),
    }
}

fn resolve_config(config: Option<&PathBuf>, profile: Option<&Profile>) -> Result<FileConfig> {
    load_config(config.map(PathBuf::as_path), profile)
        .extract()
        .context("failed to load configuration")
}

async fn serve(args: ServeArgs) -> Result<()> {
    let default_directive = if args.debug {
        "relay_broker=debug,tower_http=debug,info"
    } else {
        "relay_broker=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    let mut fc = resolve_config(args.config.as_ref(), args.profile.as_ref())?;
    if let Some(host) = args.host {
        fc.server.host = host;
    }
    if let Some(port) = args.port {
        fc.server.port = port;
    }
    if let Some(ws_port) = args.ws_port {
        fc.server.ws_port = ws_port;
    }
    if args.no_ws {
        fc.server.ws_enabled = false;
    }
    fc.validate()?;

    let config = RuntimeConfig::from_file(&fc);
    let server = BoundServer::bind(&config).await?;
    info!("Starting relay broker");

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            return;
        }
        info!("Received shutdown signal, closing connections...");
        signal.cancel();
    });

    server.run(shutdown).await
}

fn print_config(args: ConfigArgs) -> Result<()> {
    let fc = resolve_config(args.config.as_ref(), args.profile.as_ref())?;
    fc.validate()?;
    print!("{}", toml::to_string_pretty(&fc)?);
    Ok(())
}
