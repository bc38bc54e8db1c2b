//! eter peer from the terminal
//!
//! Usage:
//!   eter connect --code <id> [--server <id>] [--host <host>] [--port <port>]
//!   eter ice
//!   eter config

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use eter_config::{get_config_path, Config};
use eter_p2p::{
    AppMessage, CoordinatorConfig, CoordinatorEvent, IceConfig, IceConfigClient, PeerCoordinator,
    PeerJsSessionFactory, SessionFactory,
};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "eter")]
#[command(about = "Peer-to-peer sessions with direct, TURN and relayed links", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register under a code and exchange chat lines with peers
    Connect {
        /// Our code on the signaling server
        #[arg(long)]
        code: String,
        /// Peer to connect to once registered
        #[arg(long)]
        server: Option<String>,
        /// Signaling host (overrides config)
        #[arg(long)]
        host: Option<String>,
        /// Signaling port (overrides config)
        #[arg(long)]
        port: Option<u16>,
        /// Use ws:// instead of wss://
        #[arg(long)]
        insecure: bool,
        /// Reach the server peer through the signaling relay only
        #[arg(long)]
        force_websocket: bool,
        /// Only use TURN-relayed ICE candidates
        #[arg(long)]
        force_turn: bool,
    },
    /// Fetch and print the ICE configuration
    Ice,
    /// Show config file path and contents
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("eter=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Connect {
            code,
            server,
            host,
            port,
            insecure,
            force_websocket,
            force_turn,
        } => {
            let mut config = Config::load().context("Failed to load config")?;
            if let Some(host) = host {
                config.signaling.host = host;
            }
            if let Some(port) = port {
                config.signaling.port = port;
            }
            if insecure {
                config.signaling.secure = false;
            }
            if server.is_some() {
                config.peer.server = server;
            }
            config.peer.force_websocket |= force_websocket;
            config.peer.force_turn |= force_turn;

            let ice = fetch_ice(&config).await?;
            let coordinator_config = config.coordinator_config(&code, ice);
            run_peer(coordinator_config).await?;
        }
        Commands::Ice => {
            let config = Config::load_or_default();
            let ice = match fetch_ice(&config).await? {
                Some(ice) => ice,
                None => config.ice.static_config(),
            };
            println!("{}", serde_json::to_string_pretty(&ice)?);
        }
        Commands::Config => {
            let path = get_config_path();
            println!("Config: {}", path.display());
            let config = Config::load().context("Failed to load config")?;
            println!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

/// Fetched relay configuration when an rtcconfig API is configured
async fn fetch_ice(config: &Config) -> Result<Option<IceConfig>> {
    let Some(api) = config.ice.api.as_deref() else {
        return Ok(None);
    };
    let client = IceConfigClient::new(api, config.ice.app_name.clone())
        .context("Failed to build ICE config client")?;
    info!("Fetching ICE configuration from {}", client.url());
    Ok(Some(client.fetch().await))
}

fn session_factory(config: &CoordinatorConfig) -> Arc<dyn SessionFactory> {
    #[cfg(feature = "webrtc")]
    {
        let servers = config.ice.ice_servers.iter().take(1).cloned().collect();
        let channels = Arc::new(eter_p2p::RtcChannelFactory::new(
            servers,
            config.relay_only(),
        ));
        Arc::new(PeerJsSessionFactory::with_channels(channels))
    }
    #[cfg(not(feature = "webrtc"))]
    {
        let _ = config;
        Arc::new(PeerJsSessionFactory::new())
    }
}

async fn run_peer(config: CoordinatorConfig) -> Result<()> {
    let factory = session_factory(&config);
    let coordinator = PeerCoordinator::new(config, factory);
    let mut events = coordinator.subscribe();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    info!("Registering as {}", coordinator.code());

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                print_event(&event);
            }
            line = lines.next_line(), if stdin_open => {
                match line.context("Failed to read stdin")? {
                    Some(line) if !line.trim().is_empty() => {
                        coordinator.send_all(&AppMessage::new("chat").with("text", line), &[]);
                    }
                    Some(_) => {}
                    None => stdin_open = false,
                }
            }
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!("Failed to listen for Ctrl-C: {}", e);
                }
                break;
            }
        }
    }

    coordinator.destroy();
    info!("Peer destroyed");
    Ok(())
}

fn print_event(event: &CoordinatorEvent) {
    match event {
        CoordinatorEvent::Open => println!("* registered"),
        CoordinatorEvent::Status(status) => println!("* status {}", status),
        CoordinatorEvent::Quality(quality) => println!("* quality {}", quality),
        CoordinatorEvent::Error(kind) => println!("! error {}", kind),
        CoordinatorEvent::Connect { peer, connection } => {
            println!("+ {} ({})", peer, connection.connection_type())
        }
        CoordinatorEvent::Close { peer } => println!("- {}", peer),
        CoordinatorEvent::Data { peer, message } => {
            match (message.event.as_str(), message.get("text").and_then(|v| v.as_str())) {
                ("chat", Some(text)) => println!("<{}> {}", peer, text),
                _ => match serde_json::to_string(message) {
                    Ok(json) => println!("<{}> {}", peer, json),
                    Err(e) => warn!("Unprintable message from {}: {}", peer, e),
                },
            }
        }
    }
}
