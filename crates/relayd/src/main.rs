use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, Level};

use tradewire_net::SignalingRelay;

mod config;

use config::RelayConfig;

#[derive(Parser)]
#[command(name = "tradewire-relayd")]
#[command(about = "TradeWire signaling relay daemon", long_about = None)]
struct Cli {
    /// Address to bind (defaults to all interfaces)
    #[arg(short, long)]
    bind: Option<IpAddr>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Data directory
    #[arg(short, long)]
    data_dir: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, default_value = "info")]
    log_level: Level,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(cli.log_level)
        .with_target(false)
        .init();

    let config = RelayConfig::new(cli.bind, cli.port, cli.data_dir);
    run_daemon(config).await
}

async fn run_daemon(config: RelayConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!("TradeWire signaling relay");
    info!("   bind: {}", config.bind_addr());
    info!("   data: {}", config.data_dir.display());

    let relay = Arc::new(SignalingRelay::new(config.bind_addr()));
    let addr = relay.start().await?;
    info!("relay is up on {}", addr);

    // Periodic directory status.
    let status_relay = Arc::clone(&relay);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        interval.tick().await;
        loop {
            interval.tick().await;
            info!("directory: {} peers registered", status_relay.peer_count().await);
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    relay.shutdown();

    Ok(())
}
