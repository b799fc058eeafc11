//! Standalone development signaling server
//!
//! Run with:
//!   cargo run --bin signaling-server -- --port 8080

use std::time::Duration;

use clap::Parser;
use tracing::Level;

use parley::network::{DevServerConfig, DevSignalingServer};

/// Development signaling server for parley voice matching
#[derive(Parser, Debug)]
#[command(name = "signaling-server")]
#[command(about = "Development signaling server for parley voice matching")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Seconds of silence before an idle client is evicted
    #[arg(long, default_value = "60")]
    idle_timeout: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .init();

    let config = DevServerConfig {
        idle_timeout: Duration::from_secs(args.idle_timeout),
        ..DevServerConfig::default()
    };
    let addr = format!("{}:{}", args.host, args.port);
    let server = DevSignalingServer::bind(&addr, config).await?;
    server.run().await?;

    Ok(())
}
