use clap::Parser;
use log::{error, info};
use server::network::Server;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// UDP port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Maximum number of simultaneous connections
    #[arg(short, long, default_value = "64")]
    max_clients: usize,

    /// Token lifetime in seconds
    #[arg(short, long, default_value = "3600")]
    token_ttl: u64,

    /// Channel pattern tokens are scoped to: `*`, an exact name, or `prefix*`
    #[arg(short, long, default_value = "*")]
    capability: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let address = format!("{}:{}", args.host, args.port);

    info!("Starting relay on {}", address);
    info!(
        "Max connections: {}, token TTL: {}s, capability: {}",
        args.max_clients, args.token_ttl, args.capability
    );

    let mut server = Server::new(
        &address,
        args.max_clients,
        &args.capability,
        Duration::from_secs(args.token_ttl),
    )
    .await?;

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Relay stopped with error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
