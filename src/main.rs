//! CLI for PopMesh
//!
//! Subcommands:
//! - `server`: run the hub with its client and server listeners
//! - `catchup`: print a channel's history (useful for smoke tests)

use clap::Parser;
use popmesh::client::SocketKind;
use popmesh::config::load_config;
use popmesh::hub::Hub;
use popmesh::persistence::Store;
use popmesh::transport::websocket::{connect_peer, fetch_catchup, start_websocket_server};
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "popmesh")]
enum Command {
    /// Start the hub
    Server,
    /// Fetch and print every message of a channel
    Catchup {
        /// Client endpoint of the server to ask
        #[arg(long, default_value = "ws://127.0.0.1:9000")]
        url: String,
        /// Channel path, e.g. /root/<lao id>
        #[arg(long)]
        channel: String,
    },
}

#[tokio::main]
async fn main() {
    // a missing .env file is fine
    let _ = dotenvy::dotenv();
    let cmd = Command::parse();

    match cmd {
        Command::Server => {
            if let Err(e) = run_server().await {
                error!("Server failed: {}", e);
            }
        }
        Command::Catchup { url, channel } => {
            popmesh::utils::logging::init("warn");
            if let Err(e) = run_catchup(&url, &channel).await {
                error!("Catchup failed: {}", e);
            }
        }
    }
}

async fn run_server() -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config()?;
    popmesh::utils::logging::init(&config.logging.level);

    let store = Store::open(&config.storage.path)?;
    let hub = Hub::new(config.clone(), store)?;
    hub.start();

    let client_addr = format!("{}:{}", config.server.host, config.server.client_port);
    let server_addr = format!("{}:{}", config.server.host, config.server.server_port);
    let clients = tokio::spawn({
        let hub = hub.clone();
        async move { start_websocket_server(&client_addr, hub, SocketKind::Client).await }
    });
    let servers = tokio::spawn({
        let hub = hub.clone();
        async move { start_websocket_server(&server_addr, hub, SocketKind::Server).await }
    });

    for peer in &config.server.peers {
        if let Err(e) = connect_peer(hub.clone(), peer).await {
            warn!(peer = %peer, error = %e, "peer unreachable, waiting for it to dial in");
        }
    }

    tokio::select! {
        result = clients => report_listener("client", result),
        result = servers => report_listener("server", result),
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Exiting gracefully.");
        }
    }

    hub.shutdown().await;
    Ok(())
}

fn report_listener(
    name: &str,
    result: Result<popmesh::utils::Result<()>, tokio::task::JoinError>,
) {
    match result {
        Ok(Ok(())) => error!(listener = name, "listener exited unexpectedly"),
        Ok(Err(e)) => error!(listener = name, error = %e, "listener failed"),
        Err(e) => error!(listener = name, error = %e, "listener task panicked"),
    }
}

async fn run_catchup(url: &str, channel: &str) -> Result<(), Box<dyn std::error::Error>> {
    let messages = fetch_catchup(url, channel).await?;
    for message in &messages {
        println!("{}", serde_json::to_string(message)?);
    }
    info!(channel, count = messages.len(), "catchup done");
    Ok(())
}
