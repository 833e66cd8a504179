//! Atelier relay: WebSocket fan-out for canvas rooms.
//!
//! Peers connect to `ws://<addr>/<room>`; every binary message is relayed to
//! the other peers of the same room. The relay holds no document state.

use atelier_collab::{RelayServer, ServerConfig};
use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "atelier-relay", about = "WebSocket relay for Atelier canvas rooms")]
struct Cli {
    /// Address to listen on.
    #[arg(long, env = "ATELIER_RELAY_ADDR", default_value = "127.0.0.1:9090")]
    bind_addr: String,

    /// Peers allowed per room (0 = unlimited).
    #[arg(long, env = "ATELIER_MAX_PEERS", default_value_t = 100)]
    max_peers: usize,

    /// Frames buffered per peer before a slow peer starts skipping.
    #[arg(long, env = "ATELIER_BROADCAST_CAPACITY", default_value_t = 256)]
    broadcast_capacity: usize,
}

impl From<Cli> for ServerConfig {
    fn from(cli: Cli) -> Self {
        ServerConfig {
            bind_addr: cli.bind_addr,
            max_peers_per_room: cli.max_peers,
            broadcast_capacity: cli.broadcast_capacity,
        }
    }
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let server = RelayServer::new(Cli::parse().into());
    if let Err(e) = server.run().await {
        log::error!("Relay stopped: {e}");
        std::process::exit(1);
    }
}
