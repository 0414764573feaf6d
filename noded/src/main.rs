use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use log::LevelFilter;
use simple_logger::SimpleLogger;

use net::{Node, NodeConfig};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Address to listen on for incoming peer connections.
    #[arg(short, long, default_value = "0.0.0.0:8444")]
    listen: SocketAddr,

    /// Path to the sled database file backing the object store.
    #[arg(short, long, default_value = "noded.sled")]
    store: String,

    /// Seed peers to dial on startup, e.g. --peer 203.0.113.5:8444.
    #[arg(short, long = "peer")]
    peers: Vec<SocketAddr>,

    /// Proof-of-work target this node enforces on objects it relays.
    #[arg(long, default_value_t = u64::MAX / 1_000)]
    pow_target: u64,

    /// User agent string advertised in this node's `version` message.
    #[arg(long, default_value = "/noded:1.0/")]
    user_agent: String,
}

fn init_logging() {
    SimpleLogger::new()
        .with_colors(true)
        .with_level(LevelFilter::Info)
        .with_local_timestamps()
        .init()
        .unwrap();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let args = Args::parse();

    let node = Arc::new(Node::new(NodeConfig {
        listen_addr: args.listen,
        store_path: args.store,
        user_agent: args.user_agent,
        pow_target: args.pow_target,
    })?);

    log::info!("node nonce: {}", node.nonce());
    let bound_addr = node.start().await?;
    log::info!("bound to {}", bound_addr);

    for peer in args.peers {
        let node = Arc::clone(&node);
        tokio::spawn(async move {
            log::info!("dialing seed peer {}", peer);
            if let Err(err) = node.connect(peer).await {
                log::warn!("connection to seed peer {} ended: {}", peer, err);
            }
        });
    }

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            log::info!("shutting down");
        }
        result = node.serve_result() => {
            if let Err(err) = result {
                log::error!("listener failed, shutting down: {}", err);
            }
        }
    }
    node.shutdown().await;

    Ok(())
}
