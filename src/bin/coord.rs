//! Coordinator binary

use clap::{Parser, Subcommand};
use minivec::{cluster::PeerId, Config, Coordinator};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "minivec-coord")]
#[command(about = "minivec cluster coordinator")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start coordinator server
    Serve {
        /// Peer ID of this node
        #[arg(long)]
        peer_id: Option<PeerId>,

        /// Bind address for HTTP
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// Topology database directory (in-memory when omitted)
        #[arg(long)]
        topology_db: Option<PathBuf>,

        /// Peers hosted alongside this one (comma-separated ids)
        #[arg(long, value_delimiter = ',')]
        peers: Vec<PeerId>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            peer_id,
            bind,
            topology_db,
            peers,
        } => {
            // File and environment first, CLI arguments win
            let mut config = Config::load()?;
            if let Some(peer_id) = peer_id {
                config.node.peer_id = peer_id;
            }
            if let Some(bind) = bind {
                config.node.bind_addr = bind;
            }
            if topology_db.is_some() {
                config.node.topology_path = topology_db;
            }
            if !peers.is_empty() {
                config.node.peers = peers;
            }
            config.validate()?;

            Coordinator::new(config).serve().await?;
        }
    }

    Ok(())
}
