//! Coordinator server

use crate::cluster::PeerId;
use crate::common::{Config, Result};
use crate::coordinator::http::{create_router, AppState};
use crate::coordinator::node::LocalCluster;
use std::sync::Arc;
use std::time::Duration;

pub struct Coordinator {
    config: Config,
}

impl Coordinator {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub async fn serve(self) -> Result<()> {
        let peer_id = self.config.node.peer_id;
        tracing::info!("Starting coordinator for peer {}", peer_id);
        tracing::info!("  HTTP API: {}", self.config.node.bind_addr);
        match &self.config.node.topology_path {
            Some(path) => tracing::info!("  Topology DB: {}", path.display()),
            None => tracing::info!("  Topology DB: in-memory"),
        }
        tracing::info!("  Peers: {:?}", self.config.node.all_peers());

        let cluster = Arc::new(LocalCluster::new(&self.config)?);
        let node = cluster.node(peer_id)?;

        // Transfers recorded before a restart have lost their copy task
        for collection in cluster.store.list_collections()? {
            match node.orchestrator().resume_transfers(&collection) {
                Ok(0) => {}
                Ok(n) => tracing::info!("Resumed {} transfers of {}", n, collection),
                Err(e) => tracing::warn!("Cannot resume transfers of {}: {}", collection, e),
            }
        }

        for peer in cluster.peers() {
            node.health.register(peer);
        }
        let _health_handle = node.health.clone().start();
        let _heartbeat_handle = start_loopback_heartbeats(
            cluster.clone(),
            peer_id,
            self.config.health.sweep_interval(),
        );

        let router = create_router(AppState {
            cluster: cluster.clone(),
            peer_id,
        });
        let listener = tokio::net::TcpListener::bind(self.config.node.bind_addr).await?;

        tracing::info!("✓ Coordinator ready");

        axum::serve(listener, router)
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("Shutting down");
            })
            .await?;
        Ok(())
    }
}

/// Record a heartbeat for every in-process peer the loopback network can reach
fn start_loopback_heartbeats(
    cluster: Arc<LocalCluster>,
    peer_id: PeerId,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let Ok(node) = cluster.node(peer_id) else {
            return;
        };
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            for peer in cluster.peers() {
                if cluster.network.is_reachable(peer) {
                    node.health.record_heartbeat(peer);
                }
            }
        }
    })
}
