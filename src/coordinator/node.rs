//! Node wiring
//!
//! A [`ClusterNode`] bundles everything one peer runs. [`LocalCluster`]
//! hosts several peers in one process, sharing a topology store, a loopback
//! network and an in-memory consensus.

use crate::cluster::memory::{LocalConsensus, LocalNetwork, MemorySegments};
use crate::cluster::{
    ClusterAdmin, HealthMonitor, PeerId, ReadResolver, ShardTransferOrchestrator, TopologyStore,
    WriteCoordinator,
};
use crate::common::{ClusterMetrics, Config, Error, Result};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Entries per bulk-transfer chunk
pub const DEFAULT_CHUNK_SIZE: usize = 256;

pub struct ClusterNode {
    pub peer_id: PeerId,
    pub store: Arc<TopologyStore>,
    pub storage: Arc<MemorySegments>,
    pub writer: Arc<WriteCoordinator>,
    pub reader: Arc<ReadResolver>,
    pub admin: Arc<ClusterAdmin>,
    pub health: Arc<HealthMonitor>,
}

impl ClusterNode {
    pub fn orchestrator(&self) -> &ShardTransferOrchestrator {
        self.admin.orchestrator()
    }
}

pub struct LocalCluster {
    pub store: Arc<TopologyStore>,
    pub network: Arc<LocalNetwork>,
    pub consensus: Arc<LocalConsensus>,
    pub metrics: Arc<ClusterMetrics>,
    nodes: BTreeMap<PeerId, ClusterNode>,
}

impl LocalCluster {
    /// Build every peer of `config.node.all_peers()`, opening the durable
    /// topology store when a path is configured
    pub fn new(config: &Config) -> Result<Self> {
        let metrics = Arc::new(ClusterMetrics::new());
        let store = match &config.node.topology_path {
            Some(path) => Arc::new(TopologyStore::open(path, metrics.clone())?),
            None => Arc::new(TopologyStore::in_memory(metrics.clone())),
        };
        Self::with_parts(
            config,
            store,
            Arc::new(LocalNetwork::new(DEFAULT_CHUNK_SIZE)),
            metrics,
        )
    }

    pub fn with_parts(
        config: &Config,
        store: Arc<TopologyStore>,
        network: Arc<LocalNetwork>,
        metrics: Arc<ClusterMetrics>,
    ) -> Result<Self> {
        let peers = config.node.all_peers();
        let consensus = Arc::new(LocalConsensus::new());

        let mut nodes = BTreeMap::new();
        for &peer_id in &peers {
            let storage = Arc::new(MemorySegments::new());
            network.register(peer_id, storage.clone());

            let writer = Arc::new(WriteCoordinator::new(
                peer_id,
                store.clone(),
                storage.clone(),
                network.clone(),
                consensus.clone(),
                config.consistency.clone(),
            ));
            network.attach_writer(peer_id, &writer);

            let reader = Arc::new(ReadResolver::new(
                peer_id,
                store.clone(),
                storage.clone(),
                network.clone(),
                config.consistency.clone(),
            ));
            let orchestrator =
                ShardTransferOrchestrator::new(store.clone(), network.clone(), config.transfer.clone());
            let admin = Arc::new(ClusterAdmin::new(
                peer_id,
                peers.clone(),
                store.clone(),
                orchestrator,
                consensus.clone(),
                storage.clone(),
            ));
            let health = Arc::new(HealthMonitor::new(
                store.clone(),
                config.health.clone(),
                peer_id,
            ));

            nodes.insert(
                peer_id,
                ClusterNode {
                    peer_id,
                    store: store.clone(),
                    storage,
                    writer,
                    reader,
                    admin,
                    health,
                },
            );
        }

        tracing::info!("Local cluster with peers {:?}", peers);
        Ok(Self {
            store,
            network,
            consensus,
            metrics,
            nodes,
        })
    }

    pub fn node(&self, peer_id: PeerId) -> Result<&ClusterNode> {
        self.nodes.get(&peer_id).ok_or_else(|| Error::PeerUnreachable {
            peer_id,
            reason: "not part of this cluster".into(),
        })
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.nodes.keys().copied().collect()
    }
}
