//! Peer failure detection
//!
//! Peers report heartbeats; a periodic sweep declares replicas on peers that
//! went quiet for longer than `heartbeat_timeout` Dead. The last live replica
//! of a shard is never killed this way, it stays in place until an operator
//! or a transfer replaces it.

use crate::cluster::{PeerId, ReplicaState, ShardId, TopologyMutation, TopologyStore};
use crate::common::{Error, HealthConfig, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Health of a peer as seen from this node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerHealth {
    Alive,
    Suspect,
    Dead,
}

impl PeerHealth {
    pub fn is_healthy(&self) -> bool {
        matches!(self, PeerHealth::Alive)
    }
}

pub struct HealthMonitor {
    store: Arc<TopologyStore>,
    config: HealthConfig,
    self_peer: PeerId,
    heartbeats: Mutex<HashMap<PeerId, Instant>>,
}

impl HealthMonitor {
    pub fn new(store: Arc<TopologyStore>, config: HealthConfig, self_peer: PeerId) -> Self {
        Self {
            store,
            config,
            self_peer,
            heartbeats: Mutex::new(HashMap::new()),
        }
    }

    /// Start tracking a peer as if it had just reported
    pub fn register(&self, peer: PeerId) {
        self.record_heartbeat(peer);
    }

    pub fn record_heartbeat(&self, peer: PeerId) {
        if let Ok(mut heartbeats) = self.heartbeats.lock() {
            heartbeats.insert(peer, Instant::now());
        }
    }

    pub fn peer_health(&self, peer: PeerId) -> Option<PeerHealth> {
        if peer == self.self_peer {
            return Some(PeerHealth::Alive);
        }
        let heartbeats = self.heartbeats.lock().ok()?;
        let elapsed = heartbeats.get(&peer)?.elapsed();
        let timeout = self.config.heartbeat_timeout();
        Some(if elapsed > timeout {
            PeerHealth::Dead
        } else if elapsed > timeout / 2 {
            PeerHealth::Suspect
        } else {
            PeerHealth::Alive
        })
    }

    pub fn unreachable_peers(&self) -> Vec<PeerId> {
        let peers: Vec<PeerId> = match self.heartbeats.lock() {
            Ok(heartbeats) => heartbeats.keys().copied().collect(),
            Err(_) => return Vec::new(),
        };
        let mut dead: Vec<PeerId> = peers
            .into_iter()
            .filter(|peer| self.peer_health(*peer) == Some(PeerHealth::Dead))
            .collect();
        dead.sort();
        dead
    }

    /// Mark every replica on unreachable peers Dead; returns how many changed
    pub fn sweep(&self) -> usize {
        self.unreachable_peers()
            .into_iter()
            .map(|peer| mark_peer_dead(&self.store, peer))
            .sum()
    }

    /// Run [`HealthMonitor::sweep`] every `sweep_interval`
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.sweep_interval());
            loop {
                ticker.tick().await;
                let changed = self.sweep();
                if changed > 0 {
                    tracing::warn!("Failure detector marked {} replicas dead", changed);
                }
            }
        })
    }
}

/// Declare one replica Dead.
///
/// Returns `Ok(false)` when the replica is already Dead or Initializing, or
/// when it is the last live copy of its shard.
pub fn mark_replica_dead(
    store: &TopologyStore,
    collection: &str,
    shard_id: ShardId,
    peer_id: PeerId,
) -> Result<bool> {
    let result = store.update_with_retry(collection, |topology| {
        match topology.replica_state(shard_id, peer_id) {
            Some(ReplicaState::Active | ReplicaState::Partial | ReplicaState::Listener) => {
                Ok(vec![TopologyMutation::TransitionReplica {
                    shard_id,
                    peer_id,
                    state: ReplicaState::Dead,
                }])
            }
            _ => Ok(Vec::new()),
        }
    });

    match result {
        Ok(Some(_)) => {
            store.metrics().replicas_deactivated.inc();
            tracing::warn!(
                "Replica of {} shard {} on peer {} marked dead",
                collection,
                shard_id,
                peer_id
            );
            Ok(true)
        }
        Ok(None) => Ok(false),
        Err(Error::LastLiveReplica { .. }) => {
            tracing::warn!(
                "Keeping unreachable replica of {} shard {} on peer {}: it is the last live copy",
                collection,
                shard_id,
                peer_id
            );
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

/// Declare every replica hosted on `peer_id` Dead, across all collections
pub fn mark_peer_dead(store: &TopologyStore, peer_id: PeerId) -> usize {
    let collections = match store.list_collections() {
        Ok(collections) => collections,
        Err(e) => {
            tracing::error!("Cannot list collections: {}", e);
            return 0;
        }
    };

    let mut changed = 0;
    for collection in collections {
        let topology = match store.get_topology(&collection) {
            Ok(topology) => topology,
            Err(e) => {
                tracing::debug!("Skipping {}: {}", collection, e);
                continue;
            }
        };
        for (shard_id, _) in topology.shards_on(peer_id) {
            match mark_replica_dead(store, &collection, shard_id, peer_id) {
                Ok(true) => changed += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!(
                    "Failed to mark {} shard {} on peer {} dead: {}",
                    collection,
                    shard_id,
                    peer_id,
                    e
                ),
            }
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::CollectionParams;
    use crate::common::ClusterMetrics;
    use std::time::Duration;

    fn store_with(placement_peers: &[PeerId], rf: u32) -> Arc<TopologyStore> {
        let store = Arc::new(TopologyStore::in_memory(Arc::new(ClusterMetrics::new())));
        store
            .create_collection(
                "docs",
                CollectionParams {
                    shard_number: 3,
                    replication_factor: rf,
                    write_consistency_factor: 1,
                },
                placement_peers,
            )
            .unwrap();
        store
    }

    #[test]
    fn test_mark_replica_dead_is_idempotent() {
        let store = store_with(&[1, 2], 2);
        assert!(mark_replica_dead(&store, "docs", 0, 2).unwrap());
        assert!(!mark_replica_dead(&store, "docs", 0, 2).unwrap());
        assert_eq!(
            store.get_topology("docs").unwrap().replica_state(0, 2),
            Some(ReplicaState::Dead)
        );
    }

    #[test]
    fn test_last_live_replica_survives() {
        let store = store_with(&[1], 1);
        assert!(!mark_replica_dead(&store, "docs", 0, 1).unwrap());
        assert_eq!(
            store.get_topology("docs").unwrap().replica_state(0, 1),
            Some(ReplicaState::Active)
        );
    }

    #[test]
    fn test_mark_peer_dead_covers_all_shards() {
        let store = store_with(&[1, 2], 2);
        assert_eq!(mark_peer_dead(&store, 2), 3);
        let topology = store.get_topology("docs").unwrap();
        for set in topology.shards.values() {
            assert_eq!(set.live_count(), 1);
        }
    }

    #[tokio::test]
    async fn test_sweep_after_timeout() {
        let store = store_with(&[1, 2], 2);
        let monitor = HealthMonitor::new(
            store.clone(),
            HealthConfig {
                heartbeat_timeout_ms: 20,
                sweep_interval_ms: 5,
            },
            1,
        );
        monitor.register(2);
        assert_eq!(monitor.peer_health(2), Some(PeerHealth::Alive));
        assert_eq!(monitor.sweep(), 0);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(monitor.unreachable_peers(), vec![2]);
        assert_eq!(monitor.sweep(), 3);

        monitor.record_heartbeat(2);
        assert!(monitor.peer_health(2).unwrap().is_healthy());
        assert_eq!(monitor.peer_health(1), Some(PeerHealth::Alive));
    }
}
