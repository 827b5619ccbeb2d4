//! Cluster setup requests and topology introspection
//!
//! Every administrative change is proposed to consensus first, then executed
//! by the transfer orchestrator. Callers may bound how long they wait for a
//! transfer; past that they get [`SetupStatus::InProgress`] while the work
//! continues.

use crate::cluster::{
    CollectionParams, Consensus, MetadataChange, PeerId, ReplicaState, SegmentStorage, ShardId,
    ShardTransferOrchestrator, TopologyStore, TransferOutcome, TransferProgress,
};
use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveShard {
    pub shard_id: ShardId,
    pub from_peer_id: PeerId,
    pub to_peer_id: PeerId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbortTransfer {
    pub shard_id: ShardId,
    pub from_peer_id: PeerId,
    pub to_peer_id: PeerId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DropReplica {
    pub shard_id: ShardId,
    pub peer_id: PeerId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetListener {
    pub shard_id: ShardId,
    pub peer_id: PeerId,
    pub listener: bool,
}

/// Exactly one cluster-setup action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterSetupRequest {
    MoveShard(MoveShard),
    ReplicateShard(MoveShard),
    AbortTransfer(AbortTransfer),
    DropReplica(DropReplica),
    SetListener(SetListener),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SetupStatus {
    Completed,
    /// Accepted; a transfer is still copying data
    InProgress,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalShardInfo {
    pub shard_id: ShardId,
    pub points_count: usize,
    pub state: ReplicaState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteShardInfo {
    pub shard_id: ShardId,
    pub peer_id: PeerId,
    pub state: ReplicaState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardTransferInfo {
    pub shard_id: ShardId,
    pub from: PeerId,
    pub to: PeerId,
    pub sync: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<TransferProgress>,
}

/// Collection layout as seen from one peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterInfo {
    pub peer_id: PeerId,
    pub revision: u64,
    pub shard_count: usize,
    pub local_shards: Vec<LocalShardInfo>,
    pub remote_shards: Vec<RemoteShardInfo>,
    pub shard_transfers: Vec<ShardTransferInfo>,
}

pub struct ClusterAdmin {
    peer_id: PeerId,
    peers: Vec<PeerId>,
    store: Arc<TopologyStore>,
    orchestrator: ShardTransferOrchestrator,
    consensus: Arc<dyn Consensus>,
    storage: Arc<dyn SegmentStorage>,
}

impl ClusterAdmin {
    pub fn new(
        peer_id: PeerId,
        peers: Vec<PeerId>,
        store: Arc<TopologyStore>,
        orchestrator: ShardTransferOrchestrator,
        consensus: Arc<dyn Consensus>,
        storage: Arc<dyn SegmentStorage>,
    ) -> Self {
        Self {
            peer_id,
            peers,
            store,
            orchestrator,
            consensus,
            storage,
        }
    }

    pub fn orchestrator(&self) -> &ShardTransferOrchestrator {
        &self.orchestrator
    }

    pub async fn create_collection(&self, name: &str, params: CollectionParams) -> Result<()> {
        params.validate()?;
        self.consensus
            .propose(MetadataChange::CreateCollection {
                collection: name.to_string(),
                params,
            })
            .await?;
        self.store.create_collection(name, params, &self.peers)?;
        Ok(())
    }

    pub async fn drop_collection(&self, name: &str) -> Result<()> {
        self.store.get_topology(name)?;
        self.consensus
            .propose(MetadataChange::DropCollection {
                collection: name.to_string(),
            })
            .await?;
        self.store.drop_collection(name)
    }

    /// Propose and run a cluster-setup request.
    ///
    /// `wait` bounds how long a started transfer is awaited; `None` returns
    /// as soon as it is running.
    pub async fn submit(
        &self,
        collection: &str,
        request: ClusterSetupRequest,
        wait: Option<Duration>,
    ) -> Result<SetupStatus> {
        self.store.get_topology(collection)?;
        self.consensus
            .propose(MetadataChange::ClusterSetup {
                collection: collection.to_string(),
                request: request.clone(),
            })
            .await?;

        let Some(key) = self.orchestrator.execute(collection, &request).await? else {
            return Ok(SetupStatus::Completed);
        };
        let Some(timeout) = wait else {
            return Ok(SetupStatus::InProgress);
        };

        let failed = |reason: String| Error::TransferFailed {
            shard_id: key.shard_id,
            from: key.from,
            to: key.to,
            reason,
        };
        match self.orchestrator.wait_transfer(collection, key, timeout).await? {
            None => Ok(SetupStatus::InProgress),
            Some(TransferOutcome::Completed) => Ok(SetupStatus::Completed),
            Some(TransferOutcome::Failed(reason)) => Err(failed(reason)),
            Some(TransferOutcome::Aborted) => Err(failed("aborted".into())),
        }
    }

    pub async fn cluster_info(&self, collection: &str) -> Result<ClusterInfo> {
        let topology = self.store.get_topology(collection)?;

        let mut local_shards = Vec::new();
        for (shard_id, state) in topology.shards_on(self.peer_id) {
            local_shards.push(LocalShardInfo {
                shard_id,
                points_count: self.storage.count(collection, shard_id).await?,
                state,
            });
        }

        let remote_shards = topology
            .shards
            .iter()
            .flat_map(|(shard_id, replicas)| {
                replicas
                    .iter()
                    .filter(|(peer_id, _)| *peer_id != self.peer_id)
                    .map(|(peer_id, state)| RemoteShardInfo {
                        shard_id: *shard_id,
                        peer_id,
                        state,
                    })
            })
            .collect();

        let shard_transfers = topology
            .transfers
            .iter()
            .map(|t| ShardTransferInfo {
                shard_id: t.shard_id,
                from: t.from,
                to: t.to,
                sync: t.sync,
                progress: self.orchestrator.transfer_progress(collection, t.key()).ok(),
            })
            .collect();

        Ok(ClusterInfo {
            peer_id: self.peer_id,
            revision: topology.revision,
            shard_count: topology.shards.len(),
            local_shards,
            remote_shards,
            shard_transfers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_carries_one_action() {
        let request: ClusterSetupRequest = serde_json::from_str(
            r#"{"move_shard": {"shard_id": 0, "from_peer_id": 1, "to_peer_id": 2}}"#,
        )
        .unwrap();
        assert_eq!(
            request,
            ClusterSetupRequest::MoveShard(MoveShard {
                shard_id: 0,
                from_peer_id: 1,
                to_peer_id: 2
            })
        );

        let request: ClusterSetupRequest =
            serde_json::from_str(r#"{"drop_replica": {"shard_id": 3, "peer_id": 7}}"#).unwrap();
        assert!(matches!(
            request,
            ClusterSetupRequest::DropReplica(DropReplica {
                shard_id: 3,
                peer_id: 7
            })
        ));

        // Two actions in one request are rejected
        let both = serde_json::from_str::<ClusterSetupRequest>(
            r#"{"drop_replica": {"shard_id": 3, "peer_id": 7},
                "abort_transfer": {"shard_id": 0, "from_peer_id": 1, "to_peer_id": 2}}"#,
        );
        assert!(both.is_err());
    }

    #[test]
    fn test_setup_status_json() {
        assert_eq!(
            serde_json::to_string(&SetupStatus::InProgress).unwrap(),
            "\"in_progress\""
        );
    }
}
