//! Services the coordination core consumes but does not implement.
//!
//! Segment storage, bulk shard copy, consensus and peer RPC are provided by
//! the embedding node. [`crate::cluster::memory`] has in-process versions.

use crate::cluster::{
    ClusterSetupRequest, CollectionParams, PeerId, PointId, Record, ScoredPoint, SearchRequest,
    ShardId, ShardTransfer, ShardUpdate, WriteOrdering,
};
use crate::common::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Local vector/payload storage of the shards hosted on this peer
#[async_trait]
pub trait SegmentStorage: Send + Sync {
    /// Apply an update. Updates not newer than a point's stored version are discarded.
    async fn apply(&self, collection: &str, shard_id: ShardId, update: &ShardUpdate) -> Result<()>;

    async fn retrieve(
        &self,
        collection: &str,
        shard_id: ShardId,
        ids: &[PointId],
    ) -> Result<Vec<Record>>;

    async fn search(
        &self,
        collection: &str,
        shard_id: ShardId,
        request: &SearchRequest,
    ) -> Result<Vec<ScoredPoint>>;

    async fn count(&self, collection: &str, shard_id: ShardId) -> Result<usize>;
}

/// Streams shard contents between peers in chunks
#[async_trait]
pub trait BulkTransfer: Send + Sync {
    /// Prepare a transfer, returning the number of chunks to copy
    async fn start(&self, collection: &str, transfer: &ShardTransfer) -> Result<u64>;

    /// Copy one chunk; may fail transiently
    async fn copy_chunk(&self, collection: &str, transfer: &ShardTransfer, chunk: u64)
        -> Result<()>;

    /// Release whatever `start` prepared
    async fn cancel(&self, collection: &str, transfer: &ShardTransfer) -> Result<()>;
}

/// Metadata change agreed through consensus before it is executed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataChange {
    CreateCollection {
        collection: String,
        params: CollectionParams,
    },
    DropCollection {
        collection: String,
    },
    ClusterSetup {
        collection: String,
        request: ClusterSetupRequest,
    },
}

/// Leader election and durable metadata agreement
#[async_trait]
pub trait Consensus: Send + Sync {
    /// The durable, externally elected leader of a shard
    async fn current_leader(&self, collection: &str, shard_id: ShardId) -> Result<Option<PeerId>>;

    /// Pick a transient leader among `candidates`
    async fn elect(
        &self,
        collection: &str,
        shard_id: ShardId,
        candidates: &[PeerId],
    ) -> Result<PeerId>;

    async fn propose(&self, change: MetadataChange) -> Result<()>;
}

/// RPC to other peers
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Apply an update on `peer`'s replica
    async fn apply_update(
        &self,
        peer: PeerId,
        collection: &str,
        shard_id: ShardId,
        update: &ShardUpdate,
    ) -> Result<()>;

    /// Hand an update to the shard leader, which orders and propagates it
    async fn forward_to_leader(
        &self,
        leader: PeerId,
        collection: &str,
        shard_id: ShardId,
        update: &ShardUpdate,
        ordering: WriteOrdering,
    ) -> Result<()>;

    async fn retrieve(
        &self,
        peer: PeerId,
        collection: &str,
        shard_id: ShardId,
        ids: &[PointId],
    ) -> Result<Vec<Record>>;

    async fn search(
        &self,
        peer: PeerId,
        collection: &str,
        shard_id: ShardId,
        request: &SearchRequest,
    ) -> Result<Vec<ScoredPoint>>;
}
