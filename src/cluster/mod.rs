//! Cluster coordination
//!
//! Shard/replica topology, shard transfers, write ordering and read
//! consistency, built on pluggable collaborators for storage, bulk copy,
//! consensus and peer RPC.

pub mod admin;
pub mod collaborators;
pub mod health;
pub mod memory;
pub mod persist;
pub mod points;
pub mod read;
pub mod replica;
pub mod store;
pub mod topology;
pub mod transfer;
pub mod write;

pub use admin::{
    AbortTransfer, ClusterAdmin, ClusterInfo, ClusterSetupRequest, DropReplica, LocalShardInfo,
    MoveShard, RemoteShardInfo, SetListener, SetupStatus, ShardTransferInfo,
};
pub use collaborators::{BulkTransfer, Consensus, MetadataChange, PeerTransport, SegmentStorage};
pub use health::{HealthMonitor, PeerHealth};
pub use points::{
    PointId, PointOperation, PointStruct, Record, ScoredPoint, SearchRequest, ShardUpdate,
    Versioned,
};
pub use read::{merge_agreed, ReadConsistency, ReadResolver};
pub use store::TopologyStore;
pub use topology::{
    ClusterTopology, CollectionParams, PeerId, ReplicaSet, ReplicaState, ReplicaStateChange,
    ShardId, ShardTransfer, TopologyMutation, TransferKey,
};
pub use transfer::{ShardTransferOrchestrator, TransferOutcome, TransferProgress};
pub use write::{
    OperationState, UpdateResult, UpdateStatus, WriteCoordinator, WriteOrdering, WriteRequest,
};
