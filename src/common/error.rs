//! Error types for minivec

use crate::cluster::{PeerId, ReplicaState, ShardId};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === Topology Errors ===
    #[error("Topology conflict on {collection}: expected revision {expected}, current is {actual}")]
    Conflict {
        collection: String,
        expected: u64,
        actual: u64,
    },

    #[error("Illegal transition of shard {shard_id} on peer {peer_id}: {from} -> {to}")]
    IllegalTransition {
        shard_id: ShardId,
        peer_id: PeerId,
        from: ReplicaState,
        to: ReplicaState,
    },

    #[error("Topology of collection {0} is corrupted, mutations are halted")]
    TopologyCorrupted(String),

    #[error("Collection not found: {0}")]
    CollectionNotFound(String),

    #[error("Collection already exists: {0}")]
    CollectionExists(String),

    #[error("Shard not found: {0}")]
    ShardNotFound(ShardId),

    #[error("No replica of shard {shard_id} on peer {peer_id}")]
    ReplicaNotFound { shard_id: ShardId, peer_id: PeerId },

    #[error("Peer {peer_id} already holds a replica of shard {shard_id}")]
    ReplicaExists { shard_id: ShardId, peer_id: PeerId },

    #[error("Shard {shard_id} would be left without an active or partial replica")]
    LastLiveReplica { shard_id: ShardId },

    // === Transfer Errors ===
    #[error("Shard {shard_id} already has a transfer into peer {to}")]
    TransferInProgress { shard_id: ShardId, to: PeerId },

    #[error("No transfer of shard {shard_id} from {from} to {to}")]
    TransferNotFound {
        shard_id: ShardId,
        from: PeerId,
        to: PeerId,
    },

    #[error("Transfer of shard {shard_id} from {from} to {to} failed: {reason}")]
    TransferFailed {
        shard_id: ShardId,
        from: PeerId,
        to: PeerId,
        reason: String,
    },

    // === Consistency Errors ===
    #[error("Insufficient replicas: need {needed}, have {available}")]
    InsufficientReplicas { needed: usize, available: usize },

    #[error("No reachable leader for shard {0}")]
    LeaderUnavailable(ShardId),

    // === Network Errors ===
    #[error("Peer {peer_id} unreachable: {reason}")]
    PeerUnreachable { peer_id: PeerId, reason: String },

    #[error("Operation timeout: {0}")]
    Timeout(String),

    // === Storage Errors ===
    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // === Request / Config Errors ===
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Can the caller succeed by re-reading the topology or trying again?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Conflict { .. }
                | Error::IllegalTransition { .. }
                | Error::PeerUnreachable { .. }
                | Error::Timeout(_)
        )
    }

    /// Errors that mean a peer did not answer, as opposed to answering "no".
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Error::PeerUnreachable { .. } | Error::Timeout(_))
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Error::CollectionNotFound(_)
            | Error::ShardNotFound(_)
            | Error::ReplicaNotFound { .. }
            | Error::TransferNotFound { .. } => StatusCode::NOT_FOUND,
            Error::Conflict { .. }
            | Error::IllegalTransition { .. }
            | Error::CollectionExists(_)
            | Error::ReplicaExists { .. }
            | Error::TransferInProgress { .. } => StatusCode::CONFLICT,
            Error::BadRequest(_) | Error::InvalidConfig(_) | Error::LastLiveReplica { .. } => {
                StatusCode::BAD_REQUEST
            }
            Error::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            Error::InsufficientReplicas { .. }
            | Error::LeaderUnavailable(_)
            | Error::PeerUnreachable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub(crate) fn poisoned(what: &str) -> Self {
        Error::Internal(format!("{} lock poisoned", what))
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
