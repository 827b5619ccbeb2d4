//! # minivec
//!
//! Cluster coordination for a sharded, replicated vector-search database:
//! - Versioned shard/replica topology with optimistic compare-and-swap
//! - Replica lifecycle (Initializing, Active, Partial, Dead, Listener)
//! - Shard moves, replications, aborts and replica drops
//! - Write ordering guarantees (weak, medium, strong)
//! - Read consistency levels (factor, majority, quorum, all)
//!
//! ## Architecture
//!
//! | Layer | Module | Role |
//! |-------|--------|------|
//! | Topology | [`cluster::store`] | Revisioned layout per collection, RocksDB-backed |
//! | Transfers | [`cluster::transfer`] | Copies shards between peers in the background |
//! | Writes | [`cluster::write`] | Assigns operation ids and replicates updates |
//! | Reads | [`cluster::read`] | Fans out to replicas and merges by version |
//! | API | [`coordinator`] | HTTP admin and data API |
//!
//! ## Usage
//!
//! ```bash
//! minivec-coord serve \
//!   --peer-id 1 \
//!   --bind 0.0.0.0:6333 \
//!   --topology-db ./topology \
//!   --peers 2,3
//! ```

#![allow(clippy::result_large_err)]

pub mod cluster;
pub mod common;
pub mod coordinator;

// Re-export commonly used types
pub use common::{Config, Error, Result};
pub use coordinator::Coordinator;

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
