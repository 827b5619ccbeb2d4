//! Coordinator process
//!
//! Wires the cluster components of every in-process peer together and
//! serves them over HTTP.

pub mod http;
pub mod node;
pub mod server;

pub use node::{ClusterNode, LocalCluster};
pub use server::Coordinator;
