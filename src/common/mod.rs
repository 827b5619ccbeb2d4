//! Common utilities and types shared across minivec

pub mod config;
pub mod error;
pub mod hash;
pub mod metrics;
pub mod utils;

pub use config::{Config, ConsistencyConfig, HealthConfig, NodeConfig, TransferConfig};
pub use error::{Error, Result};
pub use hash::{hrw_hash, select_replicas, shard_for_point};
pub use metrics::ClusterMetrics;
pub use utils::{parse_duration, retry_with_backoff, timestamp_now_millis, with_timeout};
