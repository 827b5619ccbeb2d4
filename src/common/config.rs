//! Configuration for minivec components

use crate::cluster::PeerId;
use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Global configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,

    #[serde(default)]
    pub transfer: TransferConfig,

    #[serde(default)]
    pub consistency: ConsistencyConfig,

    #[serde(default)]
    pub health: HealthConfig,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load `minivec.toml` (optional) overlaid with `MINIVEC__*` environment variables.
    pub fn load() -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name("minivec").required(false))
            .add_source(config::Environment::with_prefix("MINIVEC").separator("__"))
            .build()
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.transfer.max_attempts == 0 {
            return Err(Error::InvalidConfig(
                "transfer.max_attempts must be at least 1".into(),
            ));
        }
        if self.consistency.replica_attempts == 0 || self.consistency.leader_attempts == 0 {
            return Err(Error::InvalidConfig(
                "consistency attempts must be at least 1".into(),
            ));
        }
        if self.health.sweep_interval_ms == 0 {
            return Err(Error::InvalidConfig(
                "health.sweep_interval_ms must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Identity and addresses of this peer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// This peer's id
    #[serde(default = "default_peer_id")]
    pub peer_id: PeerId,

    /// Bind address for the HTTP admin API
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,

    /// RocksDB path for the topology store (in-memory when absent)
    #[serde(default)]
    pub topology_path: Option<PathBuf>,

    /// Peers hosted in-process alongside this one
    #[serde(default)]
    pub peers: Vec<PeerId>,
}

fn default_peer_id() -> PeerId {
    1
}
fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 6333))
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            peer_id: default_peer_id(),
            bind_addr: default_bind_addr(),
            topology_path: None,
            peers: Vec::new(),
        }
    }
}

impl NodeConfig {
    /// All known peers, this one included, sorted and deduplicated.
    pub fn all_peers(&self) -> Vec<PeerId> {
        let mut peers = self.peers.clone();
        peers.push(self.peer_id);
        peers.sort_unstable();
        peers.dedup();
        peers
    }
}

/// Shard transfer tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Attempts per chunk before the transfer is declared failed
    #[serde(default = "default_transfer_attempts")]
    pub max_attempts: usize,

    /// First retry delay, doubled on each attempt
    #[serde(default = "default_transfer_backoff")]
    pub initial_backoff_ms: u64,

    /// Upper bound for copying one chunk
    #[serde(default = "default_chunk_timeout")]
    pub chunk_timeout_ms: u64,
}

fn default_transfer_attempts() -> usize {
    3
}
fn default_transfer_backoff() -> u64 {
    100
}
fn default_chunk_timeout() -> u64 {
    30_000
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_transfer_attempts(),
            initial_backoff_ms: default_transfer_backoff(),
            chunk_timeout_ms: default_chunk_timeout(),
        }
    }
}

impl TransferConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_millis(self.chunk_timeout_ms)
    }
}

/// Read/write fan-out tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsistencyConfig {
    /// Per-replica request timeout during fan-out
    #[serde(default = "default_fanout_timeout")]
    pub fanout_timeout_ms: u64,

    /// Attempts per replica before it counts as a non-response
    #[serde(default = "default_replica_attempts")]
    pub replica_attempts: usize,

    /// Leader (re)selections for medium-ordered writes
    #[serde(default = "default_leader_attempts")]
    pub leader_attempts: usize,

    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,
}

fn default_fanout_timeout() -> u64 {
    5_000
}
fn default_replica_attempts() -> usize {
    2
}
fn default_leader_attempts() -> usize {
    3
}
fn default_retry_backoff() -> u64 {
    50
}

impl Default for ConsistencyConfig {
    fn default() -> Self {
        Self {
            fanout_timeout_ms: default_fanout_timeout(),
            replica_attempts: default_replica_attempts(),
            leader_attempts: default_leader_attempts(),
            retry_backoff_ms: default_retry_backoff(),
        }
    }
}

impl ConsistencyConfig {
    pub fn fanout_timeout(&self) -> Duration {
        Duration::from_millis(self.fanout_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// Failure detection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// A peer silent for longer than this has its replicas marked dead
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_ms: u64,

    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_ms: u64,
}

fn default_heartbeat_timeout() -> u64 {
    10_000
}
fn default_sweep_interval() -> u64 {
    1_000
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_ms: default_heartbeat_timeout(),
            sweep_interval_ms: default_sweep_interval(),
        }
    }
}

impl HealthConfig {
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.node.peer_id, 1);
        assert_eq!(config.transfer.max_attempts, 3);
        assert_eq!(config.consistency.fanout_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(
                "[node]\npeer_id = 7\npeers = [8, 9]\n\n[transfer]\nmax_attempts = 5\n",
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap();
        let config: Config = settings.try_deserialize().unwrap();

        assert_eq!(config.node.peer_id, 7);
        assert_eq!(config.node.all_peers(), vec![7, 8, 9]);
        assert_eq!(config.transfer.max_attempts, 5);
        assert_eq!(config.transfer.chunk_timeout_ms, 30_000);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let mut config = Config::default();
        config.transfer.max_attempts = 0;
        assert!(config.validate().is_err());
    }
}
