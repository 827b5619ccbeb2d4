//! Hashing utilities for minivec
//!
//! - Sharding: points are routed to shards by BLAKE3 of their id
//! - HRW (Highest Random Weight) for initial replica placement

use crate::cluster::{PeerId, PointId, ShardId};

fn hash_u64(bytes: &[u8]) -> u64 {
    let hash = blake3::hash(bytes);
    let mut head = [0u8; 8];
    head.copy_from_slice(&hash.as_bytes()[0..8]);
    u64::from_le_bytes(head)
}

/// Compute the shard owning a point
pub fn shard_for_point(point_id: PointId, shard_number: u32) -> ShardId {
    if shard_number == 0 {
        return 0;
    }
    (hash_u64(&point_id.to_le_bytes()) % shard_number as u64) as ShardId
}

/// HRW (Highest Random Weight) hashing for replica placement
///
/// Given a key and a set of peers, returns peers sorted by their weight
/// (deterministic based on key). Placement stays stable as peers join.
pub fn hrw_hash(key: &str, peers: &[PeerId]) -> Vec<PeerId> {
    let mut weights: Vec<(PeerId, u64)> = peers
        .iter()
        .map(|peer| {
            let combined = format!("{}{}", key, peer);
            (*peer, hash_u64(combined.as_bytes()))
        })
        .collect();

    // Sort by weight (descending)
    weights.sort_by(|a, b| b.1.cmp(&a.1));

    weights.into_iter().map(|(peer, _)| peer).collect()
}

/// Select N replicas using HRW hashing
pub fn select_replicas(key: &str, peers: &[PeerId], n: usize) -> Vec<PeerId> {
    hrw_hash(key, peers).into_iter().take(n).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_for_point_deterministic() {
        assert_eq!(shard_for_point(42, 8), shard_for_point(42, 8));
        assert!(shard_for_point(42, 8) < 8);
        assert_eq!(shard_for_point(42, 1), 0);
    }

    #[test]
    fn test_points_spread_over_shards() {
        let mut seen = std::collections::HashSet::new();
        for id in 0..200 {
            seen.insert(shard_for_point(id, 4));
        }
        assert_eq!(seen.len(), 4);
    }

    #[test]
    fn test_hrw_hash_consistent() {
        let peers = vec![1, 2, 3];

        let sorted1 = hrw_hash("shard-0", &peers);
        let sorted2 = hrw_hash("shard-0", &peers);

        assert_eq!(sorted1, sorted2);
        assert_eq!(sorted1.len(), 3);
    }

    #[test]
    fn test_select_replicas() {
        let peers = vec![1, 2, 3, 4];

        let replicas = select_replicas("col-shard-3", &peers, 2);
        assert_eq!(replicas.len(), 2);
        assert_ne!(replicas[0], replicas[1]);

        // Asking for more than available yields everything
        assert_eq!(select_replicas("col-shard-3", &peers, 9).len(), 4);
    }
}
