//! Shard topology of a collection
//!
//! A [`ClusterTopology`] is the versioned aggregate of every shard's replica
//! set and every in-flight transfer. It is only ever changed through
//! [`TopologyMutation`]s applied to a draft copy, which keeps invariant
//! checking in one place.

use crate::cluster::replica;
use crate::common::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub type PeerId = u64;
pub type ShardId = u32;

/// Lifecycle state of one replica (a shard copy on one peer)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicaState {
    Initializing,
    Active,
    Partial,
    Listener,
    Dead,
}

impl ReplicaState {
    /// Counts towards the "shard keeps at least one copy" invariant.
    pub fn is_live(&self) -> bool {
        matches!(self, ReplicaState::Active | ReplicaState::Partial)
    }

    /// Takes part in read resolution.
    pub fn is_readable(&self) -> bool {
        !matches!(self, ReplicaState::Dead | ReplicaState::Listener)
    }

    /// Receives writes.
    pub fn is_updatable(&self) -> bool {
        !matches!(self, ReplicaState::Dead)
    }
}

impl std::fmt::Display for ReplicaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplicaState::Initializing => write!(f, "initializing"),
            ReplicaState::Active => write!(f, "active"),
            ReplicaState::Partial => write!(f, "partial"),
            ReplicaState::Listener => write!(f, "listener"),
            ReplicaState::Dead => write!(f, "dead"),
        }
    }
}

/// Immutable sizing of a collection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionParams {
    pub shard_number: u32,
    pub replication_factor: u32,
    pub write_consistency_factor: u32,
}

impl CollectionParams {
    pub fn validate(&self) -> Result<()> {
        if self.shard_number == 0 {
            return Err(Error::BadRequest("shard_number must be positive".into()));
        }
        if self.replication_factor == 0 {
            return Err(Error::BadRequest(
                "replication_factor must be positive".into(),
            ));
        }
        if self.write_consistency_factor == 0 {
            return Err(Error::BadRequest(
                "write_consistency_factor must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Replicas of one shard, keyed by peer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaSet {
    replicas: BTreeMap<PeerId, ReplicaState>,
}

impl ReplicaSet {
    pub fn get(&self, peer_id: PeerId) -> Option<ReplicaState> {
        self.replicas.get(&peer_id).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (PeerId, ReplicaState)> + '_ {
        self.replicas.iter().map(|(peer, state)| (*peer, *state))
    }

    pub fn len(&self) -> usize {
        self.replicas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }

    pub fn live_count(&self) -> usize {
        self.replicas.values().filter(|s| s.is_live()).count()
    }

    pub fn peers_in(&self, state: ReplicaState) -> Vec<PeerId> {
        self.iter()
            .filter(|(_, s)| *s == state)
            .map(|(peer, _)| peer)
            .collect()
    }

    pub fn readable_peers(&self) -> Vec<PeerId> {
        self.iter()
            .filter(|(_, s)| s.is_readable())
            .map(|(peer, _)| peer)
            .collect()
    }

    pub fn updatable_peers(&self) -> Vec<PeerId> {
        self.iter()
            .filter(|(_, s)| s.is_updatable())
            .map(|(peer, _)| peer)
            .collect()
    }
}

/// Identity of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransferKey {
    pub shard_id: ShardId,
    pub from: PeerId,
    pub to: PeerId,
}

impl std::fmt::Display for TransferKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "shard {} {} -> {}", self.shard_id, self.from, self.to)
    }
}

/// An in-flight shard copy between two peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardTransfer {
    pub shard_id: ShardId,
    pub from: PeerId,
    pub to: PeerId,
    /// `true` brings an extra/stale copy up to date, `false` relocates ownership
    pub sync: bool,
    pub started_at: DateTime<Utc>,
}

impl ShardTransfer {
    pub fn new(key: TransferKey, sync: bool) -> Self {
        Self {
            shard_id: key.shard_id,
            from: key.from,
            to: key.to,
            sync,
            started_at: Utc::now(),
        }
    }

    pub fn key(&self) -> TransferKey {
        TransferKey {
            shard_id: self.shard_id,
            from: self.from,
            to: self.to,
        }
    }

    pub fn involves(&self, peer_id: PeerId) -> bool {
        self.from == peer_id || self.to == peer_id
    }
}

/// A single change to a topology
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopologyMutation {
    AddReplica {
        shard_id: ShardId,
        peer_id: PeerId,
        state: ReplicaState,
    },
    TransitionReplica {
        shard_id: ShardId,
        peer_id: PeerId,
        state: ReplicaState,
    },
    RemoveReplica {
        shard_id: ShardId,
        peer_id: PeerId,
    },
    BeginTransfer(ShardTransfer),
    EndTransfer(TransferKey),
}

/// Notification emitted for every replica added, removed or moved between states
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaStateChange {
    pub collection: String,
    pub revision: u64,
    pub shard_id: ShardId,
    pub peer_id: PeerId,
    pub from: Option<ReplicaState>,
    pub to: Option<ReplicaState>,
}

/// Versioned shard/replica/transfer layout of one collection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterTopology {
    pub collection: String,
    pub revision: u64,
    pub params: CollectionParams,
    pub shards: BTreeMap<ShardId, ReplicaSet>,
    pub transfers: Vec<ShardTransfer>,
}

impl ClusterTopology {
    /// Fresh topology at revision 1; `placement[i]` lists the peers of shard `i`.
    pub fn new(collection: &str, params: CollectionParams, placement: Vec<Vec<PeerId>>) -> Self {
        let shards = placement
            .into_iter()
            .enumerate()
            .map(|(shard_id, peers)| {
                let replicas = peers
                    .into_iter()
                    .map(|peer| (peer, ReplicaState::Active))
                    .collect();
                (shard_id as ShardId, ReplicaSet { replicas })
            })
            .collect();

        Self {
            collection: collection.to_string(),
            revision: 1,
            params,
            shards,
            transfers: Vec::new(),
        }
    }

    pub fn shard(&self, shard_id: ShardId) -> Result<&ReplicaSet> {
        self.shards
            .get(&shard_id)
            .ok_or(Error::ShardNotFound(shard_id))
    }

    pub fn replica_state(&self, shard_id: ShardId, peer_id: PeerId) -> Option<ReplicaState> {
        self.shards.get(&shard_id).and_then(|set| set.get(peer_id))
    }

    pub fn transfer(&self, key: &TransferKey) -> Option<&ShardTransfer> {
        self.transfers.iter().find(|t| t.key() == *key)
    }

    /// The transfer currently writing into `(shard_id, to)`, if any
    pub fn transfer_into(&self, shard_id: ShardId, to: PeerId) -> Option<&ShardTransfer> {
        self.transfers
            .iter()
            .find(|t| t.shard_id == shard_id && t.to == to)
    }

    pub fn transfers_involving(
        &self,
        shard_id: ShardId,
        peer_id: PeerId,
    ) -> impl Iterator<Item = &ShardTransfer> {
        self.transfers
            .iter()
            .filter(move |t| t.shard_id == shard_id && t.involves(peer_id))
    }

    /// Shards with a replica on `peer_id`
    pub fn shards_on(&self, peer_id: PeerId) -> Vec<(ShardId, ReplicaState)> {
        self.shards
            .iter()
            .filter_map(|(shard_id, set)| set.get(peer_id).map(|state| (*shard_id, state)))
            .collect()
    }

    /// Apply `mutations` in order and verify invariants against `self` as it was.
    ///
    /// Returns the draft (revision not yet bumped) and the replica changes it produced.
    pub fn with_mutations(
        &self,
        mutations: &[TopologyMutation],
    ) -> Result<(ClusterTopology, Vec<ReplicaStateChange>)> {
        let mut draft = self.clone();
        let mut changes = Vec::new();

        for mutation in mutations {
            if let Some(change) = draft.apply_one(mutation)? {
                changes.push(change);
            }
        }

        draft.check_invariants(self)?;
        Ok((draft, changes))
    }

    fn replicas_mut(&mut self, shard_id: ShardId) -> Result<&mut BTreeMap<PeerId, ReplicaState>> {
        self.shards
            .get_mut(&shard_id)
            .map(|set| &mut set.replicas)
            .ok_or(Error::ShardNotFound(shard_id))
    }

    fn apply_one(&mut self, mutation: &TopologyMutation) -> Result<Option<ReplicaStateChange>> {
        let collection = self.collection.clone();
        let revision = self.revision + 1;
        let change = |shard_id, peer_id, from, to| ReplicaStateChange {
            collection,
            revision,
            shard_id,
            peer_id,
            from,
            to,
        };

        match mutation {
            TopologyMutation::AddReplica {
                shard_id,
                peer_id,
                state,
            } => {
                if !matches!(
                    state,
                    ReplicaState::Initializing | ReplicaState::Partial | ReplicaState::Active
                ) {
                    return Err(Error::BadRequest(format!(
                        "replicas cannot be created as {}",
                        state
                    )));
                }
                let replicas = self.replicas_mut(*shard_id)?;
                if replicas.contains_key(peer_id) {
                    return Err(Error::ReplicaExists {
                        shard_id: *shard_id,
                        peer_id: *peer_id,
                    });
                }
                replicas.insert(*peer_id, *state);
                Ok(Some(change(*shard_id, *peer_id, None, Some(*state))))
            }
            TopologyMutation::TransitionReplica {
                shard_id,
                peer_id,
                state,
            } => {
                let replicas = self.replicas_mut(*shard_id)?;
                let current = replicas
                    .get_mut(peer_id)
                    .ok_or(Error::ReplicaNotFound {
                        shard_id: *shard_id,
                        peer_id: *peer_id,
                    })?;
                let from = *current;
                if !replica::validate_transition(*shard_id, *peer_id, from, *state)? {
                    return Ok(None);
                }
                *current = *state;
                Ok(Some(change(*shard_id, *peer_id, Some(from), Some(*state))))
            }
            TopologyMutation::RemoveReplica { shard_id, peer_id } => {
                if self.transfers_involving(*shard_id, *peer_id).next().is_some() {
                    return Err(Error::BadRequest(format!(
                        "replica of shard {} on peer {} takes part in a transfer; abort it first",
                        shard_id, peer_id
                    )));
                }
                let replicas = self.replicas_mut(*shard_id)?;
                let from = replicas.remove(peer_id).ok_or(Error::ReplicaNotFound {
                    shard_id: *shard_id,
                    peer_id: *peer_id,
                })?;
                Ok(Some(change(*shard_id, *peer_id, Some(from), None)))
            }
            TopologyMutation::BeginTransfer(transfer) => {
                if transfer.from == transfer.to {
                    return Err(Error::BadRequest(
                        "transfer source and destination are the same peer".into(),
                    ));
                }
                let replicas = self.shard(transfer.shard_id)?;
                for peer_id in [transfer.from, transfer.to] {
                    if replicas.get(peer_id).is_none() {
                        return Err(Error::ReplicaNotFound {
                            shard_id: transfer.shard_id,
                            peer_id,
                        });
                    }
                }
                if self.transfer_into(transfer.shard_id, transfer.to).is_some() {
                    return Err(Error::TransferInProgress {
                        shard_id: transfer.shard_id,
                        to: transfer.to,
                    });
                }
                self.transfers.push(transfer.clone());
                Ok(None)
            }
            TopologyMutation::EndTransfer(key) => {
                let before = self.transfers.len();
                self.transfers.retain(|t| t.key() != *key);
                if self.transfers.len() == before {
                    return Err(Error::TransferNotFound {
                        shard_id: key.shard_id,
                        from: key.from,
                        to: key.to,
                    });
                }
                Ok(None)
            }
        }
    }

    fn check_invariants(&self, before: &ClusterTopology) -> Result<()> {
        for (shard_id, set) in &self.shards {
            let was_live = before
                .shards
                .get(shard_id)
                .map(|s| s.live_count())
                .unwrap_or(0);
            if was_live > 0 && set.live_count() == 0 {
                return Err(Error::LastLiveReplica {
                    shard_id: *shard_id,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> CollectionParams {
        CollectionParams {
            shard_number: 2,
            replication_factor: 1,
            write_consistency_factor: 1,
        }
    }

    fn topology() -> ClusterTopology {
        ClusterTopology::new("docs", params(), vec![vec![1], vec![2]])
    }

    fn key(from: PeerId, to: PeerId) -> TransferKey {
        TransferKey {
            shard_id: 0,
            from,
            to,
        }
    }

    #[test]
    fn test_new_topology() {
        let topo = topology();
        assert_eq!(topo.revision, 1);
        assert_eq!(topo.replica_state(0, 1), Some(ReplicaState::Active));
        assert_eq!(topo.replica_state(1, 2), Some(ReplicaState::Active));
        assert_eq!(topo.shards_on(1), vec![(0, ReplicaState::Active)]);
    }

    #[test]
    fn test_duplicate_replica_rejected() {
        let topo = topology();
        let result = topo.with_mutations(&[TopologyMutation::AddReplica {
            shard_id: 0,
            peer_id: 1,
            state: ReplicaState::Initializing,
        }]);
        assert!(matches!(result, Err(Error::ReplicaExists { .. })));
    }

    #[test]
    fn test_add_and_begin_transfer_in_one_draft() {
        let topo = topology();
        let (draft, changes) = topo
            .with_mutations(&[
                TopologyMutation::AddReplica {
                    shard_id: 0,
                    peer_id: 3,
                    state: ReplicaState::Initializing,
                },
                TopologyMutation::BeginTransfer(ShardTransfer::new(key(1, 3), false)),
            ])
            .unwrap();

        assert_eq!(draft.transfers.len(), 1);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].to, Some(ReplicaState::Initializing));
        // The original is untouched
        assert!(topo.transfers.is_empty());
    }

    #[test]
    fn test_second_transfer_into_same_destination_rejected() {
        let topo = ClusterTopology::new("docs", params(), vec![vec![1, 2], vec![2]]);
        let (draft, _) = topo
            .with_mutations(&[
                TopologyMutation::AddReplica {
                    shard_id: 0,
                    peer_id: 3,
                    state: ReplicaState::Partial,
                },
                TopologyMutation::BeginTransfer(ShardTransfer::new(key(1, 3), true)),
            ])
            .unwrap();

        let result = draft.with_mutations(&[TopologyMutation::BeginTransfer(
            ShardTransfer::new(key(2, 3), true),
        )]);
        assert!(matches!(
            result,
            Err(Error::TransferInProgress { shard_id: 0, to: 3 })
        ));
    }

    #[test]
    fn test_last_live_replica_protected() {
        let topo = topology();
        let remove = topo.with_mutations(&[TopologyMutation::RemoveReplica {
            shard_id: 0,
            peer_id: 1,
        }]);
        assert!(matches!(remove, Err(Error::LastLiveReplica { shard_id: 0 })));

        let kill = topo.with_mutations(&[TopologyMutation::TransitionReplica {
            shard_id: 0,
            peer_id: 1,
            state: ReplicaState::Dead,
        }]);
        assert!(matches!(kill, Err(Error::LastLiveReplica { shard_id: 0 })));
    }

    #[test]
    fn test_remove_replica_in_transfer_rejected() {
        let topo = topology();
        let (draft, _) = topo
            .with_mutations(&[
                TopologyMutation::AddReplica {
                    shard_id: 0,
                    peer_id: 3,
                    state: ReplicaState::Initializing,
                },
                TopologyMutation::BeginTransfer(ShardTransfer::new(key(1, 3), false)),
            ])
            .unwrap();

        let result = draft.with_mutations(&[TopologyMutation::RemoveReplica {
            shard_id: 0,
            peer_id: 3,
        }]);
        assert!(matches!(result, Err(Error::BadRequest(_))));
    }

    #[test]
    fn test_same_state_transition_is_noop() {
        let topo = topology();
        let (draft, changes) = topo
            .with_mutations(&[TopologyMutation::TransitionReplica {
                shard_id: 0,
                peer_id: 1,
                state: ReplicaState::Active,
            }])
            .unwrap();
        assert!(changes.is_empty());
        assert_eq!(draft, topo);
    }

    #[test]
    fn test_end_unknown_transfer() {
        let topo = topology();
        let result = topo.with_mutations(&[TopologyMutation::EndTransfer(key(1, 2))]);
        assert!(matches!(result, Err(Error::TransferNotFound { .. })));
    }
}
