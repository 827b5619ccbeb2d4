//! Write ordering coordinator
//!
//! Every write gets an operation id at admission, then follows its ordering
//! mode:
//!
//! - `Weak`: applied on the first reachable replica (local first) and fanned
//!   out to the rest without any cross-replica order.
//! - `Medium`: sent to a transient per-shard leader picked through
//!   consensus; re-elected if that leader stops answering.
//! - `Strong`: sent to the durable leader only; fails fast when there is none.
//!
//! A leader serializes writes to its shard with a per-shard lock, applies
//! locally, then propagates to the other updatable replicas.

use crate::cluster::health::mark_replica_dead;
use crate::cluster::{
    Consensus, PeerId, PeerTransport, PointOperation, ReplicaState, SegmentStorage, ShardId,
    ShardUpdate, TopologyStore,
};
use crate::common::{retry_with_backoff, with_timeout, ConsistencyConfig, Error, Result};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Instant;

const OPERATION_LOG_CAPACITY: usize = 4096;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteOrdering {
    #[default]
    Weak,
    Medium,
    Strong,
}

impl FromStr for WriteOrdering {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "weak" => Ok(WriteOrdering::Weak),
            "medium" => Ok(WriteOrdering::Medium),
            "strong" => Ok(WriteOrdering::Strong),
            other => Err(Error::BadRequest(format!("unknown write ordering: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateStatus {
    /// Accepted; replication continues in the background
    Acknowledged,
    /// Applied on as many replicas as the ordering mode requires
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateResult {
    pub operation_id: u64,
    pub status: UpdateStatus,
}

#[derive(Debug, Clone)]
pub struct WriteRequest {
    pub collection: String,
    pub operation: PointOperation,
    pub ordering: WriteOrdering,
    pub wait: bool,
    /// Route to this shard instead of hashing point ids
    pub shard: Option<ShardId>,
}

/// Last known state of a recent operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    Acknowledged,
    Completed,
    Failed(String),
}

/// Bounded record of recent operations, oldest evicted first
#[derive(Default)]
struct OperationLog {
    order: VecDeque<(String, u64)>,
    states: HashMap<(String, u64), OperationState>,
}

impl OperationLog {
    fn record(&mut self, collection: &str, operation_id: u64, state: OperationState) {
        let key = (collection.to_string(), operation_id);
        if self.states.insert(key.clone(), state).is_none() {
            self.order.push_back(key);
        }
        while self.order.len() > OPERATION_LOG_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.states.remove(&oldest);
            }
        }
    }
}

pub struct WriteCoordinator {
    peer_id: PeerId,
    store: Arc<TopologyStore>,
    storage: Arc<dyn SegmentStorage>,
    transport: Arc<dyn PeerTransport>,
    consensus: Arc<dyn Consensus>,
    config: ConsistencyConfig,
    operations: Mutex<OperationLog>,
    shard_locks: Mutex<HashMap<(String, ShardId), Arc<tokio::sync::Mutex<()>>>>,
}

impl WriteCoordinator {
    pub fn new(
        peer_id: PeerId,
        store: Arc<TopologyStore>,
        storage: Arc<dyn SegmentStorage>,
        transport: Arc<dyn PeerTransport>,
        consensus: Arc<dyn Consensus>,
        config: ConsistencyConfig,
    ) -> Self {
        Self {
            peer_id,
            store,
            storage,
            transport,
            consensus,
            config,
            operations: Mutex::new(OperationLog::default()),
            shard_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Admit and run a write
    pub async fn update(self: &Arc<Self>, request: WriteRequest) -> Result<UpdateResult> {
        let started = Instant::now();
        let collection = request.collection.clone();
        let topology = self.store.get_topology(&collection)?;

        if request.operation.is_empty() {
            return Err(Error::BadRequest("operation touches no points".into()));
        }
        let parts: Vec<(ShardId, PointOperation)> = match request.shard {
            Some(shard_id) => {
                topology.shard(shard_id)?;
                vec![(shard_id, request.operation)]
            }
            None => request
                .operation
                .split_by_shard(topology.params.shard_number)
                .into_iter()
                .collect(),
        };

        let operation_id = self.store.next_operation_id(&collection)?;
        self.record(&collection, operation_id, OperationState::Acknowledged);
        let metrics = self.store.metrics();
        match request.ordering {
            WriteOrdering::Weak => metrics.writes_weak.inc(),
            WriteOrdering::Medium => metrics.writes_medium.inc(),
            WriteOrdering::Strong => metrics.writes_strong.inc(),
        }
        tracing::debug!(
            "Admitted operation {} on {} ({:?}, {} shards)",
            operation_id,
            collection,
            request.ordering,
            parts.len()
        );

        let updates: Vec<(ShardId, ShardUpdate)> = parts
            .into_iter()
            .map(|(shard_id, operation)| {
                (
                    shard_id,
                    ShardUpdate {
                        operation_id,
                        operation,
                    },
                )
            })
            .collect();

        if request.ordering == WriteOrdering::Strong {
            for (shard_id, _) in &updates {
                if let Err(e) = self.durable_leader(&collection, *shard_id).await {
                    self.finish(&collection, operation_id, started, Some(&e));
                    return Err(e);
                }
            }
        }

        if !request.wait {
            match request.ordering {
                WriteOrdering::Weak => {
                    let mut applied = Vec::with_capacity(updates.len());
                    for (shard_id, update) in &updates {
                        match self.apply_first(&collection, *shard_id, update).await {
                            Ok(peer) => applied.push(peer),
                            Err(e) => {
                                self.finish(&collection, operation_id, started, Some(&e));
                                return Err(e);
                            }
                        }
                    }
                    let this = Arc::clone(self);
                    tokio::spawn(async move {
                        let results = join_all(updates.iter().zip(applied).map(
                            |((shard_id, update), first)| {
                                this.replicate_weak(&collection, *shard_id, update, first)
                            },
                        ))
                        .await;
                        let result = results.into_iter().collect::<Result<Vec<()>>>();
                        this.finish(&collection, operation_id, started, result.as_ref().err());
                    });
                }
                ordering => {
                    let this = Arc::clone(self);
                    tokio::spawn(async move {
                        let result = this.run_ordered(&collection, &updates, ordering).await;
                        this.finish(&collection, operation_id, started, result.as_ref().err());
                    });
                }
            }
            return Ok(UpdateResult {
                operation_id,
                status: UpdateStatus::Acknowledged,
            });
        }

        let name = collection.as_str();
        let result = match request.ordering {
            WriteOrdering::Weak => {
                let results = join_all(updates.iter().map(|(shard_id, update)| async move {
                    let first = self.apply_first(name, *shard_id, update).await?;
                    self.replicate_weak(name, *shard_id, update, first).await
                }))
                .await;
                results.into_iter().collect::<Result<Vec<()>>>().map(|_| ())
            }
            ordering => self.run_ordered(name, &updates, ordering).await,
        };
        self.finish(name, operation_id, started, result.as_ref().err());

        result.map(|_| UpdateResult {
            operation_id,
            status: UpdateStatus::Completed,
        })
    }

    /// Status of a recent operation admitted by this coordinator
    pub fn operation_status(&self, collection: &str, operation_id: u64) -> Option<OperationState> {
        self.operations
            .lock()
            .ok()?
            .states
            .get(&(collection.to_string(), operation_id))
            .cloned()
    }

    /// Apply an ordered write as the shard leader.
    ///
    /// Writes to one shard are serialized here. Completes once
    /// `min(write_consistency_factor, updatable replicas)` replicas, this one
    /// included, applied the update.
    pub async fn apply_as_leader(
        &self,
        collection: &str,
        shard_id: ShardId,
        update: &ShardUpdate,
        ordering: WriteOrdering,
    ) -> Result<()> {
        let lock = self.shard_lock(collection, shard_id)?;
        let _guard = lock.lock().await;

        if ordering == WriteOrdering::Strong {
            let leader = self.consensus.current_leader(collection, shard_id).await?;
            if leader != Some(self.peer_id) {
                return Err(Error::LeaderUnavailable(shard_id));
            }
        }

        let topology = self.store.get_topology(collection)?;
        let shard = topology.shard(shard_id)?;
        match shard.get(self.peer_id) {
            Some(state) if state.is_updatable() => {}
            _ => return Err(Error::LeaderUnavailable(shard_id)),
        }

        self.storage.apply(collection, shard_id, update).await?;

        let updatable = shard.updatable_peers();
        let others: Vec<PeerId> = updatable
            .iter()
            .copied()
            .filter(|peer| *peer != self.peer_id)
            .collect();
        let acks = 1 + self.fan_out(collection, shard_id, update, others).await;
        let required = (topology.params.write_consistency_factor as usize).min(updatable.len());
        if acks < required {
            return Err(Error::InsufficientReplicas {
                needed: required,
                available: acks,
            });
        }
        Ok(())
    }

    // === Ordered path ===

    async fn run_ordered(
        &self,
        collection: &str,
        updates: &[(ShardId, ShardUpdate)],
        ordering: WriteOrdering,
    ) -> Result<()> {
        let results = join_all(
            updates
                .iter()
                .map(|(shard_id, update)| self.ordered(collection, *shard_id, update, ordering)),
        )
        .await;
        results.into_iter().collect::<Result<Vec<()>>>().map(|_| ())
    }

    async fn ordered(
        &self,
        collection: &str,
        shard_id: ShardId,
        update: &ShardUpdate,
        ordering: WriteOrdering,
    ) -> Result<()> {
        if ordering == WriteOrdering::Strong {
            let leader = self.durable_leader(collection, shard_id).await?;
            return self
                .send_to_leader(leader, collection, shard_id, update, ordering)
                .await
                .map_err(|e| {
                    if e.is_unreachable() {
                        Error::LeaderUnavailable(shard_id)
                    } else {
                        e
                    }
                });
        }

        let mut excluded: Vec<PeerId> = Vec::new();
        let mut last_error = None;
        for attempt in 1..=self.config.leader_attempts {
            let topology = self.store.get_topology(collection)?;
            let candidates: Vec<PeerId> = topology
                .shard(shard_id)?
                .peers_in(ReplicaState::Active)
                .into_iter()
                .filter(|peer| !excluded.contains(peer))
                .collect();
            if candidates.is_empty() {
                break;
            }

            let leader = self.consensus.elect(collection, shard_id, &candidates).await?;
            match self
                .send_to_leader(leader, collection, shard_id, update, ordering)
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() || matches!(e, Error::LeaderUnavailable(_)) => {
                    tracing::warn!(
                        "Leader {} of {} shard {} failed on attempt {}: {}",
                        leader,
                        collection,
                        shard_id,
                        attempt,
                        e
                    );
                    excluded.push(leader);
                    last_error = Some(e);
                    tokio::time::sleep(self.config.retry_backoff()).await;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error.unwrap_or(Error::LeaderUnavailable(shard_id)))
    }

    async fn durable_leader(&self, collection: &str, shard_id: ShardId) -> Result<PeerId> {
        let leader = self
            .consensus
            .current_leader(collection, shard_id)
            .await?
            .ok_or(Error::LeaderUnavailable(shard_id))?;
        let topology = self.store.get_topology(collection)?;
        match topology.replica_state(shard_id, leader) {
            Some(state) if state.is_updatable() => Ok(leader),
            _ => Err(Error::LeaderUnavailable(shard_id)),
        }
    }

    async fn send_to_leader(
        &self,
        leader: PeerId,
        collection: &str,
        shard_id: ShardId,
        update: &ShardUpdate,
        ordering: WriteOrdering,
    ) -> Result<()> {
        if leader == self.peer_id {
            return self.apply_as_leader(collection, shard_id, update, ordering).await;
        }
        // The leader fans out in turn
        with_timeout(
            self.config.fanout_timeout() * 2,
            "leader write",
            self.transport
                .forward_to_leader(leader, collection, shard_id, update, ordering),
        )
        .await
    }

    // === Weak path ===

    /// Apply on the first replica that accepts the update, local first
    async fn apply_first(
        &self,
        collection: &str,
        shard_id: ShardId,
        update: &ShardUpdate,
    ) -> Result<PeerId> {
        let topology = self.store.get_topology(collection)?;
        let mut candidates = topology.shard(shard_id)?.updatable_peers();
        candidates.sort_by_key(|peer| *peer != self.peer_id);

        for peer in candidates {
            match self.apply_with_retry(peer, collection, shard_id, update).await {
                Ok(()) => return Ok(peer),
                Err(e) => tracing::debug!(
                    "Peer {} rejected operation {}: {}",
                    peer,
                    update.operation_id,
                    e
                ),
            }
        }
        Err(Error::InsufficientReplicas {
            needed: 1,
            available: 0,
        })
    }

    async fn replicate_weak(
        &self,
        collection: &str,
        shard_id: ShardId,
        update: &ShardUpdate,
        first: PeerId,
    ) -> Result<()> {
        let topology = self.store.get_topology(collection)?;
        let updatable = topology.shard(shard_id)?.updatable_peers();
        let rest: Vec<PeerId> = updatable
            .iter()
            .copied()
            .filter(|peer| *peer != first)
            .collect();
        let acks = 1 + self.fan_out(collection, shard_id, update, rest).await;
        let required = (topology.params.write_consistency_factor as usize).min(updatable.len());
        if acks < required {
            return Err(Error::InsufficientReplicas {
                needed: required,
                available: acks,
            });
        }
        Ok(())
    }

    // === Replica fan-out ===

    /// Apply on every target concurrently; returns how many succeeded.
    /// Targets that stop answering are deactivated.
    async fn fan_out(
        &self,
        collection: &str,
        shard_id: ShardId,
        update: &ShardUpdate,
        targets: Vec<PeerId>,
    ) -> usize {
        let results = join_all(targets.iter().map(|peer| async move {
            (
                *peer,
                self.apply_with_retry(*peer, collection, shard_id, update)
                    .await,
            )
        }))
        .await;

        let mut acks = 0;
        for (peer, result) in results {
            match result {
                Ok(()) => acks += 1,
                Err(e) if e.is_unreachable() => {
                    tracing::warn!(
                        "Replica of {} shard {} on peer {} missed operation {}: {}",
                        collection,
                        shard_id,
                        peer,
                        update.operation_id,
                        e
                    );
                    if let Err(e) = mark_replica_dead(&self.store, collection, shard_id, peer) {
                        tracing::warn!("Cannot deactivate peer {}: {}", peer, e);
                    }
                }
                Err(e) => tracing::warn!(
                    "Replica of {} shard {} on peer {} rejected operation {}: {}",
                    collection,
                    shard_id,
                    peer,
                    update.operation_id,
                    e
                ),
            }
        }
        acks
    }

    async fn apply_with_retry(
        &self,
        peer: PeerId,
        collection: &str,
        shard_id: ShardId,
        update: &ShardUpdate,
    ) -> Result<()> {
        let timeout = self.config.fanout_timeout();
        retry_with_backoff(
            || with_timeout(timeout, "replica update", self.apply_on(peer, collection, shard_id, update)),
            self.config.replica_attempts,
            self.config.retry_backoff(),
        )
        .await
    }

    async fn apply_on(
        &self,
        peer: PeerId,
        collection: &str,
        shard_id: ShardId,
        update: &ShardUpdate,
    ) -> Result<()> {
        if peer == self.peer_id {
            self.storage.apply(collection, shard_id, update).await
        } else {
            self.transport
                .apply_update(peer, collection, shard_id, update)
                .await
        }
    }

    // === Bookkeeping ===

    fn shard_lock(
        &self,
        collection: &str,
        shard_id: ShardId,
    ) -> Result<Arc<tokio::sync::Mutex<()>>> {
        Ok(self
            .shard_locks
            .lock()
            .map_err(|_| Error::poisoned("shard locks"))?
            .entry((collection.to_string(), shard_id))
            .or_default()
            .clone())
    }

    fn record(&self, collection: &str, operation_id: u64, state: OperationState) {
        if let Ok(mut log) = self.operations.lock() {
            log.record(collection, operation_id, state);
        }
    }

    fn finish(&self, collection: &str, operation_id: u64, started: Instant, error: Option<&Error>) {
        let metrics = self.store.metrics();
        metrics.write_latency.observe(started.elapsed());
        match error {
            None => self.record(collection, operation_id, OperationState::Completed),
            Some(e) => {
                metrics.write_failures.inc();
                tracing::warn!("Operation {} on {} failed: {}", operation_id, collection, e);
                self.record(collection, operation_id, OperationState::Failed(e.to_string()));
            }
        }
    }
}
