//! In-process collaborators
//!
//! [`MemorySegments`] stores versioned points per shard, [`LocalNetwork`]
//! connects peers living in one process (with fault injection) and
//! [`LocalConsensus`] keeps leaders and proposals in memory. They back the
//! standalone binary and the test suites.

use crate::cluster::{
    BulkTransfer, Consensus, MetadataChange, PeerId, PeerTransport, PointId, PointOperation,
    Record, ScoredPoint, SearchRequest, SegmentStorage, ShardId, ShardTransfer, ShardUpdate,
    TransferKey, WriteCoordinator, WriteOrdering,
};
use crate::common::{Error, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

// === Segment storage ===

/// One stored point; `vector == None` marks a deletion
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentEntry {
    pub id: PointId,
    pub version: u64,
    pub vector: Option<Vec<f32>>,
    pub payload: Option<Value>,
}

type ShardPoints = BTreeMap<PointId, SegmentEntry>;

#[derive(Default)]
pub struct MemorySegments {
    shards: RwLock<HashMap<(String, ShardId), ShardPoints>>,
}

impl MemorySegments {
    pub fn new() -> Self {
        Self::default()
    }

    /// Version of a live point, if present
    pub fn version_of(&self, collection: &str, shard_id: ShardId, id: PointId) -> Option<u64> {
        let shards = self.shards.read().ok()?;
        shards
            .get(&(collection.to_string(), shard_id))?
            .get(&id)
            .filter(|entry| entry.vector.is_some())
            .map(|entry| entry.version)
    }

    /// Every entry of a shard, deletions included
    pub fn export(&self, collection: &str, shard_id: ShardId) -> Result<Vec<SegmentEntry>> {
        let shards = self.shards.read().map_err(|_| Error::poisoned("segments"))?;
        Ok(shards
            .get(&(collection.to_string(), shard_id))
            .map(|points| points.values().cloned().collect())
            .unwrap_or_default())
    }

    /// Merge entries copied from another replica, keeping newer local versions
    pub fn import(&self, collection: &str, shard_id: ShardId, entries: &[SegmentEntry]) -> Result<()> {
        let mut shards = self.shards.write().map_err(|_| Error::poisoned("segments"))?;
        let points = shards.entry((collection.to_string(), shard_id)).or_default();
        for entry in entries {
            if points.get(&entry.id).map_or(true, |p| p.version < entry.version) {
                points.insert(entry.id, entry.clone());
            }
        }
        Ok(())
    }
}

fn merge_payload(current: Option<Value>, update: &Value) -> Value {
    match (current, update) {
        (Some(Value::Object(mut current)), Value::Object(update)) => {
            for (key, value) in update {
                current.insert(key.clone(), value.clone());
            }
            Value::Object(current)
        }
        _ => update.clone(),
    }
}

#[async_trait]
impl SegmentStorage for MemorySegments {
    async fn apply(&self, collection: &str, shard_id: ShardId, update: &ShardUpdate) -> Result<()> {
        let mut shards = self.shards.write().map_err(|_| Error::poisoned("segments"))?;
        let points = shards.entry((collection.to_string(), shard_id)).or_default();
        let version = update.operation_id;
        let is_newer = |points: &ShardPoints, id: &PointId| {
            points.get(id).map_or(true, |p| p.version < version)
        };

        match &update.operation {
            PointOperation::Upsert { points: upserts } => {
                for point in upserts {
                    if is_newer(points, &point.id) {
                        points.insert(
                            point.id,
                            SegmentEntry {
                                id: point.id,
                                version,
                                vector: Some(point.vector.clone()),
                                payload: point.payload.clone(),
                            },
                        );
                    }
                }
            }
            PointOperation::Delete { ids } => {
                for id in ids {
                    if is_newer(points, id) {
                        points.insert(
                            *id,
                            SegmentEntry {
                                id: *id,
                                version,
                                vector: None,
                                payload: None,
                            },
                        );
                    }
                }
            }
            PointOperation::SetPayload { ids, payload } => {
                for id in ids {
                    if !is_newer(points, id) {
                        continue;
                    }
                    if let Some(entry) = points.get_mut(id).filter(|e| e.vector.is_some()) {
                        entry.payload = Some(merge_payload(entry.payload.take(), payload));
                        entry.version = version;
                    }
                }
            }
        }
        Ok(())
    }

    async fn retrieve(
        &self,
        collection: &str,
        shard_id: ShardId,
        ids: &[PointId],
    ) -> Result<Vec<Record>> {
        let shards = self.shards.read().map_err(|_| Error::poisoned("segments"))?;
        let Some(points) = shards.get(&(collection.to_string(), shard_id)) else {
            return Ok(Vec::new());
        };
        Ok(ids
            .iter()
            .filter_map(|id| points.get(id))
            .filter_map(|entry| {
                entry.vector.as_ref().map(|vector| Record {
                    id: entry.id,
                    version: entry.version,
                    vector: vector.clone(),
                    payload: entry.payload.clone(),
                })
            })
            .collect())
    }

    async fn search(
        &self,
        collection: &str,
        shard_id: ShardId,
        request: &SearchRequest,
    ) -> Result<Vec<ScoredPoint>> {
        let shards = self.shards.read().map_err(|_| Error::poisoned("segments"))?;
        let Some(points) = shards.get(&(collection.to_string(), shard_id)) else {
            return Ok(Vec::new());
        };
        let mut hits: Vec<ScoredPoint> = points
            .values()
            .filter_map(|entry| {
                let vector = entry.vector.as_ref()?;
                let score = vector
                    .iter()
                    .zip(&request.vector)
                    .map(|(a, b)| a * b)
                    .sum();
                Some(ScoredPoint {
                    id: entry.id,
                    version: entry.version,
                    score,
                    payload: entry.payload.clone(),
                })
            })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.id.cmp(&b.id)));
        hits.truncate(request.limit);
        Ok(hits)
    }

    async fn count(&self, collection: &str, shard_id: ShardId) -> Result<usize> {
        let shards = self.shards.read().map_err(|_| Error::poisoned("segments"))?;
        Ok(shards
            .get(&(collection.to_string(), shard_id))
            .map(|points| points.values().filter(|e| e.vector.is_some()).count())
            .unwrap_or(0))
    }
}

// === Peer network ===

#[derive(Clone)]
struct PeerHandle {
    storage: Arc<MemorySegments>,
    writer: Option<Weak<WriteCoordinator>>,
}

#[derive(Default)]
struct Faults {
    unreachable: HashSet<PeerId>,
    delays: HashMap<PeerId, Duration>,
    failing_destinations: HashSet<PeerId>,
    chunk_delay: Duration,
}

/// Loopback transport between peers of one process
pub struct LocalNetwork {
    peers: RwLock<HashMap<PeerId, PeerHandle>>,
    faults: Mutex<Faults>,
    chunk_size: usize,
    snapshots: Mutex<HashMap<(String, TransferKey), Vec<SegmentEntry>>>,
}

impl LocalNetwork {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            faults: Mutex::new(Faults::default()),
            chunk_size: chunk_size.max(1),
            snapshots: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, peer: PeerId, storage: Arc<MemorySegments>) {
        if let Ok(mut peers) = self.peers.write() {
            peers.insert(
                peer,
                PeerHandle {
                    storage,
                    writer: None,
                },
            );
        }
    }

    /// Route leader writes for `peer` to its coordinator
    pub fn attach_writer(&self, peer: PeerId, writer: &Arc<WriteCoordinator>) {
        if let Ok(mut peers) = self.peers.write() {
            if let Some(handle) = peers.get_mut(&peer) {
                handle.writer = Some(Arc::downgrade(writer));
            }
        }
    }

    pub fn set_unreachable(&self, peer: PeerId, unreachable: bool) {
        if let Ok(mut faults) = self.faults.lock() {
            if unreachable {
                faults.unreachable.insert(peer);
            } else {
                faults.unreachable.remove(&peer);
            }
        }
    }

    pub fn is_reachable(&self, peer: PeerId) -> bool {
        let known = self
            .peers
            .read()
            .map(|peers| peers.contains_key(&peer))
            .unwrap_or(false);
        let blocked = self
            .faults
            .lock()
            .map(|faults| faults.unreachable.contains(&peer))
            .unwrap_or(true);
        known && !blocked
    }

    /// Delay every request to `peer`
    pub fn set_delay(&self, peer: PeerId, delay: Duration) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.delays.insert(peer, delay);
        }
    }

    /// Make every chunk copied into `peer` fail
    pub fn fail_transfers_to(&self, peer: PeerId, fail: bool) {
        if let Ok(mut faults) = self.faults.lock() {
            if fail {
                faults.failing_destinations.insert(peer);
            } else {
                faults.failing_destinations.remove(&peer);
            }
        }
    }

    pub fn set_chunk_delay(&self, delay: Duration) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.chunk_delay = delay;
        }
    }

    async fn reach(&self, peer: PeerId) -> Result<PeerHandle> {
        let (unreachable, delay) = {
            let faults = self.faults.lock().map_err(|_| Error::poisoned("faults"))?;
            (
                faults.unreachable.contains(&peer),
                faults.delays.get(&peer).copied(),
            )
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if unreachable {
            return Err(Error::PeerUnreachable {
                peer_id: peer,
                reason: "connection refused".into(),
            });
        }
        self.peers
            .read()
            .map_err(|_| Error::poisoned("peers"))?
            .get(&peer)
            .cloned()
            .ok_or_else(|| Error::PeerUnreachable {
                peer_id: peer,
                reason: "unknown peer".into(),
            })
    }
}

#[async_trait]
impl PeerTransport for LocalNetwork {
    async fn apply_update(
        &self,
        peer: PeerId,
        collection: &str,
        shard_id: ShardId,
        update: &ShardUpdate,
    ) -> Result<()> {
        let handle = self.reach(peer).await?;
        handle.storage.apply(collection, shard_id, update).await
    }

    async fn forward_to_leader(
        &self,
        leader: PeerId,
        collection: &str,
        shard_id: ShardId,
        update: &ShardUpdate,
        ordering: WriteOrdering,
    ) -> Result<()> {
        let handle = self.reach(leader).await?;
        let writer = handle
            .writer
            .and_then(|writer| writer.upgrade())
            .ok_or_else(|| Error::PeerUnreachable {
                peer_id: leader,
                reason: "no write coordinator".into(),
            })?;
        writer
            .apply_as_leader(collection, shard_id, update, ordering)
            .await
    }

    async fn retrieve(
        &self,
        peer: PeerId,
        collection: &str,
        shard_id: ShardId,
        ids: &[PointId],
    ) -> Result<Vec<Record>> {
        let handle = self.reach(peer).await?;
        handle.storage.retrieve(collection, shard_id, ids).await
    }

    async fn search(
        &self,
        peer: PeerId,
        collection: &str,
        shard_id: ShardId,
        request: &SearchRequest,
    ) -> Result<Vec<ScoredPoint>> {
        let handle = self.reach(peer).await?;
        handle.storage.search(collection, shard_id, request).await
    }
}

#[async_trait]
impl BulkTransfer for LocalNetwork {
    async fn start(&self, collection: &str, transfer: &ShardTransfer) -> Result<u64> {
        let source = self.reach(transfer.from).await?;
        self.reach(transfer.to).await?;

        let entries = source.storage.export(collection, transfer.shard_id)?;
        let chunks = entries.len().div_ceil(self.chunk_size) as u64;
        self.snapshots
            .lock()
            .map_err(|_| Error::poisoned("snapshots"))?
            .insert((collection.to_string(), transfer.key()), entries);
        Ok(chunks)
    }

    async fn copy_chunk(
        &self,
        collection: &str,
        transfer: &ShardTransfer,
        chunk: u64,
    ) -> Result<()> {
        let (failing, delay) = {
            let faults = self.faults.lock().map_err(|_| Error::poisoned("faults"))?;
            (
                faults.failing_destinations.contains(&transfer.to),
                faults.chunk_delay,
            )
        };
        tokio::time::sleep(delay).await;
        if failing {
            return Err(Error::PeerUnreachable {
                peer_id: transfer.to,
                reason: "chunk write failed".into(),
            });
        }

        let destination = self.reach(transfer.to).await?;
        let entries: Vec<SegmentEntry> = {
            let snapshots = self.snapshots.lock().map_err(|_| Error::poisoned("snapshots"))?;
            let snapshot = snapshots
                .get(&(collection.to_string(), transfer.key()))
                .ok_or_else(|| Error::Internal(format!("no snapshot for {}", transfer.key())))?;
            snapshot
                .chunks(self.chunk_size)
                .nth(chunk as usize)
                .map(|c| c.to_vec())
                .unwrap_or_default()
        };
        destination
            .storage
            .import(collection, transfer.shard_id, &entries)
    }

    async fn cancel(&self, collection: &str, transfer: &ShardTransfer) -> Result<()> {
        self.snapshots
            .lock()
            .map_err(|_| Error::poisoned("snapshots"))?
            .remove(&(collection.to_string(), transfer.key()));
        Ok(())
    }
}

// === Consensus ===

/// Leaders and agreed metadata changes held in memory
#[derive(Default)]
pub struct LocalConsensus {
    leaders: Mutex<HashMap<(String, ShardId), PeerId>>,
    proposals: Mutex<Vec<MetadataChange>>,
}

impl LocalConsensus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_leader(&self, collection: &str, shard_id: ShardId, peer: PeerId) {
        if let Ok(mut leaders) = self.leaders.lock() {
            leaders.insert((collection.to_string(), shard_id), peer);
        }
    }

    pub fn clear_leader(&self, collection: &str, shard_id: ShardId) {
        if let Ok(mut leaders) = self.leaders.lock() {
            leaders.remove(&(collection.to_string(), shard_id));
        }
    }

    pub fn proposals(&self) -> Vec<MetadataChange> {
        self.proposals
            .lock()
            .map(|log| log.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Consensus for LocalConsensus {
    async fn current_leader(&self, collection: &str, shard_id: ShardId) -> Result<Option<PeerId>> {
        Ok(self
            .leaders
            .lock()
            .map_err(|_| Error::poisoned("leaders"))?
            .get(&(collection.to_string(), shard_id))
            .copied())
    }

    /// The durable leader when it is a candidate, otherwise the lowest peer id
    async fn elect(
        &self,
        collection: &str,
        shard_id: ShardId,
        candidates: &[PeerId],
    ) -> Result<PeerId> {
        if let Some(leader) = self.current_leader(collection, shard_id).await? {
            if candidates.contains(&leader) {
                return Ok(leader);
            }
        }
        candidates
            .iter()
            .min()
            .copied()
            .ok_or(Error::LeaderUnavailable(shard_id))
    }

    async fn propose(&self, change: MetadataChange) -> Result<()> {
        tracing::debug!("Agreed metadata change: {:?}", change);
        self.proposals
            .lock()
            .map_err(|_| Error::poisoned("proposals"))?
            .push(change);
        Ok(())
    }
}
