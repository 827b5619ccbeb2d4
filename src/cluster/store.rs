//! Topology store
//!
//! Single source of truth for every collection's [`ClusterTopology`].
//! Mutations are compare-and-swap on the revision: the caller names the
//! revision it last observed and a mismatch fails with
//! [`Error::Conflict`]. Each collection has its own lock, so unrelated
//! collections never wait on each other.

use crate::cluster::persist::{StoredTopology, TopologyPersistence};
use crate::cluster::{
    ClusterTopology, CollectionParams, PeerId, ReplicaStateChange, TopologyMutation,
};
use crate::common::{select_replicas, timestamp_now_millis, ClusterMetrics, Error, Result};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{broadcast, watch};

/// Upper bound on internal re-read/retry loops
const MAX_UPDATE_ATTEMPTS: usize = 32;

enum Slot {
    Healthy(ClusterTopology),
    Corrupted(String),
}

struct CollectionEntry {
    slot: Mutex<Slot>,
    revision: watch::Sender<u64>,
    /// Last operation id handed out
    operations: AtomicU64,
}

pub struct TopologyStore {
    collections: RwLock<HashMap<String, Arc<CollectionEntry>>>,
    persistence: Option<TopologyPersistence>,
    changes: broadcast::Sender<ReplicaStateChange>,
    metrics: Arc<ClusterMetrics>,
}

impl TopologyStore {
    /// Store without durability
    pub fn in_memory(metrics: Arc<ClusterMetrics>) -> Self {
        Self::with_persistence(None, metrics)
    }

    /// Open a RocksDB-backed store, loading every stored collection
    pub fn open(path: impl AsRef<Path>, metrics: Arc<ClusterMetrics>) -> Result<Self> {
        let persistence = TopologyPersistence::open(path)?;
        let records = persistence.load_all()?;
        let store = Self::with_persistence(Some(persistence), metrics);

        {
            let mut collections = store
                .collections
                .write()
                .map_err(|_| Error::poisoned("collections"))?;
            for record in records {
                let (name, slot, revision) = match record {
                    StoredTopology::Valid(topology) => {
                        tracing::info!(
                            "Loaded topology of {} at revision {}",
                            topology.collection,
                            topology.revision
                        );
                        let revision = topology.revision;
                        (topology.collection.clone(), Slot::Healthy(topology), revision)
                    }
                    StoredTopology::Corrupted { collection, reason } => {
                        tracing::error!(
                            "Topology of {} is corrupted ({}), halting mutations",
                            collection,
                            reason
                        );
                        (collection, Slot::Corrupted(reason), 0)
                    }
                };
                collections.insert(name, Arc::new(CollectionEntry::new(slot, revision)));
            }
        }

        Ok(store)
    }

    fn with_persistence(
        persistence: Option<TopologyPersistence>,
        metrics: Arc<ClusterMetrics>,
    ) -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            collections: RwLock::new(HashMap::new()),
            persistence,
            changes,
            metrics,
        }
    }

    fn entry(&self, collection: &str) -> Result<Arc<CollectionEntry>> {
        self.collections
            .read()
            .map_err(|_| Error::poisoned("collections"))?
            .get(collection)
            .cloned()
            .ok_or_else(|| Error::CollectionNotFound(collection.to_string()))
    }

    // === Collection lifecycle ===

    /// Create a collection, placing `replication_factor` active replicas of
    /// each shard on `peers` with HRW hashing.
    pub fn create_collection(
        &self,
        name: &str,
        params: CollectionParams,
        peers: &[PeerId],
    ) -> Result<ClusterTopology> {
        params.validate()?;
        if peers.len() < params.replication_factor as usize {
            return Err(Error::BadRequest(format!(
                "replication factor {} exceeds the {} known peers",
                params.replication_factor,
                peers.len()
            )));
        }

        let placement = (0..params.shard_number)
            .map(|shard_id| {
                select_replicas(
                    &format!("{}-shard-{}", name, shard_id),
                    peers,
                    params.replication_factor as usize,
                )
            })
            .collect();
        let topology = ClusterTopology::new(name, params, placement);

        let mut collections = self
            .collections
            .write()
            .map_err(|_| Error::poisoned("collections"))?;
        if collections.contains_key(name) {
            return Err(Error::CollectionExists(name.to_string()));
        }
        if let Some(persistence) = &self.persistence {
            persistence.save(&topology)?;
        }
        collections.insert(
            name.to_string(),
            Arc::new(CollectionEntry::new(
                Slot::Healthy(topology.clone()),
                topology.revision,
            )),
        );

        tracing::info!(
            "Created collection {} ({} shards x {} replicas)",
            name,
            params.shard_number,
            params.replication_factor
        );
        Ok(topology)
    }

    pub fn drop_collection(&self, name: &str) -> Result<()> {
        let mut collections = self
            .collections
            .write()
            .map_err(|_| Error::poisoned("collections"))?;
        if !collections.contains_key(name) {
            return Err(Error::CollectionNotFound(name.to_string()));
        }
        if let Some(persistence) = &self.persistence {
            persistence.delete(name)?;
        }
        collections.remove(name);
        tracing::info!("Dropped collection {}", name);
        Ok(())
    }

    /// Remove a corrupted record so the collection can be recreated.
    pub fn purge_corrupted(&self, name: &str) -> Result<()> {
        let entry = self.entry(name)?;
        let corrupted = matches!(
            *entry.slot.lock().map_err(|_| Error::poisoned("topology"))?,
            Slot::Corrupted(_)
        );
        if !corrupted {
            return Err(Error::BadRequest(format!(
                "topology of {} is not corrupted",
                name
            )));
        }
        tracing::warn!("Purging corrupted topology of {}", name);
        self.drop_collection(name)
    }

    pub fn list_collections(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self
            .collections
            .read()
            .map_err(|_| Error::poisoned("collections"))?
            .keys()
            .cloned()
            .collect();
        names.sort();
        Ok(names)
    }

    // === Reads ===

    /// Snapshot of the current topology
    pub fn get_topology(&self, collection: &str) -> Result<ClusterTopology> {
        let entry = self.entry(collection)?;
        let slot = entry.slot.lock().map_err(|_| Error::poisoned("topology"))?;
        match &*slot {
            Slot::Healthy(topology) => Ok(topology.clone()),
            Slot::Corrupted(_) => Err(Error::TopologyCorrupted(collection.to_string())),
        }
    }

    pub fn metrics(&self) -> &Arc<ClusterMetrics> {
        &self.metrics
    }

    pub fn revision(&self, collection: &str) -> Result<u64> {
        Ok(*self.entry(collection)?.revision.borrow())
    }

    /// Next operation id of a collection, shared by every coordinator
    /// writing through this store. Ids are strictly increasing and never
    /// fall behind the wall clock, so they stay ahead of ids issued before
    /// a restart.
    pub fn next_operation_id(&self, collection: &str) -> Result<u64> {
        let entry = self.entry(collection)?;
        let floor = timestamp_now_millis().saturating_mul(1000);
        let next = |last: u64| last.saturating_add(1).max(floor);
        let previous = match entry
            .operations
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| Some(next(last)))
        {
            Ok(previous) | Err(previous) => previous,
        };
        Ok(next(previous))
    }

    // === Mutations ===

    /// Apply one mutation if `expected_revision` is still current
    pub fn apply(
        &self,
        collection: &str,
        expected_revision: u64,
        mutation: TopologyMutation,
    ) -> Result<u64> {
        self.apply_all(collection, expected_revision, vec![mutation])
    }

    /// Apply several mutations as a single revision bump
    pub fn apply_all(
        &self,
        collection: &str,
        expected_revision: u64,
        mutations: Vec<TopologyMutation>,
    ) -> Result<u64> {
        let entry = self.entry(collection)?;
        let mut slot = entry.slot.lock().map_err(|_| Error::poisoned("topology"))?;

        let current = match &*slot {
            Slot::Healthy(topology) => topology,
            Slot::Corrupted(_) => return Err(Error::TopologyCorrupted(collection.to_string())),
        };
        if current.revision != expected_revision {
            self.metrics.topology_conflicts.inc();
            return Err(Error::Conflict {
                collection: collection.to_string(),
                expected: expected_revision,
                actual: current.revision,
            });
        }

        let (mut draft, changes) = current.with_mutations(&mutations)?;
        if draft == *current {
            // Every mutation was a same-state retry
            return Ok(current.revision);
        }
        draft.revision = current.revision + 1;

        if let Some(persistence) = &self.persistence {
            persistence.save(&draft)?;
        }

        let revision = draft.revision;
        *slot = Slot::Healthy(draft);
        drop(slot);

        self.metrics.topology_commits.inc();
        entry.revision.send_replace(revision);
        for change in changes {
            tracing::info!(
                "{} shard {} on peer {}: {} -> {} (rev {})",
                change.collection,
                change.shard_id,
                change.peer_id,
                change.from.map_or("none".to_string(), |s| s.to_string()),
                change.to.map_or("none".to_string(), |s| s.to_string()),
                revision
            );
            let _ = self.changes.send(change);
        }
        tracing::debug!("{} committed revision {}", collection, revision);

        Ok(revision)
    }

    /// Re-read and retry on [`Error::Conflict`] until the mutations computed
    /// by `plan` commit. An empty plan commits nothing and returns `None`.
    pub fn update_with_retry<F>(&self, collection: &str, mut plan: F) -> Result<Option<u64>>
    where
        F: FnMut(&ClusterTopology) -> Result<Vec<TopologyMutation>>,
    {
        for _ in 0..MAX_UPDATE_ATTEMPTS {
            let topology = self.get_topology(collection)?;
            let mutations = plan(&topology)?;
            if mutations.is_empty() {
                return Ok(None);
            }
            match self.apply_all(collection, topology.revision, mutations) {
                Ok(revision) => return Ok(Some(revision)),
                Err(Error::Conflict { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(Error::Internal(format!(
            "topology of {} kept changing during {} attempts",
            collection, MAX_UPDATE_ATTEMPTS
        )))
    }

    // === Notifications ===

    /// Watch the revision of a collection
    pub fn subscribe_revisions(&self, collection: &str) -> Result<watch::Receiver<u64>> {
        Ok(self.entry(collection)?.revision.subscribe())
    }

    /// Every replica state change across all collections
    pub fn subscribe_replica_changes(&self) -> broadcast::Receiver<ReplicaStateChange> {
        self.changes.subscribe()
    }
}

impl CollectionEntry {
    fn new(slot: Slot, revision: u64) -> Self {
        let (tx, _) = watch::channel(revision);
        Self {
            slot: Mutex::new(slot),
            revision: tx,
            operations: AtomicU64::new(0),
        }
    }
}
