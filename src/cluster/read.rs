//! Read consistency resolver
//!
//! A read against a shard queries `k` readable replicas (not Dead, not
//! Listener) and keeps only points that every responder returned at the same
//! version. Failed replicas are replaced by spare ones while any remain;
//! fewer than `k` answers fail the read instead of degrading it.

use crate::cluster::{
    PeerId, PeerTransport, PointId, Record, ScoredPoint, SearchRequest, SegmentStorage, ShardId,
    TopologyStore, Versioned,
};
use crate::common::{
    retry_with_backoff, shard_for_point, with_timeout, ConsistencyConfig, Error, Result,
};
use futures_util::future::join_all;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;

/// How many replicas must agree on a read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadConsistency {
    /// Exactly this many replicas, whatever the replica count
    Factor(usize),
    All,
    Majority,
    Quorum,
}

impl Default for ReadConsistency {
    fn default() -> Self {
        ReadConsistency::Factor(1)
    }
}

impl ReadConsistency {
    /// Number of replicas to query out of `eligible` readable ones
    pub fn required_replicas(&self, eligible: usize) -> Result<usize> {
        let needed = match self {
            ReadConsistency::Factor(0) => {
                return Err(Error::BadRequest("read consistency factor must be positive".into()))
            }
            ReadConsistency::Factor(n) => *n,
            ReadConsistency::All => eligible,
            ReadConsistency::Majority | ReadConsistency::Quorum => eligible / 2 + 1,
        };
        if eligible == 0 || needed > eligible {
            return Err(Error::InsufficientReplicas {
                needed: needed.max(1),
                available: eligible,
            });
        }
        Ok(needed)
    }
}

impl FromStr for ReadConsistency {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "all" => Ok(ReadConsistency::All),
            "majority" => Ok(ReadConsistency::Majority),
            "quorum" => Ok(ReadConsistency::Quorum),
            other => other
                .parse::<usize>()
                .map(ReadConsistency::Factor)
                .map_err(|_| Error::BadRequest(format!("unknown read consistency: {}", s))),
        }
    }
}

impl std::fmt::Display for ReadConsistency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReadConsistency::Factor(n) => write!(f, "{}", n),
            ReadConsistency::All => write!(f, "all"),
            ReadConsistency::Majority => write!(f, "majority"),
            ReadConsistency::Quorum => write!(f, "quorum"),
        }
    }
}

impl Serialize for ReadConsistency {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            ReadConsistency::Factor(n) => serializer.serialize_u64(*n as u64),
            named => serializer.serialize_str(&named.to_string()),
        }
    }
}

impl<'de> Deserialize<'de> for ReadConsistency {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Factor(usize),
            Named(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Factor(n) => Ok(ReadConsistency::Factor(n)),
            Raw::Named(name) => name.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// Keep the entries every response agrees on, by point id and version,
/// in the order of the first response.
pub fn merge_agreed<T: Versioned>(responses: Vec<Vec<T>>) -> Vec<T> {
    let mut responses = responses.into_iter();
    let Some(first) = responses.next() else {
        return Vec::new();
    };
    let others: Vec<HashSet<(PointId, u64)>> = responses
        .map(|response| {
            response
                .iter()
                .map(|p| (p.point_id(), p.version()))
                .collect()
        })
        .collect();

    first
        .into_iter()
        .filter(|p| {
            others
                .iter()
                .all(|seen| seen.contains(&(p.point_id(), p.version())))
        })
        .collect()
}

pub struct ReadResolver {
    peer_id: PeerId,
    store: Arc<TopologyStore>,
    storage: Arc<dyn SegmentStorage>,
    transport: Arc<dyn PeerTransport>,
    config: ConsistencyConfig,
}

impl ReadResolver {
    pub fn new(
        peer_id: PeerId,
        store: Arc<TopologyStore>,
        storage: Arc<dyn SegmentStorage>,
        transport: Arc<dyn PeerTransport>,
        config: ConsistencyConfig,
    ) -> Self {
        Self {
            peer_id,
            store,
            storage,
            transport,
            config,
        }
    }

    /// Fetch points by id
    pub async fn retrieve(
        &self,
        collection: &str,
        ids: &[PointId],
        consistency: ReadConsistency,
    ) -> Result<Vec<Record>> {
        self.store.metrics().reads.inc();
        let topology = self.store.get_topology(collection)?;

        let mut by_shard: BTreeMap<ShardId, Vec<PointId>> = BTreeMap::new();
        for id in ids {
            by_shard
                .entry(shard_for_point(*id, topology.params.shard_number))
                .or_default()
                .push(*id);
        }

        let mut shards = Vec::with_capacity(by_shard.len());
        for (shard_id, ids) in &by_shard {
            shards.push((*shard_id, topology.shard(*shard_id)?.readable_peers(), ids));
        }

        let results = join_all(shards.into_iter().map(move |(shard_id, peers, ids)| async move {
            let responses = self
                .query_replicas(shard_id, peers, consistency, move |peer| async move {
                    if peer == self.peer_id {
                        self.storage.retrieve(collection, shard_id, ids).await
                    } else {
                        self.transport.retrieve(peer, collection, shard_id, ids).await
                    }
                })
                .await?;
            Ok::<_, Error>(merge_agreed(responses))
        }))
        .await;

        let mut records = Vec::new();
        for result in results {
            records.extend(result?);
        }
        records.sort_by_key(|r| r.id);
        Ok(records)
    }

    /// Nearest-neighbour search across every shard
    pub async fn search(
        &self,
        collection: &str,
        request: &SearchRequest,
        consistency: ReadConsistency,
    ) -> Result<Vec<ScoredPoint>> {
        self.store.metrics().reads.inc();
        let topology = self.store.get_topology(collection)?;

        let results = join_all(topology.shards.iter().map(move |(shard_id, replicas)| {
            let shard_id = *shard_id;
            let peers = replicas.readable_peers();
            async move {
                let responses = self
                    .query_replicas(shard_id, peers, consistency, move |peer| async move {
                        if peer == self.peer_id {
                            self.storage.search(collection, shard_id, request).await
                        } else {
                            self.transport
                                .search(peer, collection, shard_id, request)
                                .await
                        }
                    })
                    .await?;
                Ok::<_, Error>(merge_agreed(responses))
            }
        }))
        .await;

        let mut hits = Vec::new();
        for result in results {
            hits.extend(result?);
        }
        hits.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.id.cmp(&b.id)));
        hits.truncate(request.limit);
        Ok(hits)
    }

    /// Collect `k` responses from `peers`, local replica first, moving on to
    /// spare replicas when one fails.
    async fn query_replicas<T, F, Fut>(
        &self,
        shard_id: ShardId,
        mut peers: Vec<PeerId>,
        consistency: ReadConsistency,
        query: F,
    ) -> Result<Vec<Vec<T>>>
    where
        F: Fn(PeerId) -> Fut,
        Fut: Future<Output = Result<Vec<T>>>,
    {
        let needed = match consistency.required_replicas(peers.len()) {
            Ok(needed) => needed,
            Err(e) => {
                if matches!(e, Error::InsufficientReplicas { .. }) {
                    self.store.metrics().read_quorum_failures.inc();
                }
                return Err(e);
            }
        };
        peers.sort_by_key(|peer| *peer != self.peer_id);

        let timeout = self.config.fanout_timeout();
        let mut responses = Vec::with_capacity(needed);
        let mut candidates = peers.into_iter();
        while responses.len() < needed {
            let batch: Vec<PeerId> = candidates
                .by_ref()
                .take(needed - responses.len())
                .collect();
            if batch.is_empty() {
                break;
            }

            let results = join_all(batch.iter().map(|peer| {
                retry_with_backoff(
                    || with_timeout(timeout, "replica read", query(*peer)),
                    self.config.replica_attempts,
                    self.config.retry_backoff(),
                )
            }))
            .await;

            for (peer, result) in batch.into_iter().zip(results) {
                match result {
                    Ok(response) => responses.push(response),
                    Err(e) => tracing::warn!(
                        "Replica of shard {} on peer {} did not answer: {}",
                        shard_id,
                        peer,
                        e
                    ),
                }
            }
        }

        if responses.len() < needed {
            self.store.metrics().read_quorum_failures.inc();
            return Err(Error::InsufficientReplicas {
                needed,
                available: responses.len(),
            });
        }
        Ok(responses)
    }
}
