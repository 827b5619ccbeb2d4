//! Read consistency across an in-process three-peer cluster

use minivec::cluster::{
    CollectionParams, PointOperation, PointStruct, ReadConsistency, SearchRequest,
    SegmentStorage, ShardUpdate, WriteOrdering, WriteRequest,
};
use minivec::common::Config;
use minivec::coordinator::LocalCluster;
use minivec::Error;
use std::time::Duration;

fn config() -> Config {
    let mut config = Config::default();
    config.node.peer_id = 1;
    config.node.peers = vec![2, 3];
    config.consistency.fanout_timeout_ms = 500;
    config.consistency.replica_attempts = 2;
    config.consistency.retry_backoff_ms = 10;
    config
}

async fn cluster_with(shard_number: u32, replication_factor: u32) -> LocalCluster {
    let cluster = LocalCluster::new(&config()).unwrap();
    let params = CollectionParams {
        shard_number,
        replication_factor,
        write_consistency_factor: 1,
    };
    cluster
        .node(1)
        .unwrap()
        .admin
        .create_collection("docs", params)
        .await
        .unwrap();
    cluster
}

fn upsert(operation_id: u64, id: u64, vector: Vec<f32>) -> ShardUpdate {
    ShardUpdate {
        operation_id,
        operation: PointOperation::Upsert {
            points: vec![PointStruct {
                id,
                vector,
                payload: None,
            }],
        },
    }
}

/// Peers 1 and 2 hold point 42 at version 7, peer 3 still at version 6
async fn diverged_cluster() -> LocalCluster {
    let cluster = cluster_with(1, 3).await;
    for (peer, version) in [(1, 7), (2, 7), (3, 6)] {
        cluster
            .node(peer)
            .unwrap()
            .storage
            .apply("docs", 0, &upsert(version, 42, vec![0.5]))
            .await
            .unwrap();
    }
    cluster
}

#[tokio::test]
async fn test_all_excludes_partially_replicated_point() {
    let cluster = diverged_cluster().await;
    let reader = &cluster.node(1).unwrap().reader;

    let records = reader
        .retrieve("docs", &[42], ReadConsistency::All)
        .await
        .unwrap();
    assert!(records.is_empty());
}

#[tokio::test]
async fn test_majority_includes_agreeing_point() {
    let cluster = diverged_cluster().await;
    let reader = &cluster.node(1).unwrap().reader;

    // k = 2: the local replica and peer 2 agree on version 7
    let records = reader
        .retrieve("docs", &[42], ReadConsistency::Majority)
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].version, 7);

    let records = reader
        .retrieve("docs", &[42], ReadConsistency::Quorum)
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
}

#[tokio::test]
async fn test_explicit_factor_overrides_named_levels() {
    let cluster = diverged_cluster().await;
    let reader = &cluster.node(3).unwrap().reader;

    // Peer 3 answers alone with its stale version
    let records = reader
        .retrieve("docs", &[42], ReadConsistency::Factor(1))
        .await
        .unwrap();
    assert_eq!(records[0].version, 6);

    let err = reader
        .retrieve("docs", &[42], ReadConsistency::Factor(4))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::InsufficientReplicas {
            needed: 4,
            available: 3
        }
    ));
}

#[tokio::test]
async fn test_unreachable_replica_fails_all() {
    let cluster = diverged_cluster().await;
    cluster.network.set_unreachable(3, true);
    let reader = &cluster.node(1).unwrap().reader;

    let err = reader
        .retrieve("docs", &[42], ReadConsistency::All)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InsufficientReplicas { needed: 3, .. }));
    assert!(cluster.metrics.read_quorum_failures.get() >= 1);
}

#[tokio::test]
async fn test_spare_replica_replaces_failed_one() {
    let cluster = diverged_cluster().await;
    cluster.network.set_unreachable(2, true);
    let reader = &cluster.node(1).unwrap().reader;

    // Peer 2 fails, peer 3 answers with a different version: nothing agreed
    let records = reader
        .retrieve("docs", &[42], ReadConsistency::Majority)
        .await
        .unwrap();
    assert!(records.is_empty());

    cluster.network.set_unreachable(2, false);
    cluster.network.set_unreachable(3, true);
    let records = reader
        .retrieve("docs", &[42], ReadConsistency::Majority)
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
}

#[tokio::test]
async fn test_listener_not_counted() {
    let cluster = diverged_cluster().await;
    let node = cluster.node(1).unwrap();
    node.orchestrator()
        .set_listener("docs", 0, 3, true)
        .await
        .unwrap();
    cluster.network.set_unreachable(3, true);

    // Two readable replicas left, both at version 7
    let records = node
        .reader
        .retrieve("docs", &[42], ReadConsistency::All)
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].version, 7);
}

#[tokio::test]
async fn test_slow_replica_times_out() {
    let cluster = diverged_cluster().await;
    cluster.network.set_delay(2, Duration::from_secs(5));
    cluster.network.set_unreachable(3, true);
    let reader = &cluster.node(1).unwrap().reader;

    let err = reader
        .retrieve("docs", &[42], ReadConsistency::Majority)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InsufficientReplicas { .. }));
}

#[tokio::test]
async fn test_search_spans_shards() {
    let cluster = cluster_with(2, 1).await;
    let node = cluster.node(1).unwrap();

    let points: Vec<PointStruct> = (0..6)
        .map(|id| PointStruct {
            id,
            vector: vec![id as f32, 1.0],
            payload: None,
        })
        .collect();
    node.writer
        .update(WriteRequest {
            collection: "docs".into(),
            operation: PointOperation::Upsert { points },
            ordering: WriteOrdering::Weak,
            wait: true,
            shard: None,
        })
        .await
        .unwrap();

    let hits = node
        .reader
        .search(
            "docs",
            &SearchRequest {
                vector: vec![1.0, 0.0],
                limit: 3,
            },
            ReadConsistency::default(),
        )
        .await
        .unwrap();
    let ids: Vec<u64> = hits.iter().map(|hit| hit.id).collect();
    assert_eq!(ids, vec![5, 4, 3]);

    let records = node
        .reader
        .retrieve("docs", &[0, 1, 2, 3, 4, 5, 99], ReadConsistency::All)
        .await
        .unwrap();
    assert_eq!(records.len(), 6);
}
