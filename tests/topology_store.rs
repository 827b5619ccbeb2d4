//! Concurrent topology mutation and recovery of the durable store

use minivec::cluster::{
    CollectionParams, ReplicaState, TopologyMutation, TopologyStore,
};
use minivec::common::ClusterMetrics;
use minivec::Error;
use std::sync::Arc;

fn params() -> CollectionParams {
    CollectionParams {
        shard_number: 2,
        replication_factor: 2,
        write_consistency_factor: 1,
    }
}

fn store() -> Arc<TopologyStore> {
    Arc::new(TopologyStore::in_memory(Arc::new(ClusterMetrics::new())))
}

#[tokio::test]
async fn test_one_writer_wins_per_revision() {
    let store = store();
    store.create_collection("docs", params(), &[1, 2, 3]).unwrap();
    let revision = store.revision("docs").unwrap();

    let handles: Vec<_> = (10..18)
        .map(|peer_id| {
            let store = store.clone();
            tokio::spawn(async move {
                store.apply(
                    "docs",
                    revision,
                    TopologyMutation::AddReplica {
                        shard_id: 0,
                        peer_id,
                        state: ReplicaState::Initializing,
                    },
                )
            })
        })
        .collect();

    let mut committed = 0;
    let mut conflicts = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(new_revision) => {
                assert_eq!(new_revision, revision + 1);
                committed += 1;
            }
            Err(Error::Conflict { expected, .. }) => {
                assert_eq!(expected, revision);
                conflicts += 1;
            }
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
    assert_eq!(committed, 1);
    assert_eq!(conflicts, 7);
    assert_eq!(store.revision("docs").unwrap(), revision + 1);
    assert_eq!(store.metrics().topology_conflicts.get(), 7);
}

#[tokio::test]
async fn test_retrying_writers_all_commit() {
    let store = store();
    store.create_collection("docs", params(), &[1, 2, 3]).unwrap();
    let start = store.revision("docs").unwrap();

    let handles: Vec<_> = (10..18)
        .map(|peer_id| {
            let store = store.clone();
            tokio::task::spawn_blocking(move || {
                store.update_with_retry("docs", |_| {
                    Ok(vec![TopologyMutation::AddReplica {
                        shard_id: 1,
                        peer_id,
                        state: ReplicaState::Initializing,
                    }])
                })
            })
        })
        .collect();
    for handle in handles {
        assert!(handle.await.unwrap().unwrap().is_some());
    }

    let topology = store.get_topology("docs").unwrap();
    assert_eq!(topology.revision, start + 8);
    assert_eq!(topology.shard(1).unwrap().len(), 10);
}

#[tokio::test]
async fn test_revision_watch_sees_latest() {
    let store = store();
    store.create_collection("docs", params(), &[1, 2, 3]).unwrap();
    let mut revisions = store.subscribe_revisions("docs").unwrap();
    let start = *revisions.borrow_and_update();

    for peer_id in [20, 21, 22] {
        let revision = store.revision("docs").unwrap();
        store
            .apply(
                "docs",
                revision,
                TopologyMutation::AddReplica {
                    shard_id: 0,
                    peer_id,
                    state: ReplicaState::Initializing,
                },
            )
            .unwrap();
    }

    revisions.changed().await.unwrap();
    assert_eq!(*revisions.borrow_and_update(), start + 3);
}

#[test]
fn test_durable_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let revision = {
        let store = TopologyStore::open(dir.path(), Arc::new(ClusterMetrics::new())).unwrap();
        store.create_collection("docs", params(), &[1, 2, 3]).unwrap();
        store.create_collection("logs", params(), &[1, 2]).unwrap();
        let topology = store.get_topology("docs").unwrap();
        let peer_id = topology.shard(0).unwrap().peers_in(ReplicaState::Active)[0];
        store
            .apply(
                "docs",
                topology.revision,
                TopologyMutation::TransitionReplica {
                    shard_id: 0,
                    peer_id,
                    state: ReplicaState::Dead,
                },
            )
            .unwrap()
    };

    let store = TopologyStore::open(dir.path(), Arc::new(ClusterMetrics::new())).unwrap();
    assert_eq!(store.list_collections().unwrap(), vec!["docs", "logs"]);
    let topology = store.get_topology("docs").unwrap();
    assert_eq!(topology.revision, revision);
    assert_eq!(
        topology.shard(0).unwrap().peers_in(ReplicaState::Dead).len(),
        1
    );
}
