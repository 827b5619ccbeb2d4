//! Shard transfer orchestrator
//!
//! Drives move/replicate/abort/drop against the topology store. Copying is
//! delegated to a [`BulkTransfer`] collaborator and runs in a spawned task
//! that checks a cancellation signal between chunks and publishes progress
//! through a watch channel.

use crate::cluster::{
    BulkTransfer, ClusterSetupRequest, PeerId, ReplicaState, ShardId, ShardTransfer,
    TopologyMutation, TopologyStore, TransferKey,
};
use crate::common::{retry_with_backoff, with_timeout, Error, Result, TransferConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferProgress {
    pub chunks_done: u64,
    /// Unknown until the bulk transfer has started
    pub chunks_total: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferOutcome {
    Completed,
    Failed(String),
    Aborted,
}

struct TransferTask {
    cancel: watch::Sender<bool>,
    progress: watch::Receiver<TransferProgress>,
    outcome: watch::Receiver<Option<TransferOutcome>>,
}

impl TransferTask {
    fn is_running(&self) -> bool {
        self.outcome.borrow().is_none()
    }
}

type TaskKey = (String, TransferKey);

#[derive(Clone)]
pub struct ShardTransferOrchestrator {
    store: Arc<TopologyStore>,
    bulk: Arc<dyn BulkTransfer>,
    config: TransferConfig,
    tasks: Arc<Mutex<HashMap<TaskKey, TransferTask>>>,
}

impl ShardTransferOrchestrator {
    pub fn new(
        store: Arc<TopologyStore>,
        bulk: Arc<dyn BulkTransfer>,
        config: TransferConfig,
    ) -> Self {
        Self {
            store,
            bulk,
            config,
            tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Relocate a shard replica from `from` to `to`
    pub async fn move_shard(
        &self,
        collection: &str,
        shard_id: ShardId,
        from: PeerId,
        to: PeerId,
    ) -> Result<ShardTransfer> {
        self.start_transfer(collection, TransferKey { shard_id, from, to }, false)
    }

    /// Add (or refresh) a replica on `to`, keeping the source
    pub async fn replicate_shard(
        &self,
        collection: &str,
        shard_id: ShardId,
        from: PeerId,
        to: PeerId,
    ) -> Result<ShardTransfer> {
        self.start_transfer(collection, TransferKey { shard_id, from, to }, true)
    }

    fn start_transfer(&self, collection: &str, key: TransferKey, sync: bool) -> Result<ShardTransfer> {
        if key.from == key.to {
            return Err(Error::BadRequest(
                "transfer source and destination are the same peer".into(),
            ));
        }

        let topology = self.store.get_topology(collection)?;
        let shard = topology.shard(key.shard_id)?;

        if let Some(existing) = topology.transfer_into(key.shard_id, key.to) {
            if existing.key() == key && existing.sync == sync {
                let existing = existing.clone();
                tracing::debug!("{} {} already in flight", collection, key);
                self.ensure_running(collection, &existing)?;
                return Ok(existing);
            }
            return Err(Error::TransferInProgress {
                shard_id: key.shard_id,
                to: key.to,
            });
        }

        match shard.get(key.from) {
            Some(ReplicaState::Active) => {}
            Some(state) => {
                return Err(Error::BadRequest(format!(
                    "source replica of shard {} on peer {} is {}, not active",
                    key.shard_id, key.from, state
                )))
            }
            None => {
                return Err(Error::ReplicaNotFound {
                    shard_id: key.shard_id,
                    peer_id: key.from,
                })
            }
        }

        let add = |state| TopologyMutation::AddReplica {
            shard_id: key.shard_id,
            peer_id: key.to,
            state,
        };
        let transition = |state| TopologyMutation::TransitionReplica {
            shard_id: key.shard_id,
            peer_id: key.to,
            state,
        };

        let mut mutations = Vec::new();
        match (shard.get(key.to), sync) {
            (None, false) => mutations.push(add(ReplicaState::Initializing)),
            (None, true) => mutations.push(add(ReplicaState::Partial)),
            (Some(ReplicaState::Dead), _) => mutations.push(transition(ReplicaState::Initializing)),
            (Some(ReplicaState::Initializing), _) => {}
            (Some(ReplicaState::Active), true) => mutations.push(transition(ReplicaState::Partial)),
            (Some(ReplicaState::Partial), true) => {}
            (Some(ReplicaState::Listener), true) => {
                return Err(Error::IllegalTransition {
                    shard_id: key.shard_id,
                    peer_id: key.to,
                    from: ReplicaState::Listener,
                    to: ReplicaState::Partial,
                })
            }
            (Some(state), false) => {
                return Err(Error::BadRequest(format!(
                    "peer {} already holds a {} replica of shard {}",
                    key.to, state, key.shard_id
                )))
            }
        }

        let transfer = ShardTransfer::new(key, sync);
        mutations.push(TopologyMutation::BeginTransfer(transfer.clone()));
        let revision = self
            .store
            .apply_all(collection, topology.revision, mutations)?;

        self.store.metrics().transfers_started.inc();
        tracing::info!(
            "Started {} of {} {} (rev {})",
            if sync { "replication" } else { "move" },
            collection,
            key,
            revision
        );

        self.spawn(collection, transfer.clone())?;
        Ok(transfer)
    }

    /// Cancel an in-flight transfer; the destination replica ends up Dead
    pub async fn abort_transfer(
        &self,
        collection: &str,
        shard_id: ShardId,
        from: PeerId,
        to: PeerId,
    ) -> Result<()> {
        let key = TransferKey { shard_id, from, to };
        let topology = self.store.get_topology(collection)?;
        let transfer = topology
            .transfer(&key)
            .cloned()
            .ok_or(Error::TransferNotFound { shard_id, from, to })?;

        self.store.apply_all(
            collection,
            topology.revision,
            vec![
                TopologyMutation::EndTransfer(key),
                TopologyMutation::TransitionReplica {
                    shard_id,
                    peer_id: to,
                    state: ReplicaState::Dead,
                },
            ],
        )?;

        if let Some(task) = self
            .tasks
            .lock()
            .map_err(|_| Error::poisoned("transfer tasks"))?
            .get(&(collection.to_string(), key))
        {
            task.cancel.send_replace(true);
        }
        if let Err(e) = self.bulk.cancel(collection, &transfer).await {
            tracing::warn!("Bulk transfer cleanup of {} {} failed: {}", collection, key, e);
        }

        self.store.metrics().transfers_aborted.inc();
        tracing::info!("Aborted transfer of {} {}", collection, key);
        Ok(())
    }

    /// Remove a replica outright.
    ///
    /// Rejected while the replica takes part in a transfer, or if it is the
    /// last Active/Partial replica of the shard.
    pub async fn drop_replica(
        &self,
        collection: &str,
        shard_id: ShardId,
        peer_id: PeerId,
    ) -> Result<()> {
        let topology = self.store.get_topology(collection)?;
        let revision = self.store.apply(
            collection,
            topology.revision,
            TopologyMutation::RemoveReplica { shard_id, peer_id },
        )?;
        tracing::info!(
            "Dropped replica of {} shard {} on peer {} (rev {})",
            collection,
            shard_id,
            peer_id,
            revision
        );
        Ok(())
    }

    /// Toggle a replica between Active and Listener
    pub async fn set_listener(
        &self,
        collection: &str,
        shard_id: ShardId,
        peer_id: PeerId,
        listener: bool,
    ) -> Result<()> {
        let state = if listener {
            ReplicaState::Listener
        } else {
            ReplicaState::Active
        };
        let topology = self.store.get_topology(collection)?;
        self.store.apply(
            collection,
            topology.revision,
            TopologyMutation::TransitionReplica {
                shard_id,
                peer_id,
                state,
            },
        )?;
        Ok(())
    }

    /// Run a cluster-setup request. Returns the transfer it started, if any.
    pub async fn execute(
        &self,
        collection: &str,
        request: &ClusterSetupRequest,
    ) -> Result<Option<TransferKey>> {
        match request {
            ClusterSetupRequest::MoveShard(op) => self
                .move_shard(collection, op.shard_id, op.from_peer_id, op.to_peer_id)
                .await
                .map(|t| Some(t.key())),
            ClusterSetupRequest::ReplicateShard(op) => self
                .replicate_shard(collection, op.shard_id, op.from_peer_id, op.to_peer_id)
                .await
                .map(|t| Some(t.key())),
            ClusterSetupRequest::AbortTransfer(op) => self
                .abort_transfer(collection, op.shard_id, op.from_peer_id, op.to_peer_id)
                .await
                .map(|_| None),
            ClusterSetupRequest::DropReplica(op) => self
                .drop_replica(collection, op.shard_id, op.peer_id)
                .await
                .map(|_| None),
            ClusterSetupRequest::SetListener(op) => self
                .set_listener(collection, op.shard_id, op.peer_id, op.listener)
                .await
                .map(|_| None),
        }
    }

    pub fn transfer_progress(&self, collection: &str, key: TransferKey) -> Result<TransferProgress> {
        if let Some(task) = self
            .tasks
            .lock()
            .map_err(|_| Error::poisoned("transfer tasks"))?
            .get(&(collection.to_string(), key))
        {
            return Ok(*task.progress.borrow());
        }
        match self.store.get_topology(collection)?.transfer(&key) {
            Some(_) => Ok(TransferProgress::default()),
            None => Err(Error::TransferNotFound {
                shard_id: key.shard_id,
                from: key.from,
                to: key.to,
            }),
        }
    }

    /// Wait up to `timeout` for a transfer to finish. `None` means still running.
    pub async fn wait_transfer(
        &self,
        collection: &str,
        key: TransferKey,
        timeout: Duration,
    ) -> Result<Option<TransferOutcome>> {
        let outcome = self
            .tasks
            .lock()
            .map_err(|_| Error::poisoned("transfer tasks"))?
            .get(&(collection.to_string(), key))
            .map(|task| task.outcome.clone());

        let Some(mut outcome) = outcome else {
            // Not driven by this node
            return match self.store.get_topology(collection)?.transfer(&key) {
                Some(_) => Ok(None),
                None => Err(Error::TransferNotFound {
                    shard_id: key.shard_id,
                    from: key.from,
                    to: key.to,
                }),
            };
        };

        let done = outcome.wait_for(|o| o.is_some());
        let finished = match tokio::time::timeout(timeout, done).await {
            Ok(Ok(finished)) => Ok(finished.clone()),
            Ok(Err(_)) => Err(Error::Internal(format!(
                "transfer task of {} {} vanished",
                collection, key
            ))),
            Err(_) => Ok(None),
        };
        finished
    }

    /// Restart copy tasks for transfers recorded in the topology, e.g. after a restart
    pub fn resume_transfers(&self, collection: &str) -> Result<usize> {
        let topology = self.store.get_topology(collection)?;
        let mut resumed = 0;
        for transfer in &topology.transfers {
            if self.ensure_running(collection, transfer)? {
                tracing::info!("Resumed transfer of {} {}", collection, transfer.key());
                resumed += 1;
            }
        }
        Ok(resumed)
    }

    fn ensure_running(&self, collection: &str, transfer: &ShardTransfer) -> Result<bool> {
        let running = self
            .tasks
            .lock()
            .map_err(|_| Error::poisoned("transfer tasks"))?
            .get(&(collection.to_string(), transfer.key()))
            .map_or(false, TransferTask::is_running);
        if running {
            return Ok(false);
        }
        self.spawn(collection, transfer.clone())?;
        Ok(true)
    }

    fn spawn(&self, collection: &str, transfer: ShardTransfer) -> Result<()> {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (progress_tx, progress_rx) = watch::channel(TransferProgress::default());
        let (outcome_tx, outcome_rx) = watch::channel(None);

        self.tasks
            .lock()
            .map_err(|_| Error::poisoned("transfer tasks"))?
            .insert(
                (collection.to_string(), transfer.key()),
                TransferTask {
                    cancel: cancel_tx,
                    progress: progress_rx,
                    outcome: outcome_rx,
                },
            );

        let this = self.clone();
        let collection = collection.to_string();
        tokio::spawn(async move {
            let cancel = cancel_rx.clone();
            let copied = this.copy(&collection, &transfer, cancel_rx, progress_tx).await;
            let outcome = match copied {
                _ if *cancel.borrow() => {
                    tracing::info!("Transfer of {} {} cancelled", collection, transfer.key());
                    TransferOutcome::Aborted
                }
                Ok(true) => this.complete(&collection, &transfer),
                Ok(false) => TransferOutcome::Aborted,
                Err(e) => this.fail(&collection, &transfer, e.to_string()).await,
            };
            outcome_tx.send_replace(Some(outcome));
        });
        Ok(())
    }

    /// Copy every chunk. `Ok(false)` when cancelled.
    async fn copy(
        &self,
        collection: &str,
        transfer: &ShardTransfer,
        cancel: watch::Receiver<bool>,
        progress: watch::Sender<TransferProgress>,
    ) -> Result<bool> {
        let attempts = self.config.max_attempts;
        let backoff = self.config.initial_backoff();
        let chunk_timeout = self.config.chunk_timeout();

        let chunks = retry_with_backoff(
            || self.bulk.start(collection, transfer),
            attempts,
            backoff,
        )
        .await?;
        progress.send_replace(TransferProgress {
            chunks_done: 0,
            chunks_total: Some(chunks),
        });

        for chunk in 0..chunks {
            let cancelled = *cancel.borrow();
            if cancelled {
                return Ok(false);
            }
            retry_with_backoff(
                || {
                    with_timeout(
                        chunk_timeout,
                        "transfer chunk",
                        self.bulk.copy_chunk(collection, transfer, chunk),
                    )
                },
                attempts,
                backoff,
            )
            .await?;
            progress.send_modify(|p| p.chunks_done = chunk + 1);
        }

        let cancelled = *cancel.borrow();
        Ok(!cancelled)
    }

    fn complete(&self, collection: &str, transfer: &ShardTransfer) -> TransferOutcome {
        let key = transfer.key();
        let mut outcome = TransferOutcome::Completed;

        let result = self.store.update_with_retry(collection, |topology| {
            // Ended, or replaced by a newer transfer between the same peers
            if topology.transfer(&key) != Some(transfer) {
                outcome = TransferOutcome::Aborted;
                return Ok(Vec::new());
            }
            if topology.replica_state(key.shard_id, key.to) == Some(ReplicaState::Dead) {
                outcome = TransferOutcome::Failed("destination replica was marked dead".into());
                return Ok(vec![TopologyMutation::EndTransfer(key)]);
            }

            outcome = TransferOutcome::Completed;
            let mut mutations = vec![
                TopologyMutation::EndTransfer(key),
                TopologyMutation::TransitionReplica {
                    shard_id: key.shard_id,
                    peer_id: key.to,
                    state: ReplicaState::Active,
                },
            ];
            if !transfer.sync {
                let source_busy = topology
                    .transfers_involving(key.shard_id, key.from)
                    .any(|t| t.key() != key);
                if source_busy {
                    tracing::warn!(
                        "Keeping source of {} {}: it feeds another transfer",
                        collection,
                        key
                    );
                } else {
                    mutations.push(TopologyMutation::RemoveReplica {
                        shard_id: key.shard_id,
                        peer_id: key.from,
                    });
                }
            }
            Ok(mutations)
        });

        let metrics = self.store.metrics();
        match (result, outcome) {
            (Ok(_), TransferOutcome::Completed) => {
                metrics.transfers_completed.inc();
                tracing::info!("Completed transfer of {} {}", collection, key);
                TransferOutcome::Completed
            }
            (Ok(_), TransferOutcome::Failed(reason)) => {
                metrics.transfers_failed.inc();
                tracing::warn!("Transfer of {} {} failed: {}", collection, key, reason);
                TransferOutcome::Failed(reason)
            }
            (Ok(_), TransferOutcome::Aborted) => TransferOutcome::Aborted,
            (Err(e), _) => {
                metrics.transfers_failed.inc();
                tracing::error!("Cannot finalize transfer of {} {}: {}", collection, key, e);
                TransferOutcome::Failed(e.to_string())
            }
        }
    }

    async fn fail(&self, collection: &str, transfer: &ShardTransfer, reason: String) -> TransferOutcome {
        let key = transfer.key();
        tracing::warn!(
            "{}",
            Error::TransferFailed {
                shard_id: key.shard_id,
                from: key.from,
                to: key.to,
                reason: reason.clone(),
            }
        );
        if let Err(e) = self.bulk.cancel(collection, transfer).await {
            tracing::debug!("Bulk transfer cleanup of {} {} failed: {}", collection, key, e);
        }

        let mut aborted = false;
        let result = self.store.update_with_retry(collection, |topology| {
            if topology.transfer(&key) != Some(transfer) {
                aborted = true;
                return Ok(Vec::new());
            }
            let teardown = vec![
                TopologyMutation::EndTransfer(key),
                TopologyMutation::TransitionReplica {
                    shard_id: key.shard_id,
                    peer_id: key.to,
                    state: ReplicaState::Dead,
                },
            ];
            match topology.with_mutations(&teardown) {
                Err(Error::LastLiveReplica { .. }) => {
                    tracing::warn!(
                        "Destination of {} {} is the last live copy, leaving it in place",
                        collection,
                        key
                    );
                    Ok(vec![TopologyMutation::EndTransfer(key)])
                }
                _ => Ok(teardown),
            }
        });

        if aborted {
            return TransferOutcome::Aborted;
        }
        if let Err(e) = result {
            tracing::error!("Cannot record failed transfer of {} {}: {}", collection, key, e);
        }
        self.store.metrics().transfers_failed.inc();
        TransferOutcome::Failed(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::CollectionParams;
    use crate::common::ClusterMetrics;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    /// Bulk transfer whose behaviour is scripted by the test
    #[derive(Default)]
    struct ScriptedBulk {
        chunks: u64,
        chunk_delay_ms: u64,
        fail: AtomicBool,
        /// Fail only the chunks of the first transfer started
        fail_first: bool,
        first: Mutex<Option<ShardTransfer>>,
        copied: AtomicU64,
    }

    #[async_trait]
    impl BulkTransfer for ScriptedBulk {
        async fn start(&self, _collection: &str, transfer: &ShardTransfer) -> Result<u64> {
            self.first
                .lock()
                .unwrap()
                .get_or_insert_with(|| transfer.clone());
            Ok(self.chunks)
        }

        async fn copy_chunk(
            &self,
            _collection: &str,
            transfer: &ShardTransfer,
            _chunk: u64,
        ) -> Result<()> {
            tokio::time::sleep(Duration::from_millis(self.chunk_delay_ms)).await;
            let is_first = self.first.lock().unwrap().as_ref() == Some(transfer);
            if self.fail.load(Ordering::SeqCst) || (self.fail_first && is_first) {
                return Err(Error::PeerUnreachable {
                    peer_id: transfer.to,
                    reason: "injected".into(),
                });
            }
            self.copied.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn cancel(&self, _collection: &str, _transfer: &ShardTransfer) -> Result<()> {
            Ok(())
        }
    }

    fn setup(bulk: ScriptedBulk) -> (Arc<TopologyStore>, Arc<ScriptedBulk>, ShardTransferOrchestrator) {
        let store = Arc::new(TopologyStore::in_memory(Arc::new(ClusterMetrics::new())));
        store
            .create_collection(
                "docs",
                CollectionParams {
                    shard_number: 1,
                    replication_factor: 1,
                    write_consistency_factor: 1,
                },
                &[1],
            )
            .unwrap();
        let bulk = Arc::new(bulk);
        let orchestrator = ShardTransferOrchestrator::new(
            store.clone(),
            bulk.clone(),
            TransferConfig {
                max_attempts: 2,
                initial_backoff_ms: 1,
                chunk_timeout_ms: 1_000,
            },
        );
        (store, bulk, orchestrator)
    }

    fn key(from: PeerId, to: PeerId) -> TransferKey {
        TransferKey {
            shard_id: 0,
            from,
            to,
        }
    }

    #[tokio::test]
    async fn test_move_completes() {
        let (store, bulk, orchestrator) = setup(ScriptedBulk {
            chunks: 3,
            ..Default::default()
        });

        orchestrator.move_shard("docs", 0, 1, 2).await.unwrap();
        let outcome = orchestrator
            .wait_transfer("docs", key(1, 2), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(outcome, Some(TransferOutcome::Completed));

        let topology = store.get_topology("docs").unwrap();
        assert_eq!(topology.replica_state(0, 2), Some(ReplicaState::Active));
        assert_eq!(topology.replica_state(0, 1), None);
        assert!(topology.transfers.is_empty());
        assert_eq!(bulk.copied.load(Ordering::SeqCst), 3);

        let progress = orchestrator.transfer_progress("docs", key(1, 2)).unwrap();
        assert_eq!(progress.chunks_done, 3);
        assert_eq!(progress.chunks_total, Some(3));
    }

    #[tokio::test]
    async fn test_failed_copy_marks_destination_dead() {
        let (store, _bulk, orchestrator) = setup(ScriptedBulk {
            chunks: 2,
            fail: AtomicBool::new(true),
            ..Default::default()
        });

        orchestrator.move_shard("docs", 0, 1, 2).await.unwrap();
        let outcome = orchestrator
            .wait_transfer("docs", key(1, 2), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(matches!(outcome, Some(TransferOutcome::Failed(_))));

        let topology = store.get_topology("docs").unwrap();
        assert_eq!(topology.replica_state(0, 2), Some(ReplicaState::Dead));
        assert_eq!(topology.replica_state(0, 1), Some(ReplicaState::Active));
        assert_eq!(store.metrics().transfers_failed.get(), 1);
    }

    #[tokio::test]
    async fn test_reissue_returns_same_transfer() {
        let (store, _bulk, orchestrator) = setup(ScriptedBulk {
            chunks: 50,
            chunk_delay_ms: 20,
            ..Default::default()
        });

        let first = orchestrator.replicate_shard("docs", 0, 1, 2).await.unwrap();
        let second = orchestrator.replicate_shard("docs", 0, 1, 2).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(store.get_topology("docs").unwrap().transfers.len(), 1);

        // A move into the same destination is a different request
        assert!(matches!(
            orchestrator.move_shard("docs", 0, 1, 2).await,
            Err(Error::TransferInProgress { shard_id: 0, to: 2 })
        ));

        orchestrator.abort_transfer("docs", 0, 1, 2).await.unwrap();
    }

    #[tokio::test]
    async fn test_abort_stops_at_chunk_boundary() {
        let (store, bulk, orchestrator) = setup(ScriptedBulk {
            chunks: 100,
            chunk_delay_ms: 10,
            ..Default::default()
        });

        orchestrator.move_shard("docs", 0, 1, 2).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        orchestrator.abort_transfer("docs", 0, 1, 2).await.unwrap();

        let outcome = orchestrator
            .wait_transfer("docs", key(1, 2), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(outcome, Some(TransferOutcome::Aborted));
        assert!(bulk.copied.load(Ordering::SeqCst) < 100);

        let topology = store.get_topology("docs").unwrap();
        assert_eq!(topology.replica_state(0, 2), Some(ReplicaState::Dead));
        assert_eq!(topology.replica_state(0, 1), Some(ReplicaState::Active));
        assert!(matches!(
            orchestrator.abort_transfer("docs", 0, 1, 2).await,
            Err(Error::TransferNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_cancelled_task_leaves_reissued_transfer_alone() {
        let (store, bulk, orchestrator) = setup(ScriptedBulk {
            chunks: 3,
            chunk_delay_ms: 50,
            fail_first: true,
            ..Default::default()
        });

        orchestrator.move_shard("docs", 0, 1, 2).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        orchestrator.abort_transfer("docs", 0, 1, 2).await.unwrap();

        // The first task is still retrying its chunk when the move is re-issued
        let second = orchestrator.move_shard("docs", 0, 1, 2).await.unwrap();
        assert_ne!(Some(&second), bulk.first.lock().unwrap().as_ref());

        let outcome = orchestrator
            .wait_transfer("docs", key(1, 2), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(outcome, Some(TransferOutcome::Completed));

        let topology = store.get_topology("docs").unwrap();
        assert_eq!(topology.replica_state(0, 2), Some(ReplicaState::Active));
        assert_eq!(topology.replica_state(0, 1), None);
        assert!(topology.transfers.is_empty());
        assert_eq!(store.metrics().transfers_failed.get(), 0);
        assert_eq!(bulk.copied.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_stale_transfer_does_not_finalize() {
        let (store, _bulk, orchestrator) = setup(ScriptedBulk {
            chunks: 50,
            chunk_delay_ms: 20,
            ..Default::default()
        });
        let stale = ShardTransfer::new(key(1, 2), true);
        tokio::time::sleep(Duration::from_millis(2)).await;
        let current = orchestrator.replicate_shard("docs", 0, 1, 2).await.unwrap();
        assert_ne!(stale, current);

        // A task holding an older record of the same key must not touch the new one
        assert_eq!(orchestrator.complete("docs", &stale), TransferOutcome::Aborted);
        assert_eq!(
            orchestrator.fail("docs", &stale, "old".into()).await,
            TransferOutcome::Aborted
        );
        let topology = store.get_topology("docs").unwrap();
        assert_eq!(topology.transfer(&key(1, 2)), Some(&current));
        assert_eq!(topology.replica_state(0, 2), Some(ReplicaState::Partial));
    }

    #[tokio::test]
    async fn test_dead_destination_can_be_retried() {
        let (store, bulk, orchestrator) = setup(ScriptedBulk {
            chunks: 1,
            fail: AtomicBool::new(true),
            ..Default::default()
        });

        orchestrator.move_shard("docs", 0, 1, 2).await.unwrap();
        orchestrator
            .wait_transfer("docs", key(1, 2), Duration::from_secs(5))
            .await
            .unwrap();

        bulk.fail.store(false, Ordering::SeqCst);
        orchestrator.move_shard("docs", 0, 1, 2).await.unwrap();
        let outcome = orchestrator
            .wait_transfer("docs", key(1, 2), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(outcome, Some(TransferOutcome::Completed));
        assert_eq!(
            store.get_topology("docs").unwrap().replica_state(0, 2),
            Some(ReplicaState::Active)
        );
    }

    #[tokio::test]
    async fn test_drop_last_replica_rejected() {
        let (_store, _bulk, orchestrator) = setup(ScriptedBulk::default());
        assert!(matches!(
            orchestrator.drop_replica("docs", 0, 1).await,
            Err(Error::LastLiveReplica { shard_id: 0 })
        ));
        assert!(matches!(
            orchestrator.drop_replica("docs", 0, 9).await,
            Err(Error::ReplicaNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_source_must_be_active() {
        let (_store, _bulk, orchestrator) = setup(ScriptedBulk::default());
        assert!(matches!(
            orchestrator.move_shard("docs", 0, 3, 2).await,
            Err(Error::ReplicaNotFound { peer_id: 3, .. })
        ));
        assert!(matches!(
            orchestrator.move_shard("docs", 0, 1, 1).await,
            Err(Error::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_listener_toggle() {
        let (store, _bulk, orchestrator) = setup(ScriptedBulk {
            chunks: 1,
            ..Default::default()
        });
        orchestrator.replicate_shard("docs", 0, 1, 2).await.unwrap();
        orchestrator
            .wait_transfer("docs", key(1, 2), Duration::from_secs(5))
            .await
            .unwrap();

        orchestrator.set_listener("docs", 0, 2, true).await.unwrap();
        assert_eq!(
            store.get_topology("docs").unwrap().replica_state(0, 2),
            Some(ReplicaState::Listener)
        );
        let revision = store.revision("docs").unwrap();
        orchestrator.set_listener("docs", 0, 2, true).await.unwrap();
        assert_eq!(store.revision("docs").unwrap(), revision);

        orchestrator.set_listener("docs", 0, 2, false).await.unwrap();
        assert_eq!(
            store.get_topology("docs").unwrap().replica_state(0, 2),
            Some(ReplicaState::Active)
        );
    }
}
